//! Sends frames to onion services through Tor's SOCKS5 proxy.

use super::{read_status, unreachable, write_frame, Transport, VERDICT_TIMEOUT};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::logging::RedactedOnion;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Production transport: one SOCKS5 connection per frame.
#[derive(Debug)]
pub struct TorTransport {
    socks_addr: SocketAddr,
    timeout: Duration,
    verdict_timeout: Duration,
    open: AtomicBool,
}

impl TorTransport {
    /// Transport using the proxy and timeout from `config`.
    pub fn new(config: &TransportConfig) -> Self {
        Self {
            socks_addr: config.socks_addr,
            timeout: config.connect_timeout(),
            verdict_timeout: VERDICT_TIMEOUT,
            open: AtomicBool::new(false),
        }
    }

    /// Check that the SOCKS proxy accepts connections.
    pub async fn check_proxy(&self) -> bool {
        let ok = matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect(self.socks_addr)).await,
            Ok(Ok(_))
        );
        self.open.store(ok, Ordering::Relaxed);
        ok
    }

    async fn connect(&self, address: &str, port: u16) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.socks_addr).await.map_err(|e| {
            self.open.store(false, Ordering::Relaxed);
            Error::Unreachable(format!("failed to connect to SOCKS proxy: {}", e))
        })?;
        self.open.store(true, Ordering::Relaxed);
        socks5_connect(&mut stream, address, port).await?;
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TorTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    async fn await_open(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.check_proxy().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn send(&self, address: &str, port: u16, frame: &[u8]) -> Result<()> {
        let write = async {
            let mut stream = self.connect(address, port).await?;
            write_frame(&mut stream, frame).await?;
            Ok::<_, Error>(stream)
        };
        let result = match tokio::time::timeout(self.timeout, write).await {
            Err(_) => Err(Error::Timeout),
            Ok(Err(e)) => Err(e),
            // The peer answers after persisting, which can outlast the
            // circuit setup budget.
            Ok(Ok(mut stream)) => {
                let status = tokio::time::timeout(self.verdict_timeout, read_status(&mut stream))
                    .await
                    .unwrap_or(Err(Error::Timeout));
                let _ = stream.shutdown().await;
                status
            }
        };
        if let Err(e) = &result {
            debug!(peer = %RedactedOnion(address), port, error = %e, "send failed");
        }
        result
    }
}

/// Client side of a SOCKS5 CONNECT with a domain-name target.
async fn socks5_connect(stream: &mut TcpStream, address: &str, port: u16) -> Result<()> {
    // Version 5, one method, no authentication.
    stream.write_all(&[0x05, 0x01, 0x00]).await.map_err(unreachable)?;

    let mut response = [0u8; 2];
    stream.read_exact(&mut response).await.map_err(unreachable)?;
    if response != [0x05, 0x00] {
        return Err(Error::Unreachable("SOCKS5 authentication refused".into()));
    }

    let host = address.as_bytes();
    let host_len =
        u8::try_from(host.len()).map_err(|_| Error::Protocol("hostname too long".into()))?;

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host_len]);
    request.extend_from_slice(host);
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.map_err(unreachable)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.map_err(unreachable)?;
    if header[0] != 0x05 {
        return Err(Error::Protocol("invalid SOCKS5 version in response".into()));
    }
    if header[1] != 0x00 {
        return Err(Error::Unreachable(format!("SOCKS5 connect failed: code {}", header[1])));
    }

    // Bound address: consumed and ignored.
    let skip = match header[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(unreachable)?;
            len[0] as usize + 2
        }
        _ => return Err(Error::Protocol("invalid SOCKS5 address type".into())),
    };
    let mut bound = vec![0u8; skip];
    stream.read_exact(&mut bound).await.map_err(unreachable)?;
    Ok(())
}
