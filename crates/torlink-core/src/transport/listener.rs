//! Local TCP listener behind an onion service port.
//!
//! Tor forwards each virtual port to a local port. A [`FrameListener`]
//! accepts on that local port, reads one frame per connection, hands it to
//! the router tagged with the virtual port it arrived on, and writes the
//! router's verdict back as the status byte.

use super::{await_verdict, read_frame, Inbound, Incoming, IncomingSender, STATUS_REJECTED};
use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Accepts frames for one virtual port.
#[derive(Debug)]
pub struct FrameListener {
    listener: TcpListener,
    virtual_port: u16,
}

impl FrameListener {
    /// Bind `local` for frames arriving on `virtual_port`.
    pub async fn bind(local: SocketAddr, virtual_port: u16) -> Result<Self> {
        let listener = TcpListener::bind(local).await.map_err(|e| {
            Error::Unreachable(format!("failed to bind listener on {}: {}", local, e))
        })?;
        info!(virtual_port, "bound local listener");
        Ok(Self {
            listener,
            virtual_port,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `shutdown` flips to true.
    pub async fn run(self, tx: IncomingSender, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _)) => {
                    let tx = tx.clone();
                    let port = self.virtual_port;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, port, tx).await {
                            warn!(error = %e, "error handling incoming connection");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!(virtual_port = self.virtual_port, "listener stopped");
    }
}

async fn handle_connection(mut stream: TcpStream, port: u16, tx: IncomingSender) -> Result<()> {
    let frame = match read_frame(&mut stream).await {
        Ok(frame) => frame,
        Err(e) => {
            let _ = stream.write_all(&[STATUS_REJECTED]).await;
            return Err(e);
        }
    };
    debug!(port, len = frame.len(), "frame received");

    let (incoming, verdict) = Incoming::new(Inbound { port, frame });
    let status = if tx.send(incoming).is_ok() {
        await_verdict(verdict).await
    } else {
        STATUS_REJECTED
    };
    stream.write_all(&[status]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{read_status, write_frame, STATUS_ACCEPTED};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_accepts_frames_until_shutdown() {
        let listener = FrameListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)), 9153)
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(listener.run(tx, shutdown));

        let router = tokio::spawn(async move {
            let incoming: Incoming = rx.recv().await.expect("inbound");
            let inbound = incoming.inbound.clone();
            incoming.respond(STATUS_ACCEPTED);
            inbound
        });

        let mut client = TcpStream::connect(addr).await.expect("connect");
        write_frame(&mut client, &[0x06, 9]).await.expect("write");
        read_status(&mut client).await.expect("accepted");
        assert_eq!(
            router.await.expect("join"),
            Inbound { port: 9153, frame: vec![0x06, 9] }
        );

        stop.send(true).expect("stop");
        task.await.expect("join");
    }
}
