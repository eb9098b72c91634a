//! Transport to peer rendezvous addresses.
//!
//! The engine only ever needs "send this frame to that onion address and
//! port" plus a reachability signal. [`Transport`] is that seam;
//! [`TransportGate`] sits in front of it so every send first waits, with a
//! bound, for the transport to be healthy.
//!
//! ## Wire Format
//!
//! On a stream, one frame per connection:
//!
//! ```text
//! ┌────────────────┬──────────────────┐      ┌──────────┐
//! │ Length (u32BE) │  Frame (type||…) │  ->  │ Status(1)│
//! └────────────────┴──────────────────┘      └──────────┘
//! ```
//!
//! A status of `0x00` means the peer accepted the frame. The receiver
//! answers once its router has validated and persisted the frame, so a
//! status of `0x02` tells the sender its handshake blob did not open under
//! the PIN. Writing the frame is bounded by the connect timeout; waiting
//! for the status is bounded separately by [`VERDICT_TIMEOUT`].

mod listener;
mod loopback;
mod tor;

pub use listener::FrameListener;
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use tor::TorTransport;

use crate::error::{Error, Result};
use crate::protocol::MAX_FRAME_SIZE;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Status byte: frame accepted.
pub const STATUS_ACCEPTED: u8 = 0x00;

/// Status byte: frame refused.
pub const STATUS_REJECTED: u8 = 0x01;

/// Status byte: handshake blob did not decrypt under the receiver's PIN.
pub const STATUS_INVALID_PIN: u8 = 0x02;

/// How long either end waits for a router's verdict.
pub(crate) const VERDICT_TIMEOUT: Duration = Duration::from_secs(120);

const PROBE_INTERVAL: Duration = Duration::from_millis(250);

/// A frame received on one of our rendezvous ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Virtual port the frame arrived on.
    pub port: u16,
    /// Raw frame bytes.
    pub frame: Vec<u8>,
}

/// A received frame plus the channel its verdict goes back on.
#[derive(Debug)]
pub struct Incoming {
    /// The frame.
    pub inbound: Inbound,
    reply: oneshot::Sender<u8>,
}

impl Incoming {
    /// Pair a frame with a verdict receiver.
    pub fn new(inbound: Inbound) -> (Self, oneshot::Receiver<u8>) {
        let (reply, rx) = oneshot::channel();
        (Self { inbound, reply }, rx)
    }

    /// Answer the sender with a status byte.
    pub fn respond(self, status: u8) {
        let _ = self.reply.send(status);
    }
}

/// Sender half handed to listeners and loopback endpoints.
pub type IncomingSender = mpsc::UnboundedSender<Incoming>;

/// Receiver half consumed by the router.
pub type IncomingReceiver = mpsc::UnboundedReceiver<Incoming>;

/// Await a verdict, treating a dropped or slow router as a refusal.
pub(crate) async fn await_verdict(rx: oneshot::Receiver<u8>) -> u8 {
    match tokio::time::timeout(VERDICT_TIMEOUT, rx).await {
        Ok(Ok(status)) => status,
        _ => STATUS_REJECTED,
    }
}

/// Map a peer's status byte to a send result.
pub(crate) fn check_status(status: u8) -> Result<()> {
    match status {
        STATUS_ACCEPTED => Ok(()),
        STATUS_INVALID_PIN => Err(Error::InvalidPin),
        other => Err(Error::Protocol(format!("peer refused frame: {:#04x}", other))),
    }
}

/// Sends frames to onion addresses.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Last known reachability.
    fn is_open(&self) -> bool;

    /// Wait up to `timeout` for the transport to become reachable.
    async fn await_open(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_open() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    }

    /// Deliver one frame.
    async fn send(&self, address: &str, port: u16, frame: &[u8]) -> Result<()>;
}

/// Reachability gate in front of a transport.
pub struct TransportGate {
    inner: Arc<dyn Transport>,
    state: watch::Sender<bool>,
    timeout: Duration,
}

impl TransportGate {
    /// Wrap `inner`. Sends wait at most `timeout` for the gate to open.
    pub fn new(inner: Arc<dyn Transport>, timeout: Duration) -> Self {
        let (state, _) = watch::channel(inner.is_open());
        Self {
            inner,
            state,
            timeout,
        }
    }

    /// Whether sends may proceed now.
    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Record a reachability change reported by the host.
    pub fn set_open(&self, open: bool) {
        let previous = self.state.send_replace(open);
        if previous != open {
            debug!(open, "transport gate changed");
        }
    }

    /// Subscribe to reachability changes.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Wait up to `timeout` for the gate to open.
    pub async fn await_open(&self, timeout: Duration) -> bool {
        if self.is_open() {
            return true;
        }
        let mut rx = self.state.subscribe();
        let opened = tokio::time::timeout(timeout, async {
            tokio::select! {
                changed = rx.wait_for(|open| *open) => changed.is_ok(),
                reached = self.inner.await_open(timeout) => reached,
            }
        })
        .await
        .unwrap_or(false);
        if opened {
            self.set_open(true);
        }
        opened
    }

    /// Wait for the gate, then send. A closed gate yields
    /// [`Error::Timeout`] and the caller's persisted item stays queued.
    pub async fn send(&self, address: &str, port: u16, frame: &[u8]) -> Result<()> {
        if !self.await_open(self.timeout).await {
            return Err(Error::Timeout);
        }
        let result = self.inner.send(address, port, frame).await;
        if result.is_err() {
            self.set_open(self.inner.is_open());
        }
        result
    }
}

impl std::fmt::Debug for TransportGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportGate")
            .field("open", &self.is_open())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Write `len || frame`.
pub(crate) async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = u32::try_from(frame.len()).map_err(|_| Error::Protocol("frame too large".into()))?;
    stream.write_all(&len.to_be_bytes()).await.map_err(unreachable)?;
    stream.write_all(frame).await.map_err(unreachable)?;
    stream.flush().await.map_err(unreachable)
}

/// Read the peer's status byte for the frame just written.
pub(crate) async fn read_status<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let mut status = [0u8; 1];
    stream.read_exact(&mut status).await.map_err(unreachable)?;
    check_status(status[0])
}

/// Read one `len || frame`, enforcing [`MAX_FRAME_SIZE`].
pub(crate) async fn read_frame<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    stream.read_exact(&mut len).await.map_err(unreachable)?;
    let len = u32::from_be_bytes(len) as usize;
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!("bad frame length {}", len)));
    }
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await.map_err(unreachable)?;
    Ok(frame)
}

pub(crate) fn unreachable(e: std::io::Error) -> Error {
    Error::Unreachable(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gate_opens_on_signal() {
        let network = LoopbackNetwork::new();
        let transport = network.transport();
        transport.set_online(false);
        let gate = Arc::new(TransportGate::new(Arc::new(transport), Duration::from_millis(50)));
        assert!(!gate.is_open());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.await_open(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gate.set_open(true);
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn test_closed_gate_times_out() {
        let network = LoopbackNetwork::new();
        let transport = network.transport();
        transport.set_online(false);
        let gate = TransportGate::new(Arc::new(transport), Duration::from_millis(20));

        let result = gate.send("peer.onion", 9150, &[1]).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_stream_framing() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let server_task = tokio::spawn(async move {
            let frame = read_frame(&mut server).await.expect("read");
            server.write_all(&[STATUS_ACCEPTED]).await.expect("status");
            frame
        });
        write_frame(&mut client, &[0x01, 0xAA]).await.expect("write");
        read_status(&mut client).await.expect("accepted");
        assert_eq!(server_task.await.expect("join"), vec![0x01, 0xAA]);
    }

    #[tokio::test]
    async fn test_invalid_pin_status() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = read_frame(&mut server).await;
            let _ = server.write_all(&[STATUS_INVALID_PIN]).await;
        });
        write_frame(&mut client, &[0x07, 0x00]).await.expect("write");
        let result = read_status(&mut client).await;
        assert!(matches!(result, Err(Error::InvalidPin)));
    }
}
