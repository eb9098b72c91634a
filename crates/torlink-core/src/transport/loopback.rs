//! In-process transport.
//!
//! A [`LoopbackNetwork`] maps onion addresses to channels. Engines in the
//! same process register their addresses and exchange frames without Tor.

use super::{await_verdict, check_status, Inbound, Incoming, IncomingReceiver, IncomingSender, Transport};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Default)]
struct NetworkState {
    peers: HashMap<String, IncomingSender>,
    unreachable: HashSet<String>,
}

/// Shared routing table for loopback transports.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start receiving frames addressed to `address`.
    pub fn register(&self, address: &str) -> IncomingReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            state.peers.insert(address.to_string(), tx);
        }
        rx
    }

    /// Route several addresses into one receiver.
    pub fn register_all(&self, addresses: &[&str]) -> IncomingReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut state) = self.state.lock() {
            for address in addresses {
                state.peers.insert(address.to_string(), tx.clone());
            }
        }
        rx
    }

    /// Simulate a peer whose onion service is down.
    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            if reachable {
                state.unreachable.remove(address);
            } else {
                state.unreachable.insert(address.to_string());
            }
        }
    }

    /// A transport sending into this network.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            online: AtomicBool::new(true),
        }
    }

    fn peer(&self, address: &str) -> Result<IncomingSender> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::Unreachable("network lock poisoned".into()))?;
        if state.unreachable.contains(address) {
            return Err(Error::Unreachable("peer offline".into()));
        }
        state
            .peers
            .get(address)
            .cloned()
            .ok_or_else(|| Error::Unreachable("no such peer".into()))
    }

    async fn deliver(&self, address: &str, inbound: Inbound) -> Result<()> {
        let peer = self.peer(address)?;
        let (incoming, verdict) = Incoming::new(inbound);
        peer.send(incoming)
            .map_err(|_| Error::Unreachable("peer stopped".into()))?;
        check_status(await_verdict(verdict).await)
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoopbackNetwork")
    }
}

/// One endpoint's view of a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    online: AtomicBool,
}

impl LoopbackTransport {
    /// Simulate local connectivity loss.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn is_open(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    async fn send(&self, address: &str, port: u16, frame: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Unreachable("transport offline".into()));
        }
        self.network
            .deliver(
                address,
                Inbound {
                    port,
                    frame: frame.to_vec(),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_by_address() {
        let network = LoopbackNetwork::new();
        let mut bob = network.register("bob.onion");
        let alice = network.transport();

        let receiver = tokio::spawn(async move {
            let incoming = bob.recv().await.expect("frame");
            let inbound = incoming.inbound.clone();
            incoming.respond(crate::transport::STATUS_ACCEPTED);
            inbound
        });
        alice.send("bob.onion", 9150, &[1, 2]).await.expect("send");
        let inbound = receiver.await.expect("join");
        assert_eq!(inbound.port, 9150);
        assert_eq!(inbound.frame, vec![1, 2]);

        assert!(matches!(
            alice.send("carol.onion", 9150, &[1]).await,
            Err(Error::Unreachable(_))
        ));

        network.set_reachable("bob.onion", false);
        assert!(alice.send("bob.onion", 9150, &[1]).await.is_err());
    }
}
