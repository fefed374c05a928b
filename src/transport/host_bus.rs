use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{Binding, EventHandler, Subscribers, Subscription, Transport};
use crate::network::peer::{LinkTimeouts, PeerNetwork};
use crate::network::protocol::{EventKind, PeerAddress, TransferEvent};
use crate::Result;

/// Production binding over the peer-socket layer.
pub struct HostBus {
    network: PeerNetwork,
    subscribers: Subscribers,
    pump: JoinHandle<()>,
}

impl HostBus {
    pub async fn bind(bind_addr: SocketAddr, advertise_host: &str, timeouts: LinkTimeouts) -> Result<Self> {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let network = PeerNetwork::bind(bind_addr, advertise_host, timeouts, inbound_tx).await?;
        let subscribers = Subscribers::new();

        let dispatcher = subscribers.clone();
        let pump = tokio::spawn(async move {
            while let Some((from, event)) = inbound_rx.recv().await {
                dispatcher.dispatch(from, event);
            }
            debug!("Host bus pump stopped");
        });

        Ok(Self {
            network,
            subscribers,
            pump,
        })
    }
}

#[async_trait]
impl Transport for HostBus {
    fn binding(&self) -> Binding {
        Binding::Host
    }

    fn local_address(&self) -> &PeerAddress {
        self.network.local_address()
    }

    async fn send(&self, peer: &PeerAddress, event: TransferEvent) -> Result<()> {
        self.network.send(peer, event).await
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        self.subscribers.add(kind, handler)
    }

    async fn disconnect(&self, peer: &PeerAddress) {
        if self.network.disconnect(peer) {
            debug!("Closed connection to {}", peer);
        }
    }
}

impl Drop for HostBus {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
