use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::{Binding, EventHandler, Subscribers, Subscription, Transport};
use crate::network::protocol::{EventKind, PeerAddress, TransferEvent};
use crate::{DccError, Result};

/// Same-process rendezvous point. Every [`LocalBus`] joined to a hub can
/// reach every other one by address.
#[derive(Clone, Default)]
pub struct LocalHub {
    endpoints: Arc<Mutex<HashMap<PeerAddress, Subscribers>>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint under `address`, replacing any previous one.
    pub fn join(&self, address: PeerAddress) -> LocalBus {
        let subscribers = Subscribers::new();
        match self.endpoints.lock() {
            Ok(mut endpoints) => {
                if endpoints.insert(address.clone(), subscribers.clone()).is_some() {
                    warn!("Local endpoint {} re-joined the hub", address);
                }
            }
            Err(e) => warn!("Local hub poisoned: {}", e),
        }
        info!("Local endpoint {} joined", address);

        LocalBus {
            hub: self.clone(),
            address,
            subscribers,
        }
    }

    #[cfg(test)]
    fn endpoint_count(&self) -> usize {
        self.endpoints.lock().map(|e| e.len()).unwrap_or(0)
    }

    fn lookup(&self, address: &PeerAddress) -> Option<Subscribers> {
        self.endpoints
            .lock()
            .ok()
            .and_then(|endpoints| endpoints.get(address).cloned())
    }

    fn leave(&self, address: &PeerAddress, subscribers: &Subscribers) {
        if let Ok(mut endpoints) = self.endpoints.lock() {
            let owned = endpoints
                .get(address)
                .is_some_and(|current| Arc::ptr_eq(&current.inner, &subscribers.inner));
            if owned {
                endpoints.remove(address);
                debug!("Local endpoint {} left", address);
            }
        }
    }
}

/// In-process binding. Delivery is synchronous: by the time `publish`
/// returns, the addressee's handlers have run.
pub struct LocalBus {
    hub: LocalHub,
    address: PeerAddress,
    subscribers: Subscribers,
}

impl LocalBus {
    pub fn publish(&self, peer: &PeerAddress, event: TransferEvent) -> Result<()> {
        let target = self.hub.lookup(peer).ok_or_else(|| {
            DccError::Transport(format!("No local endpoint registered at {}", peer))
        })?;

        debug!(
            "Local {} -> {}: {} '{}'",
            self.address,
            peer,
            event.kind().event_name(),
            event.name()
        );
        target.dispatch(self.address.clone(), event);
        Ok(())
    }
}

#[async_trait]
impl Transport for LocalBus {
    fn binding(&self) -> Binding {
        Binding::Local
    }

    fn local_address(&self) -> &PeerAddress {
        &self.address
    }

    async fn send(&self, peer: &PeerAddress, event: TransferEvent) -> Result<()> {
        self.publish(peer, event)
    }

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        self.subscribers.add(kind, handler)
    }
}

impl Drop for LocalBus {
    fn drop(&mut self) {
        self.hub.leave(&self.address, &self.subscribers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(name: &str) -> TransferEvent {
        TransferEvent::Offer {
            name: name.to_string(),
            size: 10,
        }
    }

    #[tokio::test]
    async fn test_delivery_is_addressed_and_tagged_with_sender() {
        let hub = LocalHub::new();
        let alice = hub.join(PeerAddress::new("alice", 1));
        let bob = hub.join(PeerAddress::new("bob", 2));
        let carol = hub.join(PeerAddress::new("carol", 3));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = bob.subscribe(
            EventKind::Offer,
            Arc::new(move |from, event| {
                let _ = tx.send((from, event));
            }),
        );
        let (carol_tx, mut carol_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        let _carol_sub = carol.subscribe(
            EventKind::Offer,
            Arc::new(move |_, _| {
                let _ = carol_tx.send(());
            }),
        );

        alice.send(bob.local_address(), offer("a.txt")).await.unwrap();
        alice.send(bob.local_address(), offer("b.txt")).await.unwrap();

        let (from, first) = rx.recv().await.unwrap();
        assert_eq!(from, PeerAddress::new("alice", 1));
        assert_eq!(first.name(), "a.txt");
        assert_eq!(rx.recv().await.unwrap().1.name(), "b.txt");
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_peer_is_a_transport_error() {
        let hub = LocalHub::new();
        let alice = hub.join(PeerAddress::new("alice", 1));
        let result = alice.send(&PeerAddress::new("nobody", 9), offer("x")).await;
        assert!(matches!(result, Err(DccError::Transport(_))));
    }

    #[test]
    fn test_drop_leaves_hub() {
        let hub = LocalHub::new();
        let alice = hub.join(PeerAddress::new("alice", 1));
        assert_eq!(hub.endpoint_count(), 1);
        drop(alice);
        assert_eq!(hub.endpoint_count(), 0);
    }
}
