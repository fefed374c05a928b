//! Peer messaging behind one trait.
//!
//! A session talks to its peers through `Arc<dyn Transport>` and never learns
//! which binding is underneath: [`HostBus`] for real sockets, [`LocalBus`] for
//! peers living in the same process.

pub mod host_bus;
pub mod local_bus;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, warn};

use crate::network::protocol::{EventKind, PeerAddress, TransferEvent};
use crate::Result;

pub use host_bus::HostBus;
pub use local_bus::{LocalBus, LocalHub};

/// Environment variable that forces the same-process binding under `auto`.
pub const STANDALONE_ENV: &str = "DCC_TRANSFER_STANDALONE";

/// Called with the sending peer and the decoded event. Handlers run on the
/// transport's delivery path and must not block.
pub type EventHandler = Arc<dyn Fn(PeerAddress, TransferEvent) + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    fn binding(&self) -> Binding;

    /// Address peers use to reach this endpoint.
    fn local_address(&self) -> &PeerAddress;

    /// Fire-and-forget delivery. Events of one kind to one peer arrive in the
    /// order they were sent.
    async fn send(&self, peer: &PeerAddress, event: TransferEvent) -> Result<()>;

    fn subscribe(&self, kind: EventKind, handler: EventHandler) -> Subscription;

    /// Releases any connection held for `peer`.
    async fn disconnect(&self, _peer: &PeerAddress) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Host,
    Local,
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Host => write!(f, "host"),
            Binding::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingPreference {
    #[default]
    Auto,
    Host,
    Local,
}

/// Decides the binding once, at session start.
pub fn select_binding<F>(preference: BindingPreference, env: F) -> Binding
where
    F: Fn(&str) -> Option<String>,
{
    match preference {
        BindingPreference::Host => Binding::Host,
        BindingPreference::Local => Binding::Local,
        BindingPreference::Auto => match env(STANDALONE_ENV) {
            Some(value) if !value.is_empty() && value != "0" => {
                debug!("{} set, using local binding", STANDALONE_ENV);
                Binding::Local
            }
            _ => Binding::Host,
        },
    }
}

type HandlerTable = HashMap<EventKind, Vec<(u64, EventHandler)>>;

#[derive(Default)]
struct SubscriberTable {
    handlers: HandlerTable,
    next_id: u64,
}

/// Per-endpoint handler table shared by both bindings.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<SubscriberTable>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: EventKind, handler: EventHandler) -> Subscription {
        let id = match self.inner.lock() {
            Ok(mut table) => {
                let id = table.next_id;
                table.next_id += 1;
                table.handlers.entry(kind).or_default().push((id, handler));
                id
            }
            Err(e) => {
                warn!("Subscriber table poisoned: {}", e);
                u64::MAX
            }
        };

        Subscription {
            table: Arc::downgrade(&self.inner),
            kind,
            id,
            active: true,
        }
    }

    /// Delivers `event` to every handler registered for its kind. Returns the
    /// number of handlers invoked.
    pub fn dispatch(&self, from: PeerAddress, event: TransferEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = match self.inner.lock() {
            Ok(table) => table
                .handlers
                .get(&kind)
                .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default(),
            Err(e) => {
                warn!("Subscriber table poisoned: {}", e);
                return 0;
            }
        };

        if handlers.is_empty() {
            debug!("No subscriber for {} from {}", kind.event_name(), from);
            return 0;
        }

        // Handlers may publish re-entrantly, so the lock is released first.
        for handler in &handlers {
            handler(from.clone(), event.clone());
        }
        handlers.len()
    }

    #[cfg(test)]
    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.inner
            .lock()
            .map(|table| table.handlers.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

/// Registration guard returned by [`Transport::subscribe`]. The handler is
/// removed on [`unsubscribe`](Self::unsubscribe) or when the guard is dropped.
pub struct Subscription {
    table: Weak<Mutex<SubscriberTable>>,
    kind: EventKind,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;

        if let Some(table) = self.table.upgrade() {
            if let Ok(mut table) = table.lock() {
                if let Some(list) = table.handlers.get_mut(&self.kind) {
                    list.retain(|(id, _)| *id != self.id);
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
