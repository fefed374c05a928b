//! Transfer session: the offer/accept/chunk/cancel state machine.
//!
//! A session is one task (`FileTransferManager::run`) that owns the registry,
//! open source files, save targets and in-memory buffers. Transport events,
//! commands from [`TransferHandle`] and the sender loop's own continuations
//! all arrive through a single queue and are handled one at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::{TransferSettings, DEFAULT_CHUNK_SIZE};
use crate::network::protocol::{AcceptAction, EventKind, PeerAddress, TransferEvent, TransferKey};
use crate::transfer::{
    AllocateOutcome, ChunkReader, PostAction, SaveTarget, SaveTargetManager, TransferRecord,
    TransferRegistry, TransferRole, TransferStatus,
};
use crate::transport::{Subscription, Transport};
use crate::utils::format_file_size;
use crate::{DccError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub chunk_size: usize,
    /// Remove `.part` files when a streamed receive is canceled.
    pub cleanup_partial_on_cancel: bool,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cleanup_partial_on_cancel: false,
        }
    }
}

impl From<&TransferSettings> for TransferOptions {
    fn from(settings: &TransferSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            cleanup_partial_on_cancel: settings.cleanup_partial_on_cancel,
        }
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    OfferReceived {
        key: TransferKey,
        size: u64,
    },
    Accepted {
        key: TransferKey,
        role: TransferRole,
        action: AcceptAction,
    },
    Progress {
        key: TransferKey,
        role: TransferRole,
        bytes_transferred: u64,
        bytes_total: u64,
    },
    /// `path` is the finalized file for streamed receives.
    Completed {
        key: TransferKey,
        role: TransferRole,
        path: Option<PathBuf>,
    },
    /// Bytes of a `play` receive, assembled in memory.
    PlaybackReady {
        key: TransferKey,
        data: Vec<u8>,
    },
    Canceled {
        key: TransferKey,
    },
    Failed {
        key: TransferKey,
        error: String,
    },
}

impl SessionEvent {
    pub fn key(&self) -> &TransferKey {
        match self {
            SessionEvent::OfferReceived { key, .. }
            | SessionEvent::Accepted { key, .. }
            | SessionEvent::Progress { key, .. }
            | SessionEvent::Completed { key, .. }
            | SessionEvent::PlaybackReady { key, .. }
            | SessionEvent::Canceled { key }
            | SessionEvent::Failed { key, .. } => key,
        }
    }

    /// True for the last event a transfer produces.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            SessionEvent::Completed { .. } | SessionEvent::Canceled { .. } | SessionEvent::Failed { .. }
        )
    }
}

enum Command {
    Inbound {
        from: PeerAddress,
        event: TransferEvent,
    },
    Offer {
        peer: PeerAddress,
        path: PathBuf,
        reply: oneshot::Sender<Result<TransferKey>>,
    },
    Accept {
        key: TransferKey,
        action: AcceptAction,
        target: Option<SaveTarget>,
        reply: oneshot::Sender<Result<()>>,
    },
    Decline {
        key: TransferKey,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        key: TransferKey,
        reply: oneshot::Sender<Result<()>>,
    },
    Get {
        key: TransferKey,
        reply: oneshot::Sender<Option<TransferRecord>>,
    },
    List {
        peer: PeerAddress,
        reply: oneshot::Sender<Vec<TransferRecord>>,
    },
    ClosePeer {
        peer: PeerAddress,
        reply: oneshot::Sender<usize>,
    },
    SendNextChunk {
        key: TransferKey,
    },
    ChunkSent {
        key: TransferKey,
        offset: u64,
        len: u64,
        result: Result<()>,
    },
    SendFailed {
        key: TransferKey,
        error: DccError,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct OutgoingTransfer {
    path: PathBuf,
    /// Opened when the peer accepts.
    reader: Option<ChunkReader>,
}

#[derive(Default)]
struct IncomingTransfer {
    action: Option<AcceptAction>,
    target: Option<SaveTarget>,
    buffer: Vec<u8>,
}

pub struct FileTransferManager {
    transport: Arc<dyn Transport>,
    save_targets: SaveTargetManager,
    options: TransferOptions,
    registry: TransferRegistry,
    outgoing: HashMap<TransferKey, OutgoingTransfer>,
    incoming: HashMap<TransferKey, IncomingTransfer>,
    continuations: mpsc::WeakUnboundedSender<Command>,
    events: mpsc::UnboundedSender<SessionEvent>,
    _subscriptions: Vec<Subscription>,
}

impl FileTransferManager {
    /// Spawns a session over `transport`. The session stops once every
    /// [`TransferHandle`] has been dropped or [`TransferHandle::shutdown`] is
    /// called.
    pub fn start(
        transport: Arc<dyn Transport>,
        save_targets: SaveTargetManager,
        options: TransferOptions,
    ) -> (TransferHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let weak_tx = command_tx.downgrade();

        let subscriptions = EventKind::ALL
            .iter()
            .map(|&kind| {
                let queue = weak_tx.clone();
                transport.subscribe(
                    kind,
                    Arc::new(move |from, event| {
                        if let Some(queue) = queue.upgrade() {
                            let _ = queue.send(Command::Inbound { from, event });
                        }
                    }),
                )
            })
            .collect();

        let handle = TransferHandle {
            commands: command_tx,
            save_targets: save_targets.clone(),
            local_address: transport.local_address().clone(),
        };

        let manager = Self {
            transport,
            save_targets,
            options: TransferOptions {
                chunk_size: options.chunk_size.max(1),
                ..options
            },
            registry: TransferRegistry::new(),
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            continuations: weak_tx,
            events: event_tx,
            _subscriptions: subscriptions,
        };

        tokio::spawn(manager.run(command_rx));
        (handle, event_rx)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!(
            "Transfer session started on {} ({} binding, {} chunks)",
            self.transport.local_address(),
            self.transport.binding(),
            format_file_size(self.options.chunk_size as u64)
        );

        while let Some(command) = commands.recv().await {
            if !self.handle_command(command).await {
                break;
            }
        }

        info!(
            "Transfer session on {} stopped ({} records)",
            self.transport.local_address(),
            self.registry.len()
        );
    }

    /// Returns `false` once the session should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Inbound { from, event } => self.handle_inbound(from, event).await,
            Command::Offer { peer, path, reply } => {
                let _ = reply.send(self.offer_file(peer, path).await);
            }
            Command::Accept {
                key,
                action,
                target,
                reply,
            } => {
                let _ = reply.send(self.accept_offer(key, action, target).await);
            }
            Command::Decline { key, reply } => {
                let _ = reply.send(self.decline_offer(key).await);
            }
            Command::Cancel { key, reply } => {
                let _ = reply.send(self.cancel_transfer(key).await);
            }
            Command::Get { key, reply } => {
                let _ = reply.send(self.registry.get(&key).cloned());
            }
            Command::List { peer, reply } => {
                let _ = reply.send(self.registry.list_for_peer(&peer));
            }
            Command::ClosePeer { peer, reply } => {
                let _ = reply.send(self.close_peer(peer).await);
            }
            Command::SendNextChunk { key } => self.send_next_chunk(key).await,
            Command::ChunkSent {
                key,
                offset,
                len,
                result,
            } => self.on_chunk_sent(key, offset, len, result).await,
            Command::SendFailed { key, error } => self.on_send_failed(key, error).await,
            Command::Shutdown { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_inbound(&mut self, from: PeerAddress, event: TransferEvent) {
        match event {
            TransferEvent::Offer { name, size } => self.on_offer(TransferKey::new(from, name), size).await,
            TransferEvent::Accept { name, action } => {
                self.on_accept(TransferKey::new(from, name), action).await
            }
            TransferEvent::Chunk {
                name,
                offset,
                bytes_total,
                data,
            } => {
                self.on_chunk(TransferKey::new(from, name), offset, bytes_total, data)
                    .await
            }
            TransferEvent::Cancel { name } => self.on_cancel(TransferKey::new(from, name)).await,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Hands a control event to the transport beside the session, so an
    /// unreachable peer never holds up other transfers. A failure comes back
    /// as `SendFailed`.
    fn send_detached(&self, key: &TransferKey, event: TransferEvent) {
        let transport = self.transport.clone();
        let queue = self.continuations.clone();
        let key = key.clone();
        tokio::spawn(async move {
            if let Err(error) = transport.send(&key.peer, event).await {
                if let Some(queue) = queue.upgrade() {
                    let _ = queue.send(Command::SendFailed { key, error });
                }
            }
        });
    }

    async fn on_send_failed(&mut self, key: TransferKey, error: DccError) {
        if self.active_role(&key).is_none() {
            debug!("Message for finished transfer {} not delivered: {}", key, error);
            return;
        }
        error!("❌ Could not reach {} for '{}': {}", key.peer, key.name, error);
        self.fail(&key, &error, false).await;
    }

    fn active_role(&self, key: &TransferKey) -> Option<TransferRole> {
        self.registry
            .get(key)
            .filter(|record| !record.status.is_terminal())
            .map(|record| record.role)
    }

    fn is_pending(&self, key: &TransferKey, role: TransferRole) -> bool {
        self.registry
            .get(key)
            .is_some_and(|record| record.role == role && record.status == TransferStatus::Pending)
    }

    // ---- sender side ----

    async fn offer_file(&mut self, peer: PeerAddress, path: PathBuf) -> Result<TransferKey> {
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| DccError::FileOperation(format!("Failed to read {:?}: {}", path, e)))?;
        if !metadata.is_file() {
            return Err(DccError::FileOperation(format!("{:?} is not a regular file", path)));
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| DccError::FileOperation(format!("{:?} has no file name", path)))?;
        let key = TransferKey::new(peer, name.clone());

        if self.active_role(&key).is_some() {
            return Err(DccError::DuplicateTransfer(name));
        }

        let size = metadata.len();
        self.registry.create(key.clone(), TransferRole::Sender, size);
        self.outgoing.insert(
            key.clone(),
            OutgoingTransfer { path, reader: None },
        );

        self.send_detached(&key, TransferEvent::Offer { name, size });

        info!(
            "📤 Offered '{}' ({}) to {}",
            key.name,
            format_file_size(size),
            key.peer
        );
        Ok(key)
    }

    async fn on_accept(&mut self, key: TransferKey, action: AcceptAction) {
        let path = match self.outgoing.get(&key) {
            Some(outgoing) if self.is_pending(&key, TransferRole::Sender) => outgoing.path.clone(),
            _ => {
                debug!("Ignoring accept for {}: no pending offer", key);
                return;
            }
        };

        let reader = match ChunkReader::open(&path, self.options.chunk_size).await {
            Ok(reader) => reader,
            Err(e) => {
                error!("Failed to open {:?} for sending: {}", path, e);
                self.fail(&key, &e, true).await;
                return;
            }
        };
        if let Some(outgoing) = self.outgoing.get_mut(&key) {
            outgoing.reader = Some(reader);
        }

        self.registry.set_action(&key, action, false);
        self.registry.advance(&key, 0);
        info!("✅ {} accepted '{}' ({:?}), sending", key.peer, key.name, action);
        self.emit(SessionEvent::Accepted {
            key: key.clone(),
            role: TransferRole::Sender,
            action,
        });
        self.schedule_next_chunk(key);
    }

    /// Queues the next step of the sender loop behind whatever is already
    /// waiting, so inbound cancels are seen between chunks.
    fn schedule_next_chunk(&self, key: TransferKey) {
        match self.continuations.upgrade() {
            Some(queue) => {
                let _ = queue.send(Command::SendNextChunk { key });
            }
            None => debug!("Session closing, not continuing {}", key),
        }
    }

    async fn send_next_chunk(&mut self, key: TransferKey) {
        if self.active_role(&key) != Some(TransferRole::Sender) {
            debug!("Sender loop for {} stopped", key);
            self.outgoing.remove(&key);
            return;
        }

        let Some(reader) = self.outgoing.get_mut(&key).and_then(|o| o.reader.as_mut()) else {
            debug!("No open source for {}", key);
            return;
        };

        let chunk = match reader.next_chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => {
                self.source_exhausted(&key).await;
                return;
            }
            Err(e) => {
                error!("Failed to read source for {}: {}", key, e);
                self.fail(&key, &e, true).await;
                return;
            }
        };

        let bytes_total = self.registry.get(&key).map_or(0, |r| r.bytes_total);
        let len = chunk.len();
        let offset = chunk.offset;
        let event = TransferEvent::Chunk {
            name: key.name.clone(),
            offset,
            bytes_total: Some(bytes_total),
            data: chunk.data,
        };

        // The write runs beside the session so a slow peer only holds up its
        // own transfer. One chunk per transfer is in flight at a time.
        let transport = self.transport.clone();
        let queue = self.continuations.clone();
        tokio::spawn(async move {
            let result = transport.send(&key.peer, event).await;
            if let Some(queue) = queue.upgrade() {
                let _ = queue.send(Command::ChunkSent {
                    key,
                    offset,
                    len,
                    result,
                });
            }
        });
    }

    async fn on_chunk_sent(&mut self, key: TransferKey, offset: u64, len: u64, result: Result<()>) {
        if let Err(e) = result {
            if self.active_role(&key) == Some(TransferRole::Sender) {
                error!("❌ Failed to send chunk at offset {} of {}: {}", offset, key, e);
                self.fail(&key, &e, false).await;
            }
            return;
        }

        if self.active_role(&key) != Some(TransferRole::Sender) {
            // Stopped while this chunk was on the wire; it still reached the peer.
            self.registry.account_in_flight(&key, len);
            return;
        }

        let Some(record) = self.registry.advance(&key, len).cloned() else {
            return;
        };
        debug!(
            "Sent chunk {}..{} of {} ({:.1}%)",
            offset,
            offset + len,
            key,
            record.progress_percent()
        );
        self.emit(SessionEvent::Progress {
            key: key.clone(),
            role: TransferRole::Sender,
            bytes_transferred: record.bytes_transferred,
            bytes_total: record.bytes_total,
        });

        if record.status == TransferStatus::Complete {
            self.outgoing.remove(&key);
            info!(
                "✅ Sent '{}' to {} ({})",
                key.name,
                key.peer,
                format_file_size(record.bytes_transferred)
            );
            self.emit(SessionEvent::Completed {
                key,
                role: TransferRole::Sender,
                path: None,
            });
        } else {
            self.schedule_next_chunk(key);
        }
    }

    async fn source_exhausted(&mut self, key: &TransferKey) {
        let (sent, total) = self
            .registry
            .get(key)
            .map_or((0, 0), |r| (r.bytes_transferred, r.bytes_total));

        let error = if sent == 0 {
            DccError::ZeroByteResult(key.name.clone())
        } else {
            DccError::FileOperation(format!(
                "Source for '{}' ended after {} of {} bytes",
                key.name, sent, total
            ))
        };
        warn!("Stopping {}: {}", key, error);
        self.fail(key, &error, true).await;
    }

    // ---- receiver side ----

    async fn on_offer(&mut self, key: TransferKey, size: u64) {
        match self.active_role(&key) {
            Some(TransferRole::Sender) => {
                warn!(
                    "Ignoring offer for {}: a send of the same name to this peer is active",
                    key
                );
                return;
            }
            Some(TransferRole::Receiver) => {
                warn!("New offer for {} supersedes the active one", key);
                self.registry.cancel(&key);
                if let Some(incoming) = self.incoming.remove(&key) {
                    self.release_incoming(incoming).await;
                }
                self.emit(SessionEvent::Canceled { key: key.clone() });
            }
            None => {}
        }

        info!(
            "📥 Offer from {}: '{}' ({})",
            key.peer,
            key.name,
            format_file_size(size)
        );
        self.registry.create(key.clone(), TransferRole::Receiver, size);
        self.incoming.insert(key.clone(), IncomingTransfer::default());
        self.emit(SessionEvent::OfferReceived { key, size });
    }

    async fn accept_offer(
        &mut self,
        key: TransferKey,
        action: AcceptAction,
        target: Option<SaveTarget>,
    ) -> Result<()> {
        if !self.is_pending(&key, TransferRole::Receiver) || !self.incoming.contains_key(&key) {
            return Err(DccError::UnknownTransferKey(key.to_string()));
        }

        self.registry.set_action(&key, action, target.is_some());
        if let Some(incoming) = self.incoming.get_mut(&key) {
            incoming.action = Some(action);
            incoming.target = target;
        }

        self.send_detached(
            &key,
            TransferEvent::Accept {
                name: key.name.clone(),
                action,
            },
        );

        info!("Accepted '{}' from {} ({:?})", key.name, key.peer, action);
        self.emit(SessionEvent::Accepted {
            key,
            role: TransferRole::Receiver,
            action,
        });
        Ok(())
    }

    async fn decline_offer(&mut self, key: TransferKey) -> Result<()> {
        if !self.is_pending(&key, TransferRole::Receiver) {
            return Err(DccError::UnknownTransferKey(key.to_string()));
        }

        info!("Declined '{}' from {}", key.name, key.peer);
        self.registry.cancel(&key);
        self.incoming.remove(&key);
        self.emit(SessionEvent::Canceled { key: key.clone() });
        self.send_detached(&key, TransferEvent::Cancel { name: key.name.clone() });
        Ok(())
    }

    async fn on_chunk(&mut self, key: TransferKey, offset: u64, bytes_total: Option<u64>, data: Vec<u8>) {
        let expected = match self.registry.get(&key) {
            Some(record) if record.role == TransferRole::Receiver && !record.status.is_terminal() => {
                if record.action.is_none() {
                    warn!("Ignoring chunk for {}: the offer has not been accepted", key);
                    return;
                }
                record.bytes_transferred
            }
            _ => {
                debug!("Ignoring chunk for unknown transfer {}", key);
                return;
            }
        };

        if let Some(total) = bytes_total.filter(|total| *total > 0) {
            self.registry.ensure_total(&key, total);
        }
        if offset != expected {
            warn!(
                "Chunk for {} starts at {} but {} bytes were received so far",
                key, offset, expected
            );
        }

        let Some(incoming) = self.incoming.get_mut(&key) else {
            debug!("No receive state for {}", key);
            return;
        };

        let written = match incoming.target.as_mut() {
            Some(target) => self.save_targets.append(target, &data).await,
            None => {
                incoming.buffer.extend_from_slice(&data);
                Ok(())
            }
        };
        if let Err(e) = written {
            error!("❌ Failed to store chunk for {}: {}", key, e);
            self.fail(&key, &e, true).await;
            return;
        }

        let Some(record) = self.registry.advance(&key, data.len() as u64).cloned() else {
            return;
        };
        self.emit(SessionEvent::Progress {
            key: key.clone(),
            role: TransferRole::Receiver,
            bytes_transferred: record.bytes_transferred,
            bytes_total: record.bytes_total,
        });

        if record.all_bytes_accounted() {
            self.finish_incoming(key).await;
        }
    }

    async fn finish_incoming(&mut self, key: TransferKey) {
        let Some(incoming) = self.incoming.remove(&key) else {
            return;
        };
        let action = incoming.action.unwrap_or_default();

        match incoming.target {
            Some(target) => match self.save_targets.finalize(&target, PostAction::from(action)).await {
                Ok(path) => {
                    self.registry.complete(&key);
                    info!("✅ Received '{}' from {} into {:?}", key.name, key.peer, path);
                    self.emit(SessionEvent::Completed {
                        key,
                        role: TransferRole::Receiver,
                        path: Some(path),
                    });
                }
                Err(e) => {
                    error!("❌ Failed to finalize {}: {}", key, e);
                    self.fail(&key, &e, false).await;
                }
            },
            None => {
                self.registry.complete(&key);
                info!(
                    "✅ Received '{}' from {} in memory ({})",
                    key.name,
                    key.peer,
                    format_file_size(incoming.buffer.len() as u64)
                );
                self.emit(SessionEvent::PlaybackReady {
                    key: key.clone(),
                    data: incoming.buffer,
                });
                self.emit(SessionEvent::Completed {
                    key,
                    role: TransferRole::Receiver,
                    path: None,
                });
            }
        }
    }

    // ---- either side ----

    async fn on_cancel(&mut self, key: TransferKey) {
        if self.active_role(&key).is_none() {
            debug!("Ignoring cancel for unknown or finished transfer {}", key);
            return;
        }

        info!("Peer {} canceled '{}'", key.peer, key.name);
        self.stop_locally(&key).await;
        self.emit(SessionEvent::Canceled { key });
    }

    async fn cancel_transfer(&mut self, key: TransferKey) -> Result<()> {
        if !self.registry.contains(&key) {
            return Err(DccError::UnknownTransferKey(key.to_string()));
        }
        if self.active_role(&key).is_none() {
            debug!("Cancel of finished transfer {} ignored", key);
            return Ok(());
        }

        info!("Canceling '{}' with {}", key.name, key.peer);
        self.stop_locally(&key).await;
        self.emit(SessionEvent::Canceled { key: key.clone() });
        self.send_detached(&key, TransferEvent::Cancel { name: key.name.clone() });
        Ok(())
    }

    async fn stop_locally(&mut self, key: &TransferKey) {
        self.registry.cancel(key);
        self.outgoing.remove(key);
        if let Some(incoming) = self.incoming.remove(key) {
            self.release_incoming(incoming).await;
        }
    }

    async fn release_incoming(&self, incoming: IncomingTransfer) {
        if let Some(target) = incoming.target {
            if self.options.cleanup_partial_on_cancel {
                self.save_targets.discard(&target).await;
            } else if target.bytes_written > 0 {
                info!(
                    "Keeping partial file {:?} ({})",
                    target.temporary_path,
                    format_file_size(target.bytes_written)
                );
            }
        }
    }

    /// Ends a transfer with an error. Partial files stay on disk.
    async fn fail(&mut self, key: &TransferKey, error: &DccError, notify_peer: bool) {
        let message = error.to_string();
        self.registry.record_error(key, message.clone());
        self.registry.cancel(key);
        self.outgoing.remove(key);
        self.incoming.remove(key);

        if notify_peer {
            self.send_detached(key, TransferEvent::Cancel { name: key.name.clone() });
        }

        self.emit(SessionEvent::Failed {
            key: key.clone(),
            error: message,
        });
    }

    async fn close_peer(&mut self, peer: PeerAddress) -> usize {
        let records = self.registry.list_for_peer(&peer);
        let mut cancels = Vec::new();
        for record in records.iter().filter(|r| !r.status.is_terminal()) {
            let key = TransferKey::new(peer.clone(), record.name.clone());
            self.stop_locally(&key).await;
            cancels.push(TransferEvent::Cancel {
                name: record.name.clone(),
            });
            self.emit(SessionEvent::Canceled { key });
        }

        // Cancels go out before the connection is released.
        let transport = self.transport.clone();
        let closing = peer.clone();
        tokio::spawn(async move {
            for cancel in cancels {
                if let Err(e) = transport.send(&closing, cancel).await {
                    debug!("Cancel to {} not delivered: {}", closing, e);
                }
            }
            transport.disconnect(&closing).await;
        });

        let removed = self.registry.remove_peer(&peer);
        info!("Closed session with {} ({} transfers dropped)", peer, removed);
        removed
    }
}

/// Cloneable command interface to a running session.
#[derive(Clone)]
pub struct TransferHandle {
    commands: mpsc::UnboundedSender<Command>,
    save_targets: SaveTargetManager,
    local_address: PeerAddress,
}

impl TransferHandle {
    pub fn local_address(&self) -> &PeerAddress {
        &self.local_address
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .map_err(|_| DccError::SessionClosed)?;
        reply_rx.await.map_err(|_| DccError::SessionClosed)
    }

    /// Offers a local file to `peer`. Nothing is sent until the peer accepts.
    /// A peer that cannot be reached shows up as `SessionEvent::Failed`.
    pub async fn offer_file(&self, peer: PeerAddress, path: impl AsRef<Path>) -> Result<TransferKey> {
        let path = path.as_ref().to_path_buf();
        self.request(|reply| Command::Offer { peer, path, reply }).await?
    }

    /// Accepts a pending offer. For `open` and `save` the destination is
    /// chosen and the temporary file prepared before the peer is told to
    /// start sending; declining the destination declines the offer.
    pub async fn accept_offer(&self, key: &TransferKey, action: AcceptAction) -> Result<()> {
        let target = if action.streams_to_disk() {
            match self.save_targets.allocate(&key.name).await {
                Ok(AllocateOutcome::Ready(target)) => Some(target),
                Ok(AllocateOutcome::Canceled) => {
                    self.decline_offer(key).await?;
                    return Err(DccError::SaveTargetUnavailable(format!(
                        "no save location chosen for '{}'",
                        key.name
                    )));
                }
                Err(e) => {
                    if let Err(decline_error) = self.decline_offer(key).await {
                        debug!("Decline after failed allocation: {}", decline_error);
                    }
                    return Err(e);
                }
            }
        } else {
            None
        };

        let key = key.clone();
        self.request(|reply| Command::Accept {
            key,
            action,
            target,
            reply,
        })
        .await?
    }

    pub async fn decline_offer(&self, key: &TransferKey) -> Result<()> {
        let key = key.clone();
        self.request(|reply| Command::Decline { key, reply }).await?
    }

    /// Cancels locally and tells the peer. Canceling a finished transfer is a
    /// no-op.
    pub async fn cancel_transfer(&self, key: &TransferKey) -> Result<()> {
        let key = key.clone();
        self.request(|reply| Command::Cancel { key, reply }).await?
    }

    pub async fn transfer(&self, key: &TransferKey) -> Result<Option<TransferRecord>> {
        let key = key.clone();
        self.request(|reply| Command::Get { key, reply }).await
    }

    pub async fn list_for_peer(&self, peer: &PeerAddress) -> Result<Vec<TransferRecord>> {
        let peer = peer.clone();
        self.request(|reply| Command::List { peer, reply }).await
    }

    /// Cancels every active transfer with `peer` and forgets its records.
    pub async fn close_peer(&self, peer: &PeerAddress) -> Result<usize> {
        let peer = peer.clone();
        self.request(|reply| Command::ClosePeer { peer, reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
