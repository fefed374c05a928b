use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, info};

use crate::network::protocol::{AcceptAction, PeerAddress, TransferKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Complete,
    Canceled,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Complete | TransferStatus::Canceled)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Pending => write!(f, "Pending"),
            TransferStatus::InProgress => write!(f, "InProgress"),
            TransferStatus::Complete => write!(f, "Complete"),
            TransferStatus::Canceled => write!(f, "Canceled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferRecord {
    pub name: String,
    pub role: TransferRole,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    /// Receiver intent chosen at accept time.
    pub action: Option<AcceptAction>,
    /// Streamed receives only complete once the file has been finalized.
    pub finalize_required: bool,
    pub last_error: Option<String>,
}

impl TransferRecord {
    fn new(name: String, role: TransferRole, bytes_total: u64) -> Self {
        Self {
            name,
            role,
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            bytes_total,
            action: None,
            finalize_required: false,
            last_error: None,
        }
    }

    pub fn progress_percent(&self) -> f32 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f32 / self.bytes_total as f32) * 100.0
    }

    pub fn all_bytes_accounted(&self) -> bool {
        self.bytes_total > 0 && self.bytes_transferred >= self.bytes_total
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    record: TransferRecord,
}

/// Authoritative store of every transfer known to one session.
///
/// Records are never dropped implicitly; only
/// [`remove_peer`](Self::remove_peer) deletes them.
#[derive(Debug, Default)]
pub struct TransferRegistry {
    entries: HashMap<TransferKey, Entry>,
    next_seq: u64,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a fresh `Pending` record, replacing any previous record for
    /// the same key.
    pub fn create(&mut self, key: TransferKey, role: TransferRole, bytes_total: u64) -> &TransferRecord {
        let seq = self.next_seq;
        self.next_seq += 1;

        let record = TransferRecord::new(key.name.clone(), role, bytes_total);
        if let Some(previous) = self.entries.insert(key.clone(), Entry { seq, record }) {
            debug!(
                "Replaced {:?} record for {} (was {})",
                previous.record.role, key, previous.record.status
            );
        }
        &self.entries[&key].record
    }

    pub fn get(&self, key: &TransferKey) -> Option<&TransferRecord> {
        self.entries.get(key).map(|e| &e.record)
    }

    pub fn contains(&self, key: &TransferKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Adds `delta` bytes. First call moves the record to `InProgress`;
    /// reaching a non-zero total completes it unless a finalize is pending.
    /// Terminal records are left untouched.
    pub fn advance(&mut self, key: &TransferKey, delta: u64) -> Option<&TransferRecord> {
        let entry = self.entries.get_mut(key)?;
        let record = &mut entry.record;
        if record.status.is_terminal() {
            return Some(&*record);
        }

        record.bytes_transferred += delta;
        record.status = TransferStatus::InProgress;

        if record.all_bytes_accounted() && !record.finalize_required {
            record.status = TransferStatus::Complete;
            info!("Transfer {} complete ({} bytes)", key, record.bytes_transferred);
        }
        Some(&*record)
    }

    /// Counts bytes that were already on the wire when a send was canceled.
    /// The status is not touched.
    pub fn account_in_flight(&mut self, key: &TransferKey, delta: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.record.status == TransferStatus::Canceled {
                entry.record.bytes_transferred += delta;
            }
        }
    }

    /// Marks a streamed receive complete after its file was finalized.
    pub fn complete(&mut self, key: &TransferKey) -> Option<&TransferRecord> {
        let entry = self.entries.get_mut(key)?;
        let record = &mut entry.record;
        if !record.status.is_terminal() && record.all_bytes_accounted() {
            record.status = TransferStatus::Complete;
            record.finalize_required = false;
            info!("Transfer {} finalized and complete", key);
        }
        Some(&*record)
    }

    /// Idempotent; `Canceled` is terminal. A completed record stays complete.
    pub fn cancel(&mut self, key: &TransferKey) -> Option<&TransferRecord> {
        let entry = self.entries.get_mut(key)?;
        let record = &mut entry.record;
        if !record.status.is_terminal() {
            record.status = TransferStatus::Canceled;
            info!(
                "Transfer {} canceled after {} of {} bytes",
                key, record.bytes_transferred, record.bytes_total
            );
        }
        Some(&*record)
    }

    pub fn set_action(&mut self, key: &TransferKey, action: AcceptAction, finalize_required: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.record.action = Some(action);
            entry.record.finalize_required = finalize_required;
        }
    }

    /// Fills in the total when the offer carried none.
    pub fn ensure_total(&mut self, key: &TransferKey, bytes_total: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            if entry.record.bytes_total == 0 && bytes_total > 0 {
                entry.record.bytes_total = bytes_total;
            }
        }
    }

    pub fn record_error(&mut self, key: &TransferKey, error: impl Into<String>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.record.last_error = Some(error.into());
        }
    }

    /// Records for one peer, oldest first.
    pub fn list_for_peer(&self, peer: &PeerAddress) -> Vec<TransferRecord> {
        let mut entries: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|(key, _)| &key.peer == peer)
            .map(|(_, entry)| entry)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.record.clone()).collect()
    }

    /// Drops every record belonging to `peer`; returns how many were removed.
    pub fn remove_peer(&mut self, peer: &PeerAddress) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| &key.peer != peer);
        before - self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
