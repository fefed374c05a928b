use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::transfer::codec;
use crate::{DccError, Result};

/// A directly addressed remote endpoint. Two sockets with the same
/// `(host, port)` are the same peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = DccError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| DccError::Config(format!("Invalid peer address '{}'", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| DccError::Config(format!("Invalid port in '{}': {}", s, e)))?;
        if host.is_empty() {
            return Err(DccError::Config(format!("Missing host in '{}'", s)));
        }
        Ok(Self::new(host, port))
    }
}

/// Identifies one transfer: the peer plus the offered file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub peer: PeerAddress,
    pub name: String,
}

impl TransferKey {
    pub fn new(peer: PeerAddress, name: impl Into<String>) -> Self {
        Self {
            peer,
            name: name.into(),
        }
    }
}

impl fmt::Display for TransferKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.peer, self.name)
    }
}

/// What the receiver intends to do once the file has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptAction {
    Open,
    #[default]
    Save,
    Play,
}

impl AcceptAction {
    /// Open and Save stream to disk; Play is assembled in memory.
    pub fn streams_to_disk(self) -> bool {
        !matches!(self, AcceptAction::Play)
    }
}

impl FromStr for AcceptAction {
    type Err = DccError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(AcceptAction::Open),
            "save" => Ok(AcceptAction::Save),
            "play" => Ok(AcceptAction::Play),
            other => Err(DccError::Config(format!("Unknown accept action '{}'", other))),
        }
    }
}

/// The four protocol messages, decoded once at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TransferEvent {
    #[serde(rename = "file_offer")]
    Offer { name: String, size: u64 },

    #[serde(rename = "file_accept")]
    Accept {
        name: String,
        #[serde(default)]
        action: AcceptAction,
    },

    #[serde(rename = "file_chunk")]
    Chunk {
        name: String,
        offset: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes_total: Option<u64>,
        #[serde(rename = "data_base64", with = "codec::base64_data")]
        data: Vec<u8>,
    },

    #[serde(rename = "file_cancel")]
    Cancel { name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Offer,
    Accept,
    Chunk,
    Cancel,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::Offer,
        EventKind::Accept,
        EventKind::Chunk,
        EventKind::Cancel,
    ];

    /// Name of the event as raised on the host bus.
    pub fn event_name(self) -> &'static str {
        match self {
            EventKind::Offer => "dcc-file-offer",
            EventKind::Accept => "dcc-file-accept",
            EventKind::Chunk => "dcc-file-chunk",
            EventKind::Cancel => "dcc-file-cancel",
        }
    }
}

impl TransferEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TransferEvent::Offer { .. } => EventKind::Offer,
            TransferEvent::Accept { .. } => EventKind::Accept,
            TransferEvent::Chunk { .. } => EventKind::Chunk,
            TransferEvent::Cancel { .. } => EventKind::Cancel,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TransferEvent::Offer { name, .. }
            | TransferEvent::Accept { name, .. }
            | TransferEvent::Chunk { name, .. }
            | TransferEvent::Cancel { name } => name,
        }
    }
}

/// Wire form used by the peer-socket layer: one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from_ip: String,
    pub from_port: u16,
    pub to_ip: String,
    pub to_port: u16,
    #[serde(flatten)]
    pub event: TransferEvent,
}

impl Envelope {
    pub fn new(from: &PeerAddress, to: &PeerAddress, event: TransferEvent) -> Self {
        Self {
            from_ip: from.host.clone(),
            from_port: from.port,
            to_ip: to.host.clone(),
            to_port: to.port,
            event,
        }
    }

    pub fn from_address(&self) -> PeerAddress {
        PeerAddress::new(self.from_ip.clone(), self.from_port)
    }

    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}
