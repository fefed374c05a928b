pub mod peer;
pub mod protocol;

pub use peer::{LinkTimeouts, PeerNetwork};
pub use protocol::{AcceptAction, Envelope, EventKind, PeerAddress, TransferEvent, TransferKey};
