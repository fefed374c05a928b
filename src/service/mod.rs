pub mod daemon;
pub mod file_transfer;

pub use daemon::TransferDaemon;
pub use file_transfer::{FileTransferManager, SessionEvent, TransferHandle, TransferOptions};
