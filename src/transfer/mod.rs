pub mod codec;
pub mod registry;
pub mod save_target;

pub use codec::{Chunk, ChunkReader};
pub use registry::{TransferRecord, TransferRegistry, TransferRole, TransferStatus};
pub use save_target::{
    AllocateOutcome, DownloadDirChooser, FileBackend, NoopOpener, PlatformOpener, PostAction,
    SaveLocationChooser, SaveTarget, SaveTargetManager, SystemOpener, TokioFileBackend,
};
