pub mod settings;

pub use settings::{Settings, TransferSettings, DEFAULT_CHUNK_SIZE};
