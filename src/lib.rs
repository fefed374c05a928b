pub mod config;
pub mod error;
pub mod network;
pub mod service;
pub mod transfer;
pub mod transport;
pub mod utils;

pub use error::{DccError, Result};
