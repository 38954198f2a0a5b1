pub mod config;
pub mod error;
pub mod integrity;
pub mod ipc;
pub mod models;
pub mod store;
pub mod version;

pub use error::{KeeperError, OperationError, Result};
