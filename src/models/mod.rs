pub mod backup;
pub mod download;
pub mod local_state;
pub mod manager;
pub mod registry;

pub use backup::BackupManager;
pub use download::ModelDownloader;
pub use local_state::{InstalledModel, LocalState, LocalStateStore};
pub use manager::{InstallRequest, ManagerOptions, ModelManager, Stage};
pub use registry::{ModelInfo, ModelVersion, Registry, RegistryDocument};
