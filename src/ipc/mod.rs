pub mod client;
pub mod server;

use crate::error::{KeeperError, Result};
use crate::models::local_state::InstalledModel;
use crate::models::manager::{
    CleanupReport, FailureReport, InstallRequest, Inventory, ModelManager, OperationReport,
    UpdateCandidate, UpdateSummary, VerifyResult,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Socket file name inside the runtime directory
pub const SOCKET_NAME: &str = "modelkeeper.sock";

/// IPC Commands
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Check,
    Install(InstallRequest),
    InstallMany(Vec<InstallRequest>),
    InstallRecommended,
    Update {
        model_id: Option<String>,
        force: bool,
    },
    Rollback {
        model_id: String,
        version: Option<String>,
        variant: Option<String>,
    },
    List,
    Cleanup {
        keep_count: Option<usize>,
    },
    Remove {
        model_id: String,
        variant: Option<String>,
    },
    Verify {
        model_id: Option<String>,
    },
    Refresh {
        url: String,
    },
    Touch {
        model_id: String,
        variant: Option<String>,
    },
    SetAutoUpdate(bool),
    Status,
}

/// IPC Responses
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Updates(Vec<UpdateCandidate>),
    Operation(OperationReport),
    Operations(Vec<std::result::Result<OperationReport, FailureReport>>),
    OperationFailed(FailureReport),
    UpdateSummary(UpdateSummary),
    Inventory(Inventory),
    Cleanup(CleanupReport),
    Removed(InstalledModel),
    Verified(Vec<VerifyResult>),
    Refreshed { models: usize },
    Status(DaemonStatus),
    Error { kind: String, message: String },
}

impl Response {
    fn error(err: &KeeperError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    /// Whether the command this answers failed
    #[must_use]
    pub fn is_failure(&self) -> bool {
        match self {
            Self::OperationFailed(_) | Self::Error { .. } => true,
            Self::Operations(results) => results.iter().any(std::result::Result::is_err),
            Self::UpdateSummary(summary) => !summary.failed.is_empty(),
            Self::Verified(results) => results.iter().any(|r| !r.ok),
            _ => false,
        }
    }
}

/// Manager status as seen by clients
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub app_version: String,
    pub models_dir: PathBuf,
    pub installed: usize,
    pub auto_update_enabled: bool,
    pub last_check: Option<DateTime<Utc>>,
}

/// Run one command against a manager
///
/// Used by the daemon for remote commands and by the CLI for local ones, so
/// both paths produce identical responses.
pub async fn execute(manager: &ModelManager, cmd: Command) -> Response {
    let result = match cmd {
        Command::Check => manager.check_for_updates().await.map(Response::Updates),
        Command::Install(request) => Ok(match manager.install(request).await {
            Ok(report) => Response::Operation(report),
            Err(e) => Response::OperationFailed(FailureReport::from(&e)),
        }),
        Command::InstallMany(requests) => Ok(Response::Operations(
            manager
                .install_many(requests)
                .await
                .into_iter()
                .map(|r| r.map_err(|e| FailureReport::from(&e)))
                .collect(),
        )),
        Command::InstallRecommended => manager.install_recommended().await.map(|results| {
            Response::Operations(
                results
                    .into_iter()
                    .map(|r| r.map_err(|e| FailureReport::from(&e)))
                    .collect(),
            )
        }),
        Command::Update { model_id, force } => manager
            .update(model_id.as_deref(), force)
            .await
            .map(Response::UpdateSummary),
        Command::Rollback {
            model_id,
            version,
            variant,
        } => Ok(
            match manager
                .rollback(&model_id, version.as_deref(), variant.as_deref())
                .await
            {
                Ok(report) => Response::Operation(report),
                Err(e) => Response::OperationFailed(FailureReport::from(&e)),
            },
        ),
        Command::List => manager.list().map(Response::Inventory),
        Command::Cleanup { keep_count } => manager.cleanup(keep_count).map(Response::Cleanup),
        Command::Remove { model_id, variant } => {
            Ok(match manager.remove(&model_id, variant.as_deref()).await {
                Ok(removed) => Response::Removed(removed),
                Err(e) => Response::OperationFailed(FailureReport::from(&e)),
            })
        }
        Command::Verify { model_id } => manager
            .verify_installed(model_id.as_deref())
            .await
            .map(Response::Verified),
        Command::Refresh { url } => manager
            .refresh_registry(&url)
            .await
            .map(|models| Response::Refreshed { models }),
        Command::Touch { model_id, variant } => manager
            .touch(&model_id, variant.as_deref())
            .map(|()| Response::Ok),
        Command::SetAutoUpdate(enabled) => {
            manager.state().set_auto_update(enabled).map(|()| Response::Ok)
        }
        Command::Status => status(manager).map(Response::Status),
    };

    result.unwrap_or_else(|e| Response::error(&e))
}

fn status(manager: &ModelManager) -> Result<DaemonStatus> {
    let state = manager.state().load()?;
    Ok(DaemonStatus {
        app_version: manager.app_version().to_string(),
        models_dir: manager.models_dir().to_path_buf(),
        installed: state.installed_models.len(),
        auto_update_enabled: state.auto_update_enabled,
        last_check: state.last_check,
    })
}

/// Get socket path from `XDG_RUNTIME_DIR`
pub fn socket_path() -> Result<PathBuf> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .or_else(|_| -> std::result::Result<String, std::env::VarError> {
            #[cfg(target_os = "linux")]
            {
                let uid = nix::unistd::getuid();
                Ok(format!("/run/user/{uid}"))
            }
            #[cfg(not(target_os = "linux"))]
            {
                Err(std::env::VarError::NotPresent)
            }
        })
        .map_err(|_| KeeperError::Ipc("XDG_RUNTIME_DIR not set".to_string()))?;

    Ok(PathBuf::from(runtime_dir).join(SOCKET_NAME))
}
