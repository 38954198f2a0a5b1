use crate::error::{KeeperError, Result};
use crate::ipc::{execute, socket_path, Command, Response};
use crate::models::manager::ModelManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;

/// Unix socket IPC server executing commands on a shared manager
pub struct IpcServer {
    socket_path: PathBuf,
    manager: Arc<ModelManager>,
    ready_tx: Option<oneshot::Sender<()>>,
}

impl IpcServer {
    /// Create new IPC server
    pub fn new(manager: Arc<ModelManager>) -> Result<Self> {
        Ok(Self {
            socket_path: socket_path()?,
            manager,
            ready_tx: None,
        })
    }

    /// Set ready signal channel (for testing)
    #[must_use]
    pub fn with_ready_signal(mut self, ready_tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(ready_tx);
        self
    }

    /// Override socket path (for testing)
    #[must_use]
    pub fn with_socket_path(mut self, socket_path: PathBuf) -> Self {
        self.socket_path = socket_path;
        self
    }

    /// Start IPC server
    ///
    /// Binds to the Unix socket and serves each connection on its own task.
    /// Runs until the accept loop fails or the task is dropped.
    pub async fn start(mut self) -> Result<()> {
        // Remove old socket if exists
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .map_err(|e| KeeperError::Ipc(format!("Failed to remove old socket: {e}")))?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            KeeperError::Ipc(format!(
                "Failed to bind socket at {}: {e}",
                self.socket_path.display()
            ))
        })?;

        tracing::info!("IPC server listening on {:?}", self.socket_path);

        // Signal ready if channel provided (for testing)
        if let Some(ready_tx) = self.ready_tx.take() {
            ready_tx.send(()).ok();
        }

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let manager = Arc::clone(&self.manager);
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_client(stream, manager).await {
                            tracing::error!("Client handler error: {e}");
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept connection: {e}");
                }
            }
        }
    }

    /// Handle single client connection
    async fn handle_client(stream: UnixStream, manager: Arc<ModelManager>) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut line = String::new();
        let n = BufReader::new(reader)
            .read_line(&mut line)
            .await
            .map_err(|e| KeeperError::Ipc(format!("Failed to read from client: {e}")))?;

        if n == 0 {
            return Ok(());
        }

        let response = match serde_json::from_str::<Command>(line.trim_end()) {
            Ok(cmd) => {
                tracing::debug!("Received command: {:?}", cmd);
                execute(&manager, cmd).await
            }
            Err(e) => Response::Error {
                kind: "ipc".to_string(),
                message: format!("Invalid command: {e}"),
            },
        };

        let mut response_bytes = serde_json::to_vec(&response)
            .map_err(|e| KeeperError::Ipc(format!("Failed to serialize response: {e}")))?;
        response_bytes.push(b'\n');

        writer
            .write_all(&response_bytes)
            .await
            .map_err(|e| KeeperError::Ipc(format!("Failed to write response: {e}")))?;

        Ok(())
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}
