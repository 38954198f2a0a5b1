use crate::error::{KeeperError, Result};
use crate::ipc::{socket_path, Command, Response};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// IPC client for sending commands to daemon
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    /// Create new IPC client
    pub fn new() -> Result<Self> {
        Ok(Self {
            socket_path: socket_path()?,
        })
    }

    /// Create client with custom socket path (for testing)
    #[must_use]
    pub const fn with_socket_path(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    /// Send command to daemon and receive response
    ///
    /// Messages are single lines of JSON in both directions.
    pub async fn send_command(&self, cmd: &Command) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            KeeperError::Ipc(format!(
                "Could not connect to daemon at {}. Is it running? Error: {e}",
                self.socket_path.display()
            ))
        })?;
        let (reader, mut writer) = stream.into_split();

        let mut cmd_bytes = serde_json::to_vec(cmd)
            .map_err(|e| KeeperError::Ipc(format!("Failed to serialize command: {e}")))?;
        cmd_bytes.push(b'\n');

        writer
            .write_all(&cmd_bytes)
            .await
            .map_err(|e| KeeperError::Ipc(format!("Failed to send command: {e}")))?;

        let mut line = String::new();
        let n = BufReader::new(reader)
            .read_line(&mut line)
            .await
            .map_err(|e| KeeperError::Ipc(format!("Failed to read response: {e}")))?;

        if n == 0 {
            return Err(KeeperError::Ipc(
                "Connection closed before response".to_string(),
            ));
        }

        serde_json::from_str(line.trim_end())
            .map_err(|e| KeeperError::Ipc(format!("Invalid response: {e}")))
    }
}
