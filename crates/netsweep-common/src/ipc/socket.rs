use std::path::Path;
use std::time::Duration;

use tokio::net::UnixStream;

use crate::ipc::{read_frame, write_frame, IpcMessage};
use crate::protocol::error::{NetsweepError, Result};

/// Default timeout for client connect and request round-trips (5 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of a NetSweep IPC socket.
///
/// # Example
///
/// ```no_run
/// use netsweep_common::ipc::IpcSocket;
/// use netsweep_common::protocol::DiscovererRequest;
///
/// # async fn example() -> netsweep_common::Result<()> {
/// let mut sock = IpcSocket::connect("/run/netsweep/discoverer.sock".as_ref()).await?;
/// let reply = sock.request(DiscovererRequest::Queue.code(), &[]).await?;
/// # Ok(())
/// # }
/// ```
pub struct IpcSocket {
    stream: UnixStream,
}

impl IpcSocket {
    /// Connects to a service socket.
    pub async fn connect(path: &Path) -> Result<Self> {
        let stream = tokio::time::timeout(DEFAULT_TIMEOUT, UnixStream::connect(path))
            .await
            .map_err(|_| NetsweepError::Timeout(DEFAULT_TIMEOUT.as_millis() as u64))?
            .map_err(|e| {
                NetsweepError::Transport(format!("failed to connect {}: {}", path.display(), e))
            })?;
        Ok(Self { stream })
    }

    /// Sends one frame without waiting for a reply (notifications).
    pub async fn send(&mut self, code: u32, data: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, code, data).await
    }

    /// Receives the next frame.
    pub async fn recv(&mut self) -> Result<IpcMessage> {
        match tokio::time::timeout(DEFAULT_TIMEOUT, read_frame(&mut self.stream)).await {
            Ok(Ok(Some(message))) => Ok(message),
            Ok(Ok(None)) => Err(NetsweepError::Transport(
                "connection closed by service".to_string(),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NetsweepError::Timeout(DEFAULT_TIMEOUT.as_millis() as u64)),
        }
    }

    /// Sends a request and waits for its reply.
    pub async fn request(&mut self, code: u32, data: &[u8]) -> Result<IpcMessage> {
        self.send(code, data).await?;
        self.recv().await
    }
}
