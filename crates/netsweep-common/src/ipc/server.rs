use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::debug;

use crate::ipc::{read_frame, write_frame, IpcMessage};
use crate::protocol::error::{NetsweepError, Result};

/// Async IPC server for a NetSweep service.
///
/// Accepts connections in a background task and funnels every received
/// frame, together with a reply handle for its connection, into a channel
/// drained by the owning service loop via [`IpcServer::recv`]. This keeps
/// the service loop single-threaded the way the scheduler expects: it
/// serves IPC only while it would otherwise sleep.
pub struct IpcServer {
    path: PathBuf,
    rx: mpsc::Receiver<(IpcPeer, IpcMessage)>,
    accept_task: tokio::task::JoinHandle<()>,
}

/// Reply handle for the connection a message arrived on.
///
/// Cloneable and cheap; sending enqueues the frame on the connection's
/// writer task, so a reply never blocks the service loop on socket I/O.
#[derive(Clone)]
pub struct IpcPeer {
    tx: mpsc::Sender<IpcMessage>,
}

impl IpcPeer {
    pub async fn send(&self, code: u32, data: &[u8]) -> Result<()> {
        self.tx
            .send(IpcMessage {
                code,
                data: data.to_vec(),
            })
            .await
            .map_err(|_| NetsweepError::Transport("client connection closed".to_string()))
    }
}

impl IpcServer {
    /// Binds the service socket, replacing a stale socket file if present.
    pub fn bind(path: &Path) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                NetsweepError::Transport(format!(
                    "cannot remove stale socket {}: {}",
                    path.display(),
                    e
                ))
            })?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path).map_err(|e| {
            NetsweepError::Transport(format!("failed to bind {}: {}", path.display(), e))
        })?;

        let (tx, rx) = mpsc::channel(64);
        let accept_task = tokio::spawn(accept_loop(listener, tx));

        Ok(Self {
            path: path.to_path_buf(),
            rx,
            accept_task,
        })
    }

    /// Waits up to `timeout` for the next message. `None` on timeout.
    pub async fn recv(&mut self, timeout: Duration) -> Option<(IpcPeer, IpcMessage)> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(received) => received,
            Err(_) => None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn accept_loop(listener: UnixListener, tx: mpsc::Sender<(IpcPeer, IpcMessage)>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(handle_connection(stream, tx.clone()));
            }
            Err(e) => {
                debug!("ipc accept failed: {}", e);
            }
        }
    }
}

/// Reads frames from one connection until the peer hangs up; replies are
/// serialised through a dedicated writer task so concurrent handlers
/// cannot interleave partial frames.
async fn handle_connection(stream: UnixStream, tx: mpsc::Sender<(IpcPeer, IpcMessage)>) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (peer_tx, mut peer_rx) = mpsc::channel::<IpcMessage>(16);

    let writer = tokio::spawn(async move {
        while let Some(message) = peer_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, message.code, &message.data).await {
                debug!("ipc reply failed: {}", e);
                break;
            }
        }
    });

    let peer = IpcPeer { tx: peer_tx };
    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(message)) => {
                if tx.send((peer.clone(), message)).await.is_err() {
                    break; // service dropped its receiver
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("ipc connection error: {}", e);
                break;
            }
        }
    }

    drop(peer);
    let _ = writer.await;
}
