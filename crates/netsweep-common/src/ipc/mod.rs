//! Framed IPC over Unix domain sockets.
//!
//! Every NetSweep service listens on a named socket inside the configured
//! runtime directory. Messages are framed as:
//!
//! ```text
//! [u32 LE payload length] [u32 LE message code] [payload]
//! ```
//!
//! where the payload length counts the code plus the payload bytes.
//! [`IpcServer`] accepts connections and hands `(peer, message)` pairs to
//! the owning service loop; [`IpcSocket`] is the client side.

mod server;
mod socket;

pub use server::{IpcPeer, IpcServer};
pub use socket::IpcSocket;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{NetsweepError, Result};

/// Maximum accepted frame payload (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// One framed message: a code plus its raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub code: u32,
    pub data: Vec<u8>,
}

pub(crate) async fn write_frame<W>(stream: &mut W, code: u32, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = (4 + data.len()) as u32;
    stream
        .write_all(&len.to_le_bytes())
        .await
        .map_err(|e| NetsweepError::Transport(format!("failed to write frame length: {}", e)))?;
    stream
        .write_all(&code.to_le_bytes())
        .await
        .map_err(|e| NetsweepError::Transport(format!("failed to write message code: {}", e)))?;
    stream
        .write_all(data)
        .await
        .map_err(|e| NetsweepError::Transport(format!("failed to write payload: {}", e)))?;
    stream
        .flush()
        .await
        .map_err(|e| NetsweepError::Transport(format!("failed to flush frame: {}", e)))?;
    Ok(())
}

/// Reads one frame; returns `None` when the peer closed the connection
/// cleanly before a new frame started.
pub(crate) async fn read_frame<R>(stream: &mut R) -> Result<Option<IpcMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(NetsweepError::Transport(format!(
                "failed to read frame length: {}",
                e
            )))
        }
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len < 4 || len > MAX_MESSAGE_SIZE {
        return Err(NetsweepError::Transport(format!(
            "invalid frame length {} bytes (max {})",
            len, MAX_MESSAGE_SIZE
        )));
    }

    let mut code_buf = [0u8; 4];
    stream
        .read_exact(&mut code_buf)
        .await
        .map_err(|e| NetsweepError::Transport(format!("failed to read message code: {}", e)))?;

    let mut data = vec![0u8; len - 4];
    stream
        .read_exact(&mut data)
        .await
        .map_err(|e| NetsweepError::Transport(format!("failed to read payload: {}", e)))?;

    Ok(Some(IpcMessage {
        code: u32::from_le_bytes(code_buf),
        data,
    }))
}
