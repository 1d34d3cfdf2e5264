//! Multi-socket IPC pool (unix only).
//!
//! When the browser advertises a Unix domain socket in its readiness
//! sentinel, independent commands fan out over up to `max` parallel
//! connections instead of serializing through stdin. A command claims an
//! idle socket, writes the whole line, and awaits its reply on that same
//! socket — one in-flight command per socket, so the pending table is the
//! socket itself. External semantics are identical to the stdio path.

use crate::error::IpcError;
use crate::ipc::codec::{self, IpcCommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::Semaphore;
use tracing::debug;

pub struct IpcSocketPool {
    path: PathBuf,
    /// Bounds total concurrent connections (idle + in use).
    permits: Semaphore,
    idle: Mutex<Vec<UnixStream>>,
}

impl IpcSocketPool {
    pub fn new(path: PathBuf, max: usize) -> Self {
        Self {
            path,
            permits: Semaphore::new(max),
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("pool idle lock poisoned").len()
    }

    /// Send one command and await its reply on a claimed socket.
    ///
    /// A socket whose conversation failed (timeout, I/O error, protocol
    /// mismatch) is dropped rather than returned to the free list — its
    /// stream state is unknowable.
    pub async fn call(&self, cmd: &IpcCommand, limit: Duration) -> Result<Value, IpcError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| IpcError::Stopped)?;

        let mut stream = {
            let cached = self.idle.lock().expect("pool idle lock poisoned").pop();
            match cached {
                Some(s) => s,
                None => UnixStream::connect(&self.path).await.map_err(|e| {
                    IpcError::Protocol(format!("multi-IPC connect failed: {e}"))
                })?,
            }
        };

        let line = cmd.encode();
        let exchange = async {
            stream.write_all(line.as_bytes()).await?;
            let mut reader = BufReader::new(&mut stream);
            let mut reply_line = String::new();
            let n = reader.read_line(&mut reply_line).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "socket closed",
                ));
            }
            Ok::<String, std::io::Error>(reply_line)
        };

        let reply_line = match tokio::time::timeout(limit, exchange).await {
            Err(_) => {
                debug!(id = cmd.id, "pooled command timed out — dropping socket");
                return Err(IpcError::Timeout);
            }
            Ok(Err(e)) => {
                return Err(IpcError::Protocol(format!("multi-IPC I/O error: {e}")));
            }
            Ok(Ok(l)) => l,
        };

        let reply = codec::parse_reply(reply_line.trim_end())
            .map_err(|e| IpcError::Protocol(format!("bad multi-IPC reply: {e}")))?;
        if reply.id != cmd.id {
            return Err(IpcError::Protocol(format!(
                "multi-IPC reply id mismatch: sent {}, got {}",
                cmd.id, reply.id
            )));
        }

        // Healthy conversation: the socket goes back to the free list.
        self.idle
            .lock()
            .expect("pool idle lock poisoned")
            .push(stream);

        match (reply.result, reply.error) {
            (_, Some(err)) => Err(IpcError::Browser {
                code: err.code,
                message: err.message,
            }),
            (Some(v), None) => Ok(v),
            (None, None) => Ok(Value::Null),
        }
    }
}
