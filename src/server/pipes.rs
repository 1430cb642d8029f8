//! Pipe manager: streamed results delivered through passed descriptors.
//!
//! Every streamed result gets its own OS pipe. The read end goes to the
//! client attached to the reply; the write end moves into a producer task
//! spawned on the runtime. The producer's outcome is only collected when the
//! client calls `FinishPipe`, which awaits the task.
//!
//! # Ordering
//!
//! ```text
//! server                               client
//! ──────                               ──────
//! create_stream ──► reply + read fd ─► spawn drain task ───┐
//!   producer task writes ─────────────── (pipe) ──────────►│
//! FinishPipe ◄──────────────────────── call FinishPipe     │
//!   finish() awaits producer                               │
//! reply ──────────────────────────────► await drain task ◄─┘
//! ```
//!
//! `finish` cannot return before the producer has written everything, and
//! the producer cannot finish while the pipe buffer is full. The client must
//! therefore drain concurrently with `FinishPipe`, never after it.

use std::collections::HashMap;
use std::future::Future;
use std::os::fd::{FromRawFd, OwnedFd};

use nix::fcntl::OFlag;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};

/// Write end of a streamed result.
pub type PipeWriter = pipe::Sender;

const COPY_BUF_SIZE: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct PipeManager {
    last_id: u32,
    pipes: HashMap<u32, JoinHandle<Result<()>>>,
}

impl PipeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pipe and start `producer` writing into it.
    ///
    /// Returns the read end, to be attached to the reply, and the pipe id.
    /// The write end is closed when the producer's future completes.
    pub fn create_stream<F, Fut>(&mut self, producer: F) -> Result<(OwnedFd, u32)>
    where
        F: FnOnce(PipeWriter) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (read_end, write_end) = os_pipe()?;
        let writer = pipe::Sender::from_owned_fd(write_end)?;
        let id = self.next_id()?;
        let task = tokio::spawn(producer(writer));
        self.pipes.insert(id, task);
        debug!(pipe_id = id, outstanding = self.pipes.len(), "created pipe");
        Ok((read_end, id))
    }

    /// Wait for the producer of `id` and return its terminal result.
    ///
    /// The id is released whether or not the producer failed.
    pub async fn finish(&mut self, id: u32) -> Result<()> {
        let task = self.pipes.remove(&id).ok_or(ProxyError::NoSuchPipe(id))?;
        let outcome = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ProxyError::Internal(format!(
                "producer for pipe {id} panicked"
            ))),
            Err(e) => Err(ProxyError::Internal(format!(
                "producer for pipe {id} did not complete: {e}"
            ))),
        };
        if let Err(e) = &outcome {
            warn!(pipe_id = id, error = %e, "producer failed");
        } else {
            debug!(pipe_id = id, "pipe finished");
        }
        outcome
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }

    fn next_id(&mut self) -> Result<u32> {
        for _ in 0..=u32::MAX {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != 0 && !self.pipes.contains_key(&self.last_id) {
                return Ok(self.last_id);
            }
        }
        Err(ProxyError::Internal("pipe ids exhausted".to_owned()))
    }
}

impl Drop for PipeManager {
    fn drop(&mut self) {
        for (id, task) in self.pipes.drain() {
            debug!(pipe_id = id, "aborting unfinished pipe");
            task.abort();
        }
    }
}

/// Producer body: write a buffer that is already in memory.
pub async fn write_all(mut writer: PipeWriter, bytes: Vec<u8>) -> Result<()> {
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Producer body: copy `reader` into the pipe, optionally checking the bytes
/// against a `sha256:` digest once the source is exhausted.
pub async fn copy_verified<R>(
    mut writer: PipeWriter,
    mut reader: R,
    expected_digest: Option<String>,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = expected_digest.as_ref().map(|_| Sha256::new());
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Some(hasher) = hasher.as_mut() {
            hasher.update(&buf[..n]);
        }
        writer.write_all(&buf[..n]).await?;
    }

    if let (Some(expected), Some(hasher)) = (expected_digest, hasher) {
        let actual = format!("sha256:{}", hex::encode(hasher.finalize()));
        if actual != expected {
            return Err(ProxyError::DigestMismatch { expected, actual });
        }
    }
    Ok(())
}

fn os_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (r, w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    // SAFETY: pipe2 just returned these descriptors and nothing else owns them.
    Ok(unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) })
}
