//! Client side of the image proxy protocol.
//!
//! [`ImageProxy`] owns the control connection (and, when it spawned the
//! server, the child process). Calls are serialized through an async mutex
//! so at most one request is ever outstanding.
//!
//! Streamed results arrive as a pipe read end. The server only answers
//! `FinishPipe` once its producer has written everything, so the bytes must
//! be read concurrently with that call; [`ImageProxy::get_manifest`],
//! [`ImageProxy::get_config`] and [`ImageProxy::read_blob`] do this for you.
//! Callers streaming a blob themselves with [`ImageProxy::get_blob`] must do
//! the same before (or while) calling [`ImageProxy::finish_pipe`].

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::framing::Connection;
use crate::protocol::{check_version, Method, Reply, Request};

/// Descriptor number the child finds its socket at.
pub const CHILD_SOCKFD: i32 = 3;

/// How to start the proxy server process.
#[derive(Debug, Clone)]
pub struct ProxyCommandConfig {
    /// Executable implementing `experimental-image-proxy`
    pub program: PathBuf,
    /// Extra arguments appended after `--sockfd`
    pub args: Vec<OsString>,
}

impl ProxyCommandConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Run the server from the currently executing binary.
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// A streamed result: the pipe id to finish and the bytes to read.
#[derive(Debug)]
pub struct PipeStream {
    id: u32,
    reader: pipe::Receiver,
}

impl PipeStream {
    fn new(id: u32, fd: OwnedFd) -> Result<Self> {
        Ok(Self {
            id,
            reader: pipe::Receiver::from_owned_fd(fd)?,
        })
    }

    /// Id to pass to [`ImageProxy::finish_pipe`].
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl AsyncRead for PipeStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

/// Connection to an image proxy server.
#[derive(Debug)]
pub struct ImageProxy {
    conn: Mutex<Connection>,
    child: Mutex<Option<Child>>,
    protocol_version: String,
    /// Set once a transport error has left the channel unusable
    broken: AtomicBool,
}

impl ImageProxy {
    /// Start a proxy subprocess and initialize it.
    pub async fn spawn(config: ProxyCommandConfig) -> Result<Self> {
        let (conn, theirs) = Connection::pair_for_child()?;
        let child_fd = theirs.as_raw_fd();

        let mut cmd = Command::new(&config.program);
        cmd.arg("experimental-image-proxy")
            .arg("--sockfd")
            .arg(CHILD_SOCKFD.to_string())
            .args(&config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        // SAFETY: the closure only makes async-signal-safe syscalls.
        unsafe {
            cmd.pre_exec(move || install_child_socket(child_fd));
        }

        let child = cmd.spawn().map_err(|e| {
            ProxyError::ProcessFailed(format!("spawning {}: {e}", config.program.display()))
        })?;
        drop(theirs);
        debug!(pid = ?child.id(), program = %config.program.display(), "spawned proxy");

        Self::initialize(conn, Some(child)).await
    }

    /// Initialize a proxy over an already connected socket.
    pub async fn from_connection(conn: Connection) -> Result<Self> {
        Self::initialize(conn, None).await
    }

    async fn initialize(conn: Connection, child: Option<Child>) -> Result<Self> {
        let mut proxy = Self {
            conn: Mutex::new(conn),
            child: Mutex::new(child),
            protocol_version: String::new(),
            broken: AtomicBool::new(false),
        };
        let value = proxy.call_no_fd(Method::Initialize, vec![]).await?;
        let version = value
            .as_str()
            .ok_or_else(|| malformed(Method::Initialize, &value))?;
        check_version(version)?;
        info!(version, "image proxy initialized");
        proxy.protocol_version = version.to_owned();
        Ok(proxy)
    }

    /// Version string the server reported.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Send one request and wait for its reply.
    ///
    /// Returns the reply value and, for streamed results, the pipe id with
    /// its read end.
    pub async fn call(
        &self,
        method: Method,
        args: Vec<Value>,
    ) -> Result<(Value, Option<(u32, OwnedFd)>)> {
        if self.broken.load(Ordering::Acquire) {
            return Err(ProxyError::ConnectionClosed);
        }
        let payload = serde_json::to_vec(&Request::new(method, args))?;
        let exchanged = {
            let conn = self.conn.lock().await;
            // A call abandoned while we waited for the lock may have left a
            // reply behind.
            if self.broken.load(Ordering::Acquire) {
                return Err(ProxyError::ConnectionClosed);
            }
            let in_flight = InFlight::new(&self.broken, method);
            let exchanged = exchange(&conn, method, &payload).await;
            in_flight.complete();
            exchanged
        };
        let (reply, fd) = exchanged.map_err(|e| {
            if e.is_transport() {
                warn!(%method, error = %e, "control connection unusable");
                self.broken.store(true, Ordering::Release);
            }
            e
        })?;

        if !reply.success {
            return Err(ProxyError::Remote {
                method: method.to_string(),
                message: reply.error,
            });
        }
        match (reply.pipe_id, fd) {
            (0, None) => Ok((reply.value, None)),
            (0, Some(_)) => Err(ProxyError::MalformedReply(format!(
                "{method}: descriptor attached without a pipe id"
            ))),
            (id, Some(fd)) => Ok((reply.value, Some((id, fd)))),
            (id, None) => Err(ProxyError::MalformedReply(format!(
                "{method}: pipe id {id} without a descriptor"
            ))),
        }
    }

    async fn call_no_fd(&self, method: Method, args: Vec<Value>) -> Result<Value> {
        match self.call(method, args).await? {
            (value, None) => Ok(value),
            (_, Some((id, _))) => Err(ProxyError::MalformedReply(format!(
                "{method}: unexpected pipe {id}"
            ))),
        }
    }

    async fn call_with_pipe(&self, method: Method, args: Vec<Value>) -> Result<(Value, PipeStream)> {
        match self.call(method, args).await? {
            (value, Some((id, fd))) => match PipeStream::new(id, fd) {
                Ok(stream) => Ok((value, stream)),
                Err(e) => {
                    // Our end is closed already, so the producer stops.
                    if let Err(finish) = self.finish_pipe(id).await {
                        warn!(pipe_id = id, error = %finish, "finishing abandoned pipe");
                    }
                    Err(e)
                }
            },
            (value, None) => Err(malformed(method, &value)),
        }
    }

    /// Open an image, failing if it does not exist.
    pub async fn open_image(&self, reference: &str) -> Result<u32> {
        let value = self.call_no_fd(Method::OpenImage, vec![json!(reference)]).await?;
        as_id(Method::OpenImage, &value)
    }

    /// Open an image, returning `None` if it does not exist.
    pub async fn open_image_optional(&self, reference: &str) -> Result<Option<u32>> {
        let value = self
            .call_no_fd(Method::OpenImageOptional, vec![json!(reference)])
            .await?;
        let id = as_id(Method::OpenImageOptional, &value)?;
        Ok((id != 0).then_some(id))
    }

    pub async fn close_image(&self, image: u32) -> Result<()> {
        self.call_no_fd(Method::CloseImage, vec![json!(image)]).await?;
        Ok(())
    }

    /// Fetch the raw manifest and its digest.
    pub async fn get_manifest(&self, image: u32) -> Result<(String, Vec<u8>)> {
        let (value, stream) = self
            .call_with_pipe(Method::GetManifest, vec![json!(image)])
            .await?;
        let bytes = self.drain_and_finish(stream).await?;
        let digest = value
            .as_str()
            .ok_or_else(|| malformed(Method::GetManifest, &value))?;
        Ok((digest.to_owned(), bytes))
    }

    /// Fetch the raw config blob.
    pub async fn get_config(&self, image: u32) -> Result<Vec<u8>> {
        let (_, stream) = self
            .call_with_pipe(Method::GetConfig, vec![json!(image)])
            .await?;
        self.drain_and_finish(stream).await
    }

    /// Start streaming a blob.
    ///
    /// The returned stream must be read concurrently with
    /// [`finish_pipe`](Self::finish_pipe), which reports whether the bytes
    /// were complete.
    pub async fn get_blob(&self, image: u32, digest: &str, size: i64) -> Result<(u64, PipeStream)> {
        let (value, stream) = self
            .call_with_pipe(Method::GetBlob, vec![json!(image), json!(digest), json!(size)])
            .await?;
        match value.as_u64() {
            Some(size) => Ok((size, stream)),
            None => {
                let err = malformed(Method::GetBlob, &value);
                drop(stream.reader);
                if let Err(finish) = self.finish_pipe(stream.id).await {
                    warn!(pipe_id = stream.id, error = %finish, "finishing abandoned pipe");
                }
                Err(err)
            }
        }
    }

    /// Collect a whole blob in memory.
    pub async fn read_blob(&self, image: u32, digest: &str, size: i64) -> Result<Vec<u8>> {
        let (_, stream) = self.get_blob(image, digest, size).await?;
        self.drain_and_finish(stream).await
    }

    /// Stream a blob into `writer`.
    ///
    /// Returns the byte count and the writer once the server has confirmed
    /// the stream was complete.
    pub async fn copy_blob<W>(&self, image: u32, digest: &str, size: i64, writer: W) -> Result<(u64, W)>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (_, stream) = self.get_blob(image, digest, size).await?;
        let PipeStream { id, mut reader } = stream;
        self.finish_with(id, async move {
            let mut writer = writer;
            let copied = tokio::io::copy(&mut reader, &mut writer).await?;
            writer.flush().await?;
            Ok((copied, writer))
        })
        .await
    }

    /// Wait for the producer of pipe `id` and return its terminal error.
    pub async fn finish_pipe(&self, id: u32) -> Result<()> {
        self.call_no_fd(Method::FinishPipe, vec![json!(id)]).await?;
        Ok(())
    }

    /// Ask the server to exit and wait for the child process, if any.
    pub async fn shutdown(self) -> Result<()> {
        self.call_no_fd(Method::Shutdown, vec![]).await?;
        drop(self.conn);
        let Some(mut child) = self.child.into_inner() else {
            return Ok(());
        };
        let status = child.wait().await?;
        if !status.success() {
            return Err(ProxyError::ProcessFailed(format!("proxy exited with {status}")));
        }
        debug!("proxy process exited");
        Ok(())
    }

    async fn drain_and_finish(&self, stream: PipeStream) -> Result<Vec<u8>> {
        let PipeStream { id, mut reader } = stream;
        self.finish_with(id, async move {
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes).await.map(|_| bytes)
        })
        .await
    }

    /// Run `drain` on its own task while `FinishPipe` for `id` is in flight.
    async fn finish_with<T, F>(&self, id: u32, drain: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = io::Result<T>> + Send + 'static,
    {
        let drain = tokio::spawn(drain);
        let finished = self.finish_pipe(id).await;
        let drained = drain
            .await
            .map_err(|e| ProxyError::Internal(format!("reader for pipe {id}: {e}")))?;
        finished?;
        Ok(drained?)
    }
}

/// Marks the client broken unless the exchange it covers runs to the end.
///
/// Dropping a call future between sending a request and reading its reply
/// leaves that reply queued for whoever calls next.
struct InFlight<'a> {
    broken: &'a AtomicBool,
    method: Method,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn new(broken: &'a AtomicBool, method: Method) -> Self {
        Self {
            broken,
            method,
            done: false,
        }
    }

    fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            warn!(method = %self.method, "call cancelled mid-exchange, connection unusable");
            self.broken.store(true, Ordering::Release);
        }
    }
}

/// One request/reply round trip.
async fn exchange(
    conn: &Connection,
    method: Method,
    payload: &[u8],
) -> Result<(Reply, Option<OwnedFd>)> {
    conn.send(payload, None).await?;
    let msg = conn.recv().await?.ok_or(ProxyError::ConnectionClosed)?;
    let reply = serde_json::from_slice(&msg.payload)
        .map_err(|e| ProxyError::MalformedReply(format!("{method}: {e}")))?;
    Ok((reply, msg.fd))
}

/// Place the child's socket at [`CHILD_SOCKFD`], inheritable across exec.
fn install_child_socket(fd: i32) -> io::Result<()> {
    if fd == CHILD_SOCKFD {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        nix::unistd::dup2(fd, CHILD_SOCKFD)?;
    }
    Ok(())
}

fn as_id(method: Method, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| malformed(method, value))
}

fn malformed(method: Method, value: &Value) -> ProxyError {
    ProxyError::MalformedReply(format!("{method}: unexpected value {value}"))
}
