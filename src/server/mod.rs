//! Proxy server: the request loop and method dispatcher.
//!
//! The server owns one connection. It receives a request, runs the matching
//! handler to completion, sends the reply and only then reads the next
//! request, so the handle table and pipe manager need no locking.
//!
//! # Connection states
//!
//! ```text
//! AwaitingInitialize ──Initialize──► Ready ──Shutdown / EOF──► Closed
//!                                     │ ▲
//!                                     └─┘ any other call
//! ```

mod handles;
mod pipes;

pub use handles::HandleTable;
pub use pipes::{copy_verified, PipeManager, PipeWriter};

use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::backend::{ImageBackend, ImageSession};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::framing::Connection;
use crate::protocol::{Args, Method, Reply, Request, MAX_MSG_SIZE, PROTOCOL_VERSION};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    AwaitingInitialize,
    Ready,
    Closed,
}

/// Successful handler result: a value and possibly a stream.
struct Outcome {
    value: Value,
    pipe: Option<(OwnedFd, u32)>,
}

impl Outcome {
    fn value(value: Value) -> Self {
        Self { value, pipe: None }
    }

    fn stream(value: Value, pipe: (OwnedFd, u32)) -> Self {
        Self {
            value,
            pipe: Some(pipe),
        }
    }
}

/// Serves one proxy connection.
pub struct ProxyServer {
    backend: Arc<dyn ImageBackend>,
    verify_digests: bool,
    state: ConnectionState,
    images: HandleTable<Arc<dyn ImageSession>>,
    pipes: PipeManager,
}

impl ProxyServer {
    pub fn new(backend: Arc<dyn ImageBackend>, config: &ProxyConfig) -> Self {
        Self {
            backend,
            verify_digests: config.verify_digests,
            state: ConnectionState::AwaitingInitialize,
            images: HandleTable::new(),
            pipes: PipeManager::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn open_images(&self) -> usize {
        self.images.len()
    }

    pub fn outstanding_pipes(&self) -> usize {
        self.pipes.len()
    }

    /// Serve requests until the client shuts us down or disconnects.
    ///
    /// Only transport errors are returned; everything else is replied.
    /// Open sessions are closed however the loop ends.
    pub async fn serve(mut self, conn: Connection) -> Result<()> {
        info!("serving image proxy connection");
        let served = self.serve_requests(&conn).await;
        if let Err(e) = &served {
            warn!(error = %e, "control connection failed");
        }
        self.teardown().await;
        info!("image proxy connection closed");
        served
    }

    async fn serve_requests(&mut self, conn: &Connection) -> Result<()> {
        while self.state != ConnectionState::Closed {
            let Some(msg) = conn.recv().await? else {
                debug!("client disconnected");
                break;
            };

            let (reply, fd) = if msg.fd.is_some() {
                // Dropping the message closes the stray descriptor.
                let err = ProxyError::UnexpectedFd("request".to_owned());
                warn!(error = %err, "rejecting request");
                (Reply::error(err.to_string()), None)
            } else {
                self.handle_message(&msg.payload).await
            };

            let mut payload = serde_json::to_vec(&reply)?;
            if payload.len() > MAX_MSG_SIZE {
                let err = ProxyError::MessageTooLarge {
                    size: payload.len(),
                    max: MAX_MSG_SIZE,
                };
                warn!(error = %err, "reply too large, sending error instead");
                // The stream (if any) is abandoned; its producer is aborted at teardown.
                payload = serde_json::to_vec(&Reply::error(err.to_string()))?;
                conn.send(&payload, None).await?;
                continue;
            }
            conn.send(&payload, fd.as_ref().map(|f| f.as_fd())).await?;
            // Our copy of the read end closes here; the client holds its own.
        }
        Ok(())
    }

    /// Decode one raw request and dispatch it.
    pub async fn handle_message(&mut self, payload: &[u8]) -> (Reply, Option<OwnedFd>) {
        match serde_json::from_slice::<Request>(payload) {
            Ok(request) => self.dispatch(&request).await,
            Err(e) => {
                let err = ProxyError::InvalidRequest(e.to_string());
                warn!(error = %err, "rejecting request");
                (Reply::error(err.to_string()), None)
            }
        }
    }

    /// Run one call and encode its outcome.
    pub async fn dispatch(&mut self, request: &Request) -> (Reply, Option<OwnedFd>) {
        debug!(method = %request.method, args = ?request.args, "call");
        match self.call(request).await {
            Ok(Outcome { value, pipe: None }) => (Reply::ok(value), None),
            Ok(Outcome {
                value,
                pipe: Some((fd, pipe_id)),
            }) => (Reply::with_pipe(value, pipe_id), Some(fd)),
            Err(e) => {
                warn!(method = %request.method, error = %e, "call failed");
                (Reply::error(e.to_string()), None)
            }
        }
    }

    async fn call(&mut self, request: &Request) -> Result<Outcome> {
        let method: Method = request.method.parse()?;
        let args = Args::new(method, &request.args);

        match (self.state, method) {
            (ConnectionState::AwaitingInitialize, Method::Initialize) => {
                args.expect_len(0)?;
                self.state = ConnectionState::Ready;
                Ok(Outcome::value(json!(PROTOCOL_VERSION)))
            }
            (ConnectionState::AwaitingInitialize, other) => {
                Err(ProxyError::NotInitialized(other.to_string()))
            }
            (_, Method::Initialize) => Err(ProxyError::AlreadyInitialized),
            (ConnectionState::Closed, _) => Err(ProxyError::ConnectionClosed),
            (ConnectionState::Ready, method) => self.call_ready(method, &args).await,
        }
    }

    async fn call_ready(&mut self, method: Method, args: &Args<'_>) -> Result<Outcome> {
        match method {
            Method::OpenImage => {
                args.expect_len(1)?;
                let session = self.backend.open_image(args.string(0)?).await?;
                let id = self.images.allocate(session)?;
                debug!(image_id = id, "opened image");
                Ok(Outcome::value(json!(id)))
            }
            Method::OpenImageOptional => {
                args.expect_len(1)?;
                match self.backend.open_image(args.string(0)?).await {
                    Ok(session) => Ok(Outcome::value(json!(self.images.allocate(session)?))),
                    Err(ProxyError::ImageNotFound(reference)) => {
                        debug!(%reference, "optional image not present");
                        Ok(Outcome::value(json!(0)))
                    }
                    Err(e) => Err(e),
                }
            }
            Method::CloseImage => {
                args.expect_len(1)?;
                let id = args.u32(0)?;
                let session = self.images.release(id)?;
                session.close().await?;
                debug!(image_id = id, "closed image");
                Ok(Outcome::value(Value::Null))
            }
            Method::GetManifest => {
                args.expect_len(1)?;
                let session = self.image(args.u32(0)?)?;
                let manifest = session.raw_manifest().await?;
                let pipe = self
                    .pipes
                    .create_stream(move |w| pipes::write_all(w, manifest.bytes))?;
                Ok(Outcome::stream(json!(manifest.digest), pipe))
            }
            Method::GetConfig => {
                args.expect_len(1)?;
                let session = self.image(args.u32(0)?)?;
                let config = session.config().await?;
                let pipe = self.pipes.create_stream(move |w| pipes::write_all(w, config))?;
                Ok(Outcome::stream(Value::Null, pipe))
            }
            Method::GetBlob => {
                args.expect_len(3)?;
                let session = self.image(args.u32(0)?)?;
                let digest = args.string(1)?.to_owned();
                let size_hint = args.i64(2)?;
                let blob = session.blob(&digest, size_hint).await?;
                let expected = (self.verify_digests && digest.starts_with("sha256:"))
                    .then(|| digest.clone());
                let size = blob.size;
                let pipe = self
                    .pipes
                    .create_stream(move |w| copy_verified(w, blob.reader, expected))?;
                debug!(%digest, size, "streaming blob");
                Ok(Outcome::stream(json!(size), pipe))
            }
            Method::FinishPipe => {
                args.expect_len(1)?;
                self.pipes.finish(args.u32(0)?).await?;
                Ok(Outcome::value(Value::Null))
            }
            Method::Shutdown => {
                args.expect_len(0)?;
                info!("shutdown requested");
                self.state = ConnectionState::Closed;
                Ok(Outcome::value(Value::Null))
            }
            Method::Initialize => Err(ProxyError::AlreadyInitialized),
        }
    }

    fn image(&self, id: u32) -> Result<Arc<dyn ImageSession>> {
        self.images.lookup(id).cloned()
    }

    async fn teardown(&mut self) {
        self.state = ConnectionState::Closed;
        if !self.pipes.is_empty() {
            warn!(outstanding = self.pipes.len(), "connection closed with unfinished pipes");
        }
        let sessions: Vec<_> = self.images.drain().collect();
        for (id, session) in sessions {
            if let Err(e) = session.close().await {
                warn!(image_id = id, error = %e, "failed to close image");
            }
        }
    }
}
