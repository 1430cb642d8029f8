//! Out-of-process container image proxy.
//!
//! A client drives a separate, more restricted process that opens images and
//! serves their manifests, configs and blobs. Requests and replies are JSON
//! documents over a `SOCK_SEQPACKET` socket; payloads travel through pipes
//! whose read ends are passed as `SCM_RIGHTS` descriptors.

pub mod backend;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod server;

// Re-export commonly used types
pub use backend::{ImageBackend, ImageSession, OciLayoutBackend, Transports};
pub use client::{ImageProxy, PipeStream, ProxyCommandConfig};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use framing::Connection;
pub use protocol::{Method, Reply, Request, PROTOCOL_VERSION};
pub use server::ProxyServer;
