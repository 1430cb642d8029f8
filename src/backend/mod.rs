//! Image backends consumed by the proxy server.
//!
//! The proxy does not know how an image reference becomes bytes. It talks to
//! an [`ImageBackend`] that resolves a reference into an [`ImageSession`],
//! and the session serves the manifest, config and blobs of that one image.
//!
//! # Architecture
//!
//! ```text
//! ProxyServer
//!     │
//!     └── Transports ("transport:rest" router)
//!           │
//!           ├── "oci"  → OciLayoutBackend  (OCI image layout directory)
//!           └── ...    → any registered ImageBackend
//! ```

mod oci;
mod oci_writer;

pub use oci::{
    media_types, ContainerConfig, Descriptor, ImageConfig, OciIndex, OciLayoutBackend, OciManifest,
    Platform,
};
pub use oci_writer::{BlobSink, OciLayoutWriter};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest as _, Sha256, Sha512};
use tokio::io::AsyncRead;

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};

/// Manifest exactly as stored, plus what is needed to address it.
#[derive(Debug, Clone)]
pub struct RawManifest {
    pub bytes: Vec<u8>,
    pub digest: String,
    pub media_type: String,
}

/// An open blob stream.
pub struct BlobReader {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Size in bytes as known to the backend
    pub size: u64,
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader").field("size", &self.size).finish()
    }
}

/// Resolves image references into sessions.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Open the image named by `reference`.
    ///
    /// Fails with [`ProxyError::ImageNotFound`] when the reference is well
    /// formed but names nothing.
    async fn open_image(&self, reference: &str) -> Result<Arc<dyn ImageSession>>;
}

/// One opened image.
#[async_trait]
pub trait ImageSession: Send + Sync {
    /// Reference this session was opened with
    fn reference(&self) -> &str;

    /// Raw manifest bytes of the (platform-resolved) image
    async fn raw_manifest(&self) -> Result<RawManifest>;

    /// Raw config blob of the image
    async fn config(&self) -> Result<Vec<u8>>;

    /// Open a blob of this image for streaming.
    ///
    /// `size_hint` is the size the caller expects, or -1 when unknown.
    async fn blob(&self, digest: &str, size_hint: i64) -> Result<BlobReader>;

    /// Release backend resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Routes `transport:rest` references to the backend registered for
/// `transport`.
#[derive(Default, Clone)]
pub struct Transports {
    backends: HashMap<String, Arc<dyn ImageBackend>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every transport this crate ships, configured from `config`.
    pub fn with_defaults(config: &ProxyConfig) -> Self {
        Self::new().register("oci", OciLayoutBackend::new(config.platform.clone()))
    }

    pub fn register(mut self, name: impl Into<String>, backend: impl ImageBackend + 'static) -> Self {
        self.backends.insert(name.into(), Arc::new(backend));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[async_trait]
impl ImageBackend for Transports {
    async fn open_image(&self, reference: &str) -> Result<Arc<dyn ImageSession>> {
        let invalid = |reason: String| ProxyError::InvalidReference {
            reference: reference.to_owned(),
            reason,
        };
        let (transport, rest) = reference
            .split_once(':')
            .ok_or_else(|| invalid("missing transport prefix".to_owned()))?;
        let backend = self.backends.get(transport).ok_or_else(|| {
            invalid(format!(
                "unknown transport {:?} (supported: {})",
                transport,
                self.names().join(", ")
            ))
        })?;
        backend.open_image(rest).await
    }
}

/// Split a digest into algorithm and hex, rejecting anything that could not
/// safely become a path component.
pub fn parse_digest(digest: &str) -> Result<(&str, &str)> {
    let invalid = || ProxyError::InvalidDigest(digest.to_owned());
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(invalid)?;
    let expected_len = match algorithm {
        "sha256" => 64,
        "sha512" => 128,
        _ => return Err(invalid()),
    };
    let is_lower_hex = encoded
        .bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if encoded.len() != expected_len || !is_lower_hex {
        return Err(invalid());
    }
    Ok((algorithm, encoded))
}

/// Incremental hash for one of the algorithms [`parse_digest`] accepts.
#[derive(Debug, Clone)]
pub enum DigestHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl DigestHasher {
    /// Hasher for the algorithm `digest` is expressed in.
    pub fn for_digest(digest: &str) -> Result<Self> {
        Ok(match parse_digest(digest)?.0 {
            "sha512" => Self::Sha512(Sha512::new()),
            _ => Self::Sha256(Sha256::new()),
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// The digest of everything hashed so far, as `algorithm:hex`.
    pub fn finish(self) -> String {
        match self {
            Self::Sha256(h) => format!("sha256:{}", hex::encode(h.finalize())),
            Self::Sha512(h) => format!("sha512:{}", hex::encode(h.finalize())),
        }
    }

    pub fn verify(self, expected: &str) -> Result<()> {
        let actual = self.finish();
        if actual != expected {
            return Err(ProxyError::DigestMismatch {
                expected: expected.to_owned(),
                actual,
            });
        }
        Ok(())
    }
}
