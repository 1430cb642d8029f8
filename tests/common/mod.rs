//! Common test utilities: an in-memory image backend and an in-process proxy

#![allow(dead_code)]

use async_trait::async_trait;
use image_proxy::backend::{BlobReader, ImageBackend, ImageSession, RawManifest};
use image_proxy::{Connection, ImageProxy, ProxyConfig, ProxyError, ProxyServer, Result};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::task::JoinHandle;

pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Deterministic, non-repeating-looking test payload.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

#[derive(Clone)]
pub enum Blob {
    Bytes(Vec<u8>),
    /// Serve these bytes, then fail the read
    FailAfter(Vec<u8>),
}

#[derive(Clone, Default)]
pub struct MemoryImage {
    pub manifest: Vec<u8>,
    pub config: Vec<u8>,
    pub blobs: HashMap<String, Blob>,
}

impl MemoryImage {
    /// An image whose manifest lists `layers` in order.
    pub fn with_layers(layers: Vec<Vec<u8>>) -> Self {
        let config = br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#.to_vec();
        let mut blobs = HashMap::new();
        let descriptors: Vec<_> = layers
            .into_iter()
            .map(|layer| {
                let digest = sha256_digest(&layer);
                let descriptor = json!({
                    "mediaType": "application/vnd.oci.image.layer.v1.tar",
                    "digest": digest,
                    "size": layer.len(),
                });
                blobs.insert(digest, Blob::Bytes(layer));
                descriptor
            })
            .collect();
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": sha256_digest(&config),
                "size": config.len(),
            },
            "layers": descriptors,
        });
        Self {
            manifest: serde_json::to_vec(&manifest).unwrap(),
            config,
            blobs,
        }
    }

    pub fn blob(mut self, digest: impl Into<String>, blob: Blob) -> Self {
        self.blobs.insert(digest.into(), blob);
        self
    }
}

/// Backend serving images from memory, with failure injection.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    images: HashMap<String, MemoryImage>,
    broken: Vec<String>,
    closed: Arc<AtomicUsize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn image(mut self, reference: &str, image: MemoryImage) -> Self {
        self.images.insert(reference.to_owned(), image);
        self
    }

    /// Opening `reference` fails with a backend error.
    pub fn broken(mut self, reference: &str) -> Self {
        self.broken.push(reference.to_owned());
        self
    }

    /// Number of sessions closed so far, by the client or at teardown.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageBackend for MemoryBackend {
    async fn open_image(&self, reference: &str) -> Result<Arc<dyn ImageSession>> {
        if self.broken.iter().any(|b| b == reference) {
            return Err(ProxyError::Backend(format!("injected failure opening {reference}")));
        }
        let image = self
            .images
            .get(reference)
            .ok_or_else(|| ProxyError::ImageNotFound(reference.to_owned()))?;
        Ok(Arc::new(MemorySession {
            reference: reference.to_owned(),
            image: image.clone(),
            closed: self.closed.clone(),
        }))
    }
}

struct MemorySession {
    reference: String,
    image: MemoryImage,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl ImageSession for MemorySession {
    fn reference(&self) -> &str {
        &self.reference
    }

    async fn raw_manifest(&self) -> Result<RawManifest> {
        Ok(RawManifest {
            bytes: self.image.manifest.clone(),
            digest: sha256_digest(&self.image.manifest),
            media_type: "application/vnd.oci.image.manifest.v1+json".to_owned(),
        })
    }

    async fn config(&self) -> Result<Vec<u8>> {
        Ok(self.image.config.clone())
    }

    async fn blob(&self, digest: &str, _size_hint: i64) -> Result<BlobReader> {
        match self.image.blobs.get(digest) {
            Some(Blob::Bytes(bytes)) => Ok(BlobReader {
                size: bytes.len() as u64,
                reader: Box::new(io::Cursor::new(bytes.clone())),
            }),
            Some(Blob::FailAfter(prefix)) => Ok(BlobReader {
                size: prefix.len() as u64 * 2,
                reader: Box::new(io::Cursor::new(prefix.clone()).chain(FailingReader)),
            }),
            None => Err(ProxyError::BlobNotFound(digest.to_owned())),
        }
    }

    async fn close(&self) -> Result<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::Other,
            "injected upstream failure",
        )))
    }
}

pub struct TestProxy {
    pub proxy: ImageProxy,
    pub server: JoinHandle<Result<()>>,
}

/// Serve `backend` on one end of a socketpair and initialize a client on
/// the other.
pub async fn start_proxy(backend: MemoryBackend) -> Result<TestProxy> {
    let (client, server) = start_server(backend)?;
    let proxy = ImageProxy::from_connection(client).await?;
    Ok(TestProxy { proxy, server })
}

/// Serve `backend` and hand back the raw client connection.
pub fn start_server(backend: MemoryBackend) -> Result<(Connection, JoinHandle<Result<()>>)> {
    let (client, server) = Connection::pair()?;
    let proxy = ProxyServer::new(Arc::new(backend), &ProxyConfig::default());
    Ok((client, tokio::spawn(proxy.serve(server))))
}
