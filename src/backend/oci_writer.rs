//! Writing images into an OCI image layout.
//!
//! Blobs land in a `.partial` file next to their final path and are renamed
//! into place only once their bytes match the digest they are stored under,
//! so a layout never holds a blob with the wrong content.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::oci::{blob_path, split_reference, REF_NAME_ANNOTATION};
use super::{media_types, Descriptor, DigestHasher, OciIndex};
use crate::error::{ProxyError, Result};

const LAYOUT_FILE: &[u8] = br#"{"imageLayoutVersion":"1.0.0"}"#;

/// Destination for the `oci:` transport.
#[derive(Debug, Clone)]
pub struct OciLayoutWriter {
    dir: PathBuf,
    tag: Option<String>,
}

impl OciLayoutWriter {
    /// Open `<dir>[:<tag>]` for writing, creating the layout if needed.
    pub async fn create(reference: &str) -> Result<Self> {
        let (dir, tag) = split_reference(reference)?;
        tokio::fs::create_dir_all(dir.join("blobs")).await?;
        let layout = dir.join("oci-layout");
        if !tokio::fs::try_exists(&layout).await? {
            tokio::fs::write(&layout, LAYOUT_FILE).await?;
        }
        Ok(Self { dir, tag })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn has_blob(&self, digest: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(blob_path(&self.dir, digest)?).await?)
    }

    /// Store a blob that is already in memory.
    pub async fn put_blob(&self, digest: &str, bytes: &[u8]) -> Result<()> {
        let mut sink = self.blob_sink(digest).await?;
        sink.write_all(bytes).await?;
        sink.commit().await
    }

    /// Start writing the blob `digest`; finish with [`BlobSink::commit`].
    pub async fn blob_sink(&self, digest: &str) -> Result<BlobSink> {
        let hasher = DigestHasher::for_digest(digest)?;
        let path = blob_path(&self.dir, digest)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = path.with_extension("partial");
        let file = File::create(&partial).await?;
        Ok(BlobSink {
            file,
            hasher,
            written: 0,
            digest: digest.to_owned(),
            partial,
            path,
        })
    }

    /// Record `manifest` in `index.json`.
    ///
    /// With a tag, any entry already carrying that name is replaced.
    /// Without one, only an entry for the same digest is.
    pub async fn add_manifest(&self, mut manifest: Descriptor) -> Result<()> {
        let index_path = self.dir.join("index.json");
        let mut index = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ProxyError::Backend(format!("invalid index.json in {}: {e}", self.dir.display()))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => OciIndex {
                schema_version: 2,
                media_type: Some(media_types::OCI_INDEX.to_owned()),
                manifests: Vec::new(),
                annotations: HashMap::new(),
            },
            Err(e) => return Err(e.into()),
        };

        match &self.tag {
            Some(tag) => {
                index.manifests.retain(|d| {
                    d.annotations.get(REF_NAME_ANNOTATION).map(String::as_str) != Some(tag.as_str())
                });
                manifest
                    .annotations
                    .insert(REF_NAME_ANNOTATION.to_owned(), tag.clone());
            }
            None => index.manifests.retain(|d| d.digest != manifest.digest),
        }
        debug!(digest = %manifest.digest, tag = ?self.tag, "recording manifest");
        index.manifests.push(manifest);

        let partial = self.dir.join("index.json.partial");
        tokio::fs::write(&partial, serde_json::to_vec(&index)?).await?;
        tokio::fs::rename(&partial, &index_path).await?;
        Ok(())
    }
}

/// A blob being written, hashed on the way through.
#[derive(Debug)]
pub struct BlobSink {
    file: File,
    hasher: DigestHasher,
    written: u64,
    digest: String,
    partial: PathBuf,
    path: PathBuf,
}

impl BlobSink {
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Move the blob into place if its bytes match its digest.
    ///
    /// On a mismatch the partial file is removed.
    pub async fn commit(mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        if let Err(e) = self.hasher.verify(&self.digest) {
            tokio::fs::remove_file(&self.partial).await?;
            return Err(e);
        }
        tokio::fs::rename(&self.partial, &self.path).await?;
        debug!(digest = %self.digest, bytes = self.written, "stored blob");
        Ok(())
    }
}

impl AsyncWrite for BlobSink {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.file).poll_write(cx, buf))?;
        this.hasher.update(&buf[..n]);
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}
