//! OCI image layout backend.
//!
//! Serves images from an [OCI image layout] directory. References have the
//! form `<dir>[:<tag>]`; the tag is matched against the
//! `org.opencontainers.image.ref.name` annotation in `index.json`. Without a
//! tag the layout must contain exactly one entry.
//!
//! Entries that are themselves indexes are resolved to the configured
//! platform, so a multi-platform image opens as the matching single-platform
//! manifest.
//!
//! [OCI image layout]: https://github.com/opencontainers/image-spec/blob/main/image-layout.md

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{parse_digest, BlobReader, DigestHasher, ImageBackend, ImageSession, RawManifest};
use crate::config::PlatformConfig;
use crate::error::{ProxyError, Result};

/// OCI media types for manifest negotiation.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";

    pub fn is_index(media_type: &str) -> bool {
        media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
    }
}

/// Annotation naming an entry of `index.json`.
pub(super) const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Nested indexes deeper than this are rejected.
const MAX_INDEX_DEPTH: usize = 4;

/// OCI Image Manifest (single-platform).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// OCI Image Index (multi-platform manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciIndex {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// Content descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// Platform an image was built for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, rename = "os.version", skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// The descriptive parts of an image config blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    /// Only set by images built with docker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ContainerConfig>,
}

/// Runtime defaults recorded in an image config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

impl Platform {
    fn matches(&self, wanted: &PlatformConfig) -> bool {
        self.os == wanted.os
            && self.architecture == wanted.architecture
            && match &wanted.variant {
                Some(variant) => self.variant.as_ref() == Some(variant),
                None => true,
            }
    }
}

/// Backend for the `oci:` transport.
#[derive(Debug, Clone)]
pub struct OciLayoutBackend {
    platform: PlatformConfig,
}

impl OciLayoutBackend {
    pub fn new(platform: PlatformConfig) -> Self {
        Self { platform }
    }

    fn select_entry<'a>(&self, reference: &str, index: &'a OciIndex, tag: Option<&str>) -> Result<&'a Descriptor> {
        match tag {
            Some(tag) => index
                .manifests
                .iter()
                .find(|d| d.annotations.get(REF_NAME_ANNOTATION).map(String::as_str) == Some(tag))
                .ok_or_else(|| ProxyError::ImageNotFound(reference.to_owned())),
            None => match index.manifests.as_slice() {
                [only] => Ok(only),
                [] => Err(ProxyError::ImageNotFound(reference.to_owned())),
                entries => Err(ProxyError::InvalidReference {
                    reference: reference.to_owned(),
                    reason: format!("layout holds {} images, a tag is required", entries.len()),
                }),
            },
        }
    }

    fn select_platform<'a>(&self, index: &'a OciIndex) -> Result<&'a Descriptor> {
        index
            .manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| p.matches(&self.platform)))
            .ok_or_else(|| {
                ProxyError::Backend(format!(
                    "no image found in manifest list for platform {}",
                    self.platform
                ))
            })
    }
}

#[async_trait]
impl ImageBackend for OciLayoutBackend {
    async fn open_image(&self, reference: &str) -> Result<Arc<dyn ImageSession>> {
        let (dir, tag) = split_reference(reference)?;
        let index_bytes = match tokio::fs::read(dir.join("index.json")).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProxyError::ImageNotFound(reference.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        let index: OciIndex = serde_json::from_slice(&index_bytes)
            .map_err(|e| ProxyError::Backend(format!("invalid index.json in {}: {e}", dir.display())))?;

        let mut descriptor = self.select_entry(reference, &index, tag.as_deref())?.clone();
        let mut depth = 0;
        while media_types::is_index(&descriptor.media_type) {
            depth += 1;
            if depth > MAX_INDEX_DEPTH {
                return Err(ProxyError::Backend(format!(
                    "image index nesting exceeds {MAX_INDEX_DEPTH} levels"
                )));
            }
            let bytes = read_verified_blob(&dir, &descriptor.digest).await?;
            let nested: OciIndex = serde_json::from_slice(&bytes)
                .map_err(|e| ProxyError::Backend(format!("invalid image index {}: {e}", descriptor.digest)))?;
            descriptor = self.select_platform(&nested)?.clone();
            debug!(digest = %descriptor.digest, platform = %self.platform, "resolved image index");
        }

        let bytes = read_verified_blob(&dir, &descriptor.digest).await?;
        let manifest: OciManifest = serde_json::from_slice(&bytes)
            .map_err(|e| ProxyError::Backend(format!("invalid manifest {}: {e}", descriptor.digest)))?;

        Ok(Arc::new(OciLayoutImage {
            reference: reference.to_owned(),
            dir,
            raw: RawManifest {
                bytes,
                digest: descriptor.digest,
                media_type: descriptor.media_type,
            },
            manifest,
        }))
    }
}

/// One image of an OCI layout.
struct OciLayoutImage {
    reference: String,
    dir: PathBuf,
    raw: RawManifest,
    manifest: OciManifest,
}

#[async_trait]
impl ImageSession for OciLayoutImage {
    fn reference(&self) -> &str {
        &self.reference
    }

    async fn raw_manifest(&self) -> Result<RawManifest> {
        Ok(self.raw.clone())
    }

    async fn config(&self) -> Result<Vec<u8>> {
        read_verified_blob(&self.dir, &self.manifest.config.digest).await
    }

    async fn blob(&self, digest: &str, _size_hint: i64) -> Result<BlobReader> {
        let path = blob_path(&self.dir, digest)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProxyError::BlobNotFound(digest.to_owned()))
            }
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        Ok(BlobReader {
            reader: Box::new(file),
            size,
        })
    }
}

/// Split `<dir>[:<tag>]`. A colon followed by something containing `/` is
/// part of the path.
pub(super) fn split_reference(reference: &str) -> Result<(PathBuf, Option<String>)> {
    if reference.is_empty() {
        return Err(ProxyError::InvalidReference {
            reference: reference.to_owned(),
            reason: "empty layout path".to_owned(),
        });
    }
    match reference.rsplit_once(':') {
        Some((dir, tag)) if !dir.is_empty() && !tag.is_empty() && !tag.contains('/') => {
            Ok((PathBuf::from(dir), Some(tag.to_owned())))
        }
        _ => Ok((PathBuf::from(reference), None)),
    }
}

pub(super) fn blob_path(dir: &Path, digest: &str) -> Result<PathBuf> {
    let (algorithm, encoded) = parse_digest(digest)?;
    Ok(dir.join("blobs").join(algorithm).join(encoded))
}

/// Read a small blob fully and check it against its digest.
async fn read_verified_blob(dir: &Path, digest: &str) -> Result<Vec<u8>> {
    let path = blob_path(dir, digest)?;
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(ProxyError::BlobNotFound(digest.to_owned()))
        }
        Err(e) => return Err(e.into()),
    };
    let mut hasher = DigestHasher::for_digest(digest)?;
    hasher.update(&bytes);
    hasher.verify(digest)?;
    Ok(bytes)
}
