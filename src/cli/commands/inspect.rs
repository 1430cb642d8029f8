use clap::Args;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::LoggingConfig;
use crate::backend::{ImageConfig, OciManifest};
use crate::config::ConfigArgs;

/// What `inspect` prints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InspectFormat {
    /// JSON description of the image
    #[default]
    Json,
    /// Manifest bytes exactly as stored
    Raw,
    /// Config blob exactly as stored
    Config,
}

#[derive(Args)]
pub struct InspectCommand {
    /// Image reference, e.g. oci:/path/to/layout:tag
    #[arg(value_name = "REF")]
    pub reference: String,

    /// Print the raw manifest
    #[arg(long, conflicts_with = "config_blob")]
    pub raw: bool,

    /// Print the raw config blob
    #[arg(long = "config-blob")]
    pub config_blob: bool,

    /// Proxy executable to spawn instead of this binary
    #[arg(long, value_name = "PATH", env = "IMAGE_PROXY_PROGRAM")]
    pub proxy_program: Option<PathBuf>,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

impl InspectCommand {
    pub fn format(&self) -> InspectFormat {
        if self.raw {
            InspectFormat::Raw
        } else if self.config_blob {
            InspectFormat::Config
        } else {
            InspectFormat::Json
        }
    }
}

/// The JSON document `inspect` prints by default.
///
/// `Name` and `Tag` only exist for registry references, so images from an
/// OCI layout leave them out.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct InspectOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub digest: String,
    pub repo_tags: Vec<String>,
    pub created: Option<String>,
    pub docker_version: String,
    pub labels: Option<BTreeMap<String, String>>,
    pub architecture: String,
    pub os: String,
    pub layers: Vec<String>,
    pub env: Option<Vec<String>>,
}

impl InspectOutput {
    pub fn new(digest: &str, manifest: &OciManifest, config: ImageConfig) -> Self {
        let runtime = config.config.unwrap_or_default();
        Self {
            name: None,
            tag: None,
            digest: digest.to_owned(),
            repo_tags: Vec::new(),
            created: config.created,
            docker_version: config.docker_version.unwrap_or_default(),
            labels: runtime.labels,
            architecture: config.architecture,
            os: config.os,
            layers: manifest.layers.iter().map(|l| l.digest.clone()).collect(),
            env: runtime.env,
        }
    }

    /// Pretty-printed with four-space indentation and a trailing newline.
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut serializer =
            serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
        self.serialize(&mut serializer)?;
        out.push(b'\n');
        Ok(out)
    }
}
