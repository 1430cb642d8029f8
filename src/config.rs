//! Configuration management for the image proxy.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/image-proxy/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `IMAGE_PROXY_`)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! # Environment Variables
//!
//! Nested keys use a double underscore:
//! - `IMAGE_PROXY_VERIFY_DIGESTS` - Verify streamed blobs against their digest
//! - `IMAGE_PROXY_PLATFORM__OS` - Operating system for index resolution
//! - `IMAGE_PROXY_PLATFORM__ARCHITECTURE` - Architecture for index resolution
//! - `IMAGE_PROXY_PLATFORM__VARIANT` - Architecture variant (e.g. `v8`)

use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Configuration flags shared by every command
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// Configuration file path
    #[arg(short, long, env = "IMAGE_PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Operating system to select from multi-platform images
    #[arg(long = "override-os")]
    pub override_os: Option<String>,

    /// Architecture to select from multi-platform images
    #[arg(long = "override-arch")]
    pub override_arch: Option<String>,

    /// Architecture variant to select from multi-platform images
    #[arg(long = "override-variant")]
    pub override_variant: Option<String>,

    /// Skip digest verification of streamed blobs
    #[arg(long)]
    pub no_verify_digests: bool,
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Platform used when an image reference resolves to an index
    #[serde(default)]
    pub platform: PlatformConfig,
    /// Verify blob bytes against the requested digest while streaming
    #[serde(default = "default_verify_digests")]
    pub verify_digests: bool,
}

/// Target platform for multi-platform image resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default = "default_architecture")]
    pub architecture: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            os: default_os(),
            architecture: default_architecture(),
            variant: None,
        }
    }
}

impl std::fmt::Display for PlatformConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = &self.variant {
            write!(f, "/{variant}")?;
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            platform: PlatformConfig::default(),
            verify_digests: default_verify_digests(),
        }
    }
}

/// System-wide configuration file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/image-proxy/config.toml";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "IMAGE_PROXY";

impl ProxyConfig {
    /// Load configuration from all sources
    pub fn load(args: &ConfigArgs) -> Result<Self> {
        Self::load_from(args, Some(Path::new(SYSTEM_CONFIG_PATH)), Some(ENV_PREFIX))
    }

    /// Load configuration, reading the system file and environment only
    /// when given.
    pub fn load_from(
        args: &ConfigArgs,
        system_file: Option<&Path>,
        env_prefix: Option<&str>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            include_str!("../config/default.toml"),
            config::FileFormat::Toml,
        ));

        if let Some(path) = system_file {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        // Add environment variables
        if let Some(prefix) = env_prefix {
            builder = builder.add_source(
                config::Environment::with_prefix(prefix)
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        let mut config: ProxyConfig = builder.build()?.try_deserialize()?;

        // Override with command line args
        if let Some(os) = &args.override_os {
            config.platform.os = os.clone();
        }
        if let Some(arch) = &args.override_arch {
            config.platform.architecture = arch.clone();
        }
        if let Some(variant) = &args.override_variant {
            config.platform.variant = Some(variant.clone());
        }
        if args.no_verify_digests {
            config.verify_digests = false;
        }

        Ok(config)
    }
}

fn default_verify_digests() -> bool {
    true
}

fn default_os() -> String {
    std::env::consts::OS.to_owned()
}

/// Host architecture in OCI (GOARCH) spelling.
fn default_architecture() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "x86" => "386",
        "aarch64" => "arm64",
        "powerpc64" if cfg!(target_endian = "little") => "ppc64le",
        "loongarch64" => "loong64",
        other => other,
    }
    .to_owned()
}
