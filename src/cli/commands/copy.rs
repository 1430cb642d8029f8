use clap::Args;
use std::path::PathBuf;

use super::LoggingConfig;
use crate::config::ConfigArgs;

#[derive(Args)]
pub struct CopyCommand {
    /// Image to copy, e.g. oci:/path/to/layout:tag
    #[arg(value_name = "SOURCE-IMAGE")]
    pub source: String,

    /// Where to write it; only oci:<dir>[:<tag>] is supported
    #[arg(value_name = "DESTINATION-IMAGE")]
    pub destination: String,

    /// Write the digest of the copied manifest to this file
    #[arg(long, value_name = "PATH")]
    pub digestfile: Option<PathBuf>,

    /// Suppress progress output
    #[arg(short, long)]
    pub quiet: bool,

    /// Proxy executable to spawn instead of this binary
    #[arg(long, value_name = "PATH", env = "IMAGE_PROXY_PROGRAM")]
    pub proxy_program: Option<PathBuf>,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}
