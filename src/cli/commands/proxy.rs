use clap::Args;

use super::LoggingConfig;
use crate::config::ConfigArgs;

#[derive(Args)]
pub struct ProxyCommand {
    /// Descriptor of the connected SOCK_SEQPACKET socket to serve
    #[arg(long, value_name = "FD")]
    pub sockfd: i32,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}
