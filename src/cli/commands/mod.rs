pub mod copy;
pub mod inspect;
pub mod logging;
pub mod proxy;

pub use copy::CopyCommand;
pub use inspect::{InspectCommand, InspectFormat, InspectOutput};
pub use logging::LoggingConfig;
pub use proxy::ProxyCommand;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the image proxy protocol on an inherited socket
    #[command(name = "experimental-image-proxy")]
    Proxy(ProxyCommand),
    /// Describe an image as JSON, or print its raw manifest or config
    Inspect(InspectCommand),
    /// Copy an image into an OCI layout through a spawned proxy
    Copy(CopyCommand),
}

impl Commands {
    pub fn logging(&self) -> &LoggingConfig {
        match self {
            Commands::Proxy(cmd) => &cmd.logging,
            Commands::Inspect(cmd) => &cmd.logging,
            Commands::Copy(cmd) => &cmd.logging,
        }
    }
}
