use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "spindle")]
#[command(
    version,
    about = "Spindle: event dispatcher and worker pool for serverless functions",
    disable_help_subcommand = true
)]
pub(crate) struct Args {
    #[command(subcommand)]
    pub(crate) command: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Subcommand {
    #[command(subcommand)]
    Server(Server),
    /// Run the built-in `exec` worker. Configured through the environment set by the server.
    Worker,
}

#[derive(Debug, clap::Subcommand)]
pub(crate) enum Server {
    /// Start the dispatcher, the enqueuers and the gRPC API until interrupted
    Run {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Read the configuration, validate all function triggers and exit
    Verify {
        /// Path to the TOML configuration
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}
