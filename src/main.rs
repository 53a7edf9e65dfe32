mod args;
mod command;
mod config;
mod grpc_util;
mod init;
mod server;

use args::{Args, Server, Subcommand};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    match Args::parse().command {
        Subcommand::Server(Server::Run { config }) => command::server::run(config).await,
        Subcommand::Server(Server::Verify { config }) => command::server::verify(config).await,
        Subcommand::Worker => {
            let code = command::worker::run().await;
            std::process::exit(code);
        }
    }
}
