use anyhow::Result;
use clap::Parser;

mod adapters;
mod admin;
mod api;
mod args;
mod cli;
mod hub;
mod kube_runtime;
mod reconciler;
mod server;
mod state;

use args::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    kecs_common::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Server(args) => server::run_server(args).await,
        Commands::Start(args) => cli::run_start(args).await,
        Commands::Stop(args) => cli::run_stop(args).await,
        Commands::Destroy(args) => cli::run_destroy(args).await,
        Commands::List => cli::run_list().await,
        Commands::Status(args) => cli::run_status(args).await,
    }
}
