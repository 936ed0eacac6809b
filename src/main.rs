mod bencoding;
mod cli;
mod client;
mod config;
mod core;
mod engine;
mod error;
mod format;
mod message;
mod monitor;
mod rate_limit;
mod session;
mod shutdown;
mod storage;
mod torrent;
mod tracker;
mod transport;

use std::process::ExitCode;

use clap::Parser;
use log::error;

use crate::cli::Cli;
use crate::client::Client;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let source = cli.source.clone();
    let result = match cli.into_config() {
        Ok(config) => session::run(&config, &source, Client::new).await,
        Err(err) => Err(err),
    };
    match result {
        Ok(outcome) => ExitCode::from(outcome.exit_code() as u8),
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
