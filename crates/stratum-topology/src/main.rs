#![warn(missing_docs)]

//! `stratum-topo`: operator binary for the topology directory.

use anyhow::Result;
use clap::Parser;
use stratum_topology::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    cli.run().await
}
