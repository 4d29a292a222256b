//! 'main' for the Cairn header node process

use anyhow::Result;
use cairn_common::messages::Message;
use cairn_module_header_chain::HeaderChain;
use caryatid_module_spy::Spy;
use caryatid_process::Process;
use clap::Parser;
use config::{Config, Environment, File};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["header_node".to_string()])]
    config: Vec<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    let args = Args::parse();

    // Standard logging using RUST_LOG, quiet storage engine by default
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fjall=warn,lsm_tree=warn"));
    Registry::default().with(fmt::layer().with_filter(filter)).init();

    info!("Cairn header node");

    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = Arc::new(builder.add_source(Environment::with_prefix("CAIRN")).build()?);

    let mut process = Process::<Message>::create(config).await;

    HeaderChain::register(&mut process);
    Spy::<Message>::register(&mut process);

    process.run().await?;

    info!("Exiting");
    Ok(())
}
