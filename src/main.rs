use clap::Parser;
use tracing_subscriber::EnvFilter;

use mirage::opt::{Cmd, Opt};
use mirage::{client, config, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opt = Opt::parse();
    match opt.cmd {
        Cmd::Client { config } => {
            let cfg = config::load(&config)?;
            client::bind(cfg).await?.run().await
        }
        Cmd::Server { config } => {
            let cfg = config::load(&config)?;
            server::bind(cfg).await?.run().await
        }
    }
}
