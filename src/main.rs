use anyhow::Result;
use std::path::PathBuf;

use loopgate::app::Gateway;
use loopgate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".parse().expect("static filter parses"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Config file: first argument, else LOOPGATE_CONFIG, else defaults.
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LOOPGATE_CONFIG").ok())
        .map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;

    let gateway = Gateway::start(config).await?;
    tokio::signal::ctrl_c().await?;
    gateway.stop().await;
    Ok(())
}
