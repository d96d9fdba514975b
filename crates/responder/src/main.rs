//! trunk-dhcpd - Main executable

use anyhow::Result;
use trunk_dhcpd::{CliConfig, Responder};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli_config: CliConfig = argh::from_env();
    let config = cli_config.into_responder_config()?;

    let responder = Responder::new(config)?;
    responder.run().await
}
