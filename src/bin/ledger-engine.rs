use anyhow::Result;
use queued_ledger::bin_utils::{EngineConfig, Service, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let config = EngineConfig::from_env()?;
    init_logging(&config.log_level, config.log_format)?;
    Service::new(config).run().await?;
    Ok(())
}
