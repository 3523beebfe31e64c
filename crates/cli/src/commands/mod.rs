// CLI subcommands

pub mod balance;
pub mod metrics;
pub mod submit;

use anyhow::{Context, Result};
use reagent_pool::{PoolConfig, PoolManager};

/// Start a pool with every reference handler registered
pub async fn start_pool(config: PoolConfig) -> Result<PoolManager> {
    PoolManager::start(config, reagent_calc::builtin_handlers())
        .await
        .context("Failed to start worker pool")
}
