// Reagent CLI
//
// Design Decision: Each invocation starts an in-process pool, runs its work and shuts the pool down.
// Design Decision: Pool settings come from REAGENT_* variables, with flags taking precedence.

mod commands;
mod output;
mod telemetry;

use clap::{Parser, Subcommand};
use reagent_pool::{CalculationKind, LoadBalancing, PoolConfig};

#[derive(Parser)]
#[command(name = "reagent")]
#[command(about = "Reagent CLI - Run chemistry calculations on a worker pool")]
#[command(version)]
pub struct Cli {
    /// Minimum number of workers
    #[arg(long, env = "REAGENT_MIN_WORKERS")]
    pub min_workers: Option<usize>,

    /// Maximum number of workers
    #[arg(long, env = "REAGENT_MAX_WORKERS")]
    pub max_workers: Option<usize>,

    /// Worker selection policy: round-robin, least-busy or random
    #[arg(long, env = "REAGENT_LOAD_BALANCING")]
    pub load_balancing: Option<LoadBalancing>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Balance one or more chemical equations
    Balance {
        /// Equations such as "H2 + O2 = H2O"
        #[arg(required = true)]
        equations: Vec<String>,
    },

    /// Submit a single calculation
    Submit {
        /// Calculation kind, e.g. compound-analysis
        #[arg(long, short)]
        kind: CalculationKind,

        /// JSON payload for the handler
        #[arg(long, short)]
        payload: String,

        /// Max wait time in seconds
        #[arg(long, default_value = "30")]
        timeout: u64,
    },

    /// Run a short demo batch and print pool metrics
    Metrics {
        /// Number of demo tasks to run
        #[arg(long, default_value = "12")]
        tasks: usize,
    },
}

impl Cli {
    fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let mut config = PoolConfig::from_env();
        if let Some(min) = self.min_workers {
            config = config.with_min_workers(min);
        }
        if let Some(max) = self.max_workers {
            config = config.with_max_workers(max);
        }
        if let Some(policy) = self.load_balancing {
            config = config.with_load_balancing(policy);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded .env from {}", path.display());
    }
    telemetry::init();

    let cli = Cli::parse();
    let config = cli.pool_config()?;
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Balance { equations } => {
            commands::balance::run(config, output_format, equations).await
        }
        Commands::Submit {
            kind,
            payload,
            timeout,
        } => commands::submit::run(config, output_format, kind, &payload, timeout).await,
        Commands::Metrics { tasks } => commands::metrics::run(config, output_format, tasks).await,
    }
}
