//! Ondemand Scaler - autoscaler for Nomad-style clusters
//!
//! Watches blocked evaluations, grows capacity pools to fit the queued work
//! and collects nodes that stay idle.
//!
//! # Signals
//!
//! - `SIGINT` - graceful shutdown
//! - `SIGUSR1` - dump counters and pool state to the log

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use ondemand_scaler_cluster::HttpClusterClient;
use ondemand_scaler_control::{runtime, AppContext, ScalerConfig};
use ondemand_scaler_oracle::BinPackOracle;
use ondemand_scaler_pool::{load_pool_specs, Pool, PoolNodeSpec, ProviderKind};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose log level follows `-v`.
const OWN_CRATES: [&str; 6] = [
    "ondemand_scaler",
    "ondemand_scaler_control",
    "ondemand_scaler_pool",
    "ondemand_scaler_cluster",
    "ondemand_scaler_oracle",
    "ondemand_scaler_core",
];

#[derive(Debug, Parser)]
#[command(name = "ondemand-scaler", version, about)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Number of scaling workers; 0 only observes.
    #[arg(long, default_value_t = 1)]
    scale_threads: usize,

    /// Path to the TOML configuration file.
    #[arg(short, long, env = "ONDEMAND_SCALER_CONFIG")]
    config: PathBuf,

    /// Validate the configuration and pool definitions, then exit.
    #[arg(long)]
    dry_run_config: bool,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let fallback = OWN_CRATES
        .iter()
        .fold(String::from("warn"), |acc, krate| format!("{acc},{krate}={level}"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<(ScalerConfig, Vec<PoolNodeSpec>)> {
    let mut config = ScalerConfig::load(&cli.config)
        .with_context(|| format!("can't load config {}", cli.config.display()))?;
    config.apply_env();
    config.validate()?;

    let pool_path = config.pool_config_path()?;
    let specs = load_pool_specs(pool_path)
        .with_context(|| format!("can't load pool definitions {}", pool_path.display()))?;
    for spec in &specs {
        ProviderKind::from_spec(spec)
            .with_context(|| format!("invalid provider for pool {}", spec.full_name()))?;
    }
    Ok((config, specs))
}

async fn build_pools(
    specs: Vec<PoolNodeSpec>,
    config: &ScalerConfig,
) -> anyhow::Result<Vec<Arc<Pool>>> {
    let mut pools = Vec::with_capacity(specs.len());
    for spec in specs {
        let name = spec.full_name().to_string();
        let pool = Pool::from_spec(spec)
            .await
            .with_context(|| format!("can't create pool {name}"))?
            .with_idle_timeout(config.scaling.idle_timeout);
        tracing::info!(pool = %name, provider = pool.provider_kind(), "pool created");
        pools.push(Arc::new(pool));
    }
    Ok(pools)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (config, specs) = match load_config(&cli) {
        Ok(loaded) => loaded,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "fatal configuration error");
            return Err(e);
        }
    };

    if cli.dry_run_config {
        for spec in &specs {
            println!("{}", spec.full_name());
        }
        tracing::info!(pools = specs.len(), "configuration is valid");
        return Ok(());
    }

    tracing::info!(
        address = %config.nomad.address,
        pools = specs.len(),
        scale_threads = cli.scale_threads,
        allowed_free_expr = %config.gc.allowed_free_expr,
        "starting ondemand scaler"
    );

    let cluster = HttpClusterClient::new(config.nomad.address.clone(), config.nomad.token.clone())?
        .with_request_timeout(config.nomad.request_timeout);

    let pools = match build_pools(specs, &config).await {
        Ok(pools) => pools,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "can't create pools");
            return Err(e);
        }
    };

    let app = Arc::new(AppContext::new(
        config,
        pools,
        Arc::new(cluster),
        Arc::new(BinPackOracle::new()),
        cli.scale_threads,
    ));
    runtime::run(app, cli.scale_threads).await;

    tracing::info!("ondemand scaler stopped");
    Ok(())
}
