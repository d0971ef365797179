//! Router daemon binary entrypoint.

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use router_core::breaker::BreakerRegistry;
use router_core::config::RouterConfig;
use router_core::pool::PoolClient;
use router_core::routing::RoutingTable;
use router_core::store::{MappingStore, RedisKv};
use router_core::telemetry::notifier_from_config;

mod supervisor;

const EXIT_CONFIG_INVALID: u8 = 1;
const EXIT_POOL_UNREACHABLE: u8 = 2;
const EXIT_STORE_UNREACHABLE: u8 = 3;

/// Copy-trading router daemon
#[derive(Parser)]
#[command(name = "routerd")]
#[command(about = "Replicates positions from source accounts onto destination accounts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the router (default)
    Serve,

    /// Validate environment and routing config, check every account via
    /// the pool, then exit
    ValidateConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    let config = match RouterConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    let notifier = notifier_from_config(&config.alerts);
    let breakers = Arc::new(BreakerRegistry::default());
    let pool = match PoolClient::new(
        &config.pool_api_url,
        config.call_timeout,
        breakers,
        Arc::clone(&notifier),
    ) {
        Ok(pool) => Arc::new(pool),
        Err(e) => {
            error!(error = %e, "failed to build pool client");
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    let table = match RoutingTable::load(&config.routing_file) {
        Ok(table) => table,
        Err(e) => {
            error!(
                file = %config.routing_file.display(),
                error = %e,
                "routing config invalid"
            );
            return ExitCode::from(EXIT_CONFIG_INVALID);
        }
    };

    if let Err(e) = supervisor::validate_accounts(&pool, &table).await {
        error!(error = %e, "account validation failed");
        return ExitCode::from(EXIT_POOL_UNREACHABLE);
    }

    if let Some(Commands::ValidateConfig) = cli.command {
        info!(
            sources = table.sources.len(),
            routes = table.route_count(),
            "configuration valid"
        );
        return ExitCode::SUCCESS;
    }

    let kv = match RedisKv::connect(&config.mapping_store_url).await {
        Ok(kv) => kv,
        Err(e) => {
            error!(error = %e, "mapping store unreachable");
            return ExitCode::from(EXIT_STORE_UNREACHABLE);
        }
    };
    let store = Arc::new(MappingStore::new(Arc::new(kv), config.recent_close_ttl));

    let service = match supervisor::RouterService::start(config, table, pool, store, notifier).await
    {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "router startup failed");
            return ExitCode::FAILURE;
        }
    };

    match service.run_until_shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "router terminated abnormally");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    let default_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{default_level},tower_http=warn,hyper=warn,h2=warn"
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
