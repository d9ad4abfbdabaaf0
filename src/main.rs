//! EVM farm driver - resilient multi-wallet transaction automation
//!
//! Rotates through a book of wallets and drives configured contract calls to
//! confirmation against a pool of RPC endpoints, surviving endpoint outages,
//! fee spikes and stuck nonces.

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};

mod chain;
mod config;
mod error;
mod intent;
mod metrics;
mod runner;
mod shutdown;
mod state;
#[cfg(test)]
mod testing;
mod tx;
mod wallet;

use chain::{http_connector, EndpointPool};
use config::Settings;
use error::DriverError;
use metrics::MetricsServer;
use runner::{IntentRunner, Pacing, TaskSource};
use state::{NullJournal, StateStore, SubmissionJournal};
use std::time::Duration;
use tx::{FeeOracle, GasEstimator, TransactionDriver};
use wallet::WalletBook;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting EVM farm driver v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({}) with {} endpoint(s) and {} task(s)",
        settings.chain.name,
        settings.chain.chain_id,
        settings.chain.rpc_urls.len(),
        settings.tasks.len()
    );

    // Wallets come first: no keys means no network traffic at all
    let keys = config::load_private_keys(&settings.wallet)?;
    let wallets = WalletBook::from_keys(&keys)?;

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Cancellation
    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received, no new attempts will be issued");
        trigger.trigger();
    });

    let driver_config = settings.driver.clone();
    let mut pool = EndpointPool::new(
        settings.chain.chain_id,
        &settings.chain.rpc_urls,
        http_connector(Duration::from_secs(driver_config.request_timeout_s)),
        driver_config.endpoint_failure_ceiling,
        driver_config.endpoint_backoff_s,
        shutdown.clone(),
    )?;

    // Restore persisted state and settle anything mined while we were down
    let mut restored_spend = None;
    let journal: Box<dyn SubmissionJournal> = match &settings.state.path {
        Some(path) => {
            let mut store = StateStore::load(path)?;
            if !store.state().pending.is_empty() {
                let lease = pool.acquire().await?;
                let settled = store.reconcile(&*lease.client).await;
                info!("Reconciled {} pending intent(s) from the state file", settled);
                store.checkpoint()?;
            }
            restored_spend = Some(store.gas_spent());
            Box::new(store)
        }
        None => Box::new(NullJournal),
    };

    let source =
        TaskSource::from_config(&settings.tasks, settings.chain.chain_id, settings.fees.mode)?;

    let mut driver = TransactionDriver::new(
        pool,
        FeeOracle::from_config(&settings.fees),
        GasEstimator::from_config(&settings.gas),
        driver_config,
        shutdown.clone(),
    );
    if let Some(spent) = restored_spend {
        driver.set_gas_spent(spent);
    }

    let mut runner = IntentRunner::new(
        driver,
        wallets,
        Box::new(source),
        journal,
        Pacing::new(settings.pacing.clone(), shutdown.clone()),
        settings.runner.clone(),
        settings.chain.clone(),
        shutdown,
    );

    let result = runner.run_cycles().await;

    if let Some(h) = metrics_handle {
        h.abort();
    }

    match result {
        Ok(report) => {
            info!(
                "Run finished: {} cycle(s), {} confirmed, {} reverted, {} abandoned, {} dropped",
                report.cycles, report.confirmed, report.reverted, report.abandoned, report.dropped
            );
            Ok(())
        }
        Err(DriverError::Cancelled) => {
            warn!("Stopped by shutdown signal");
            Ok(())
        }
        // anyhow prints the error itself on return
        Err(e) => {
            if !e.is_fatal() {
                warn!("Run interrupted before completing its cycles");
            }
            Err(e.into())
        }
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,evm_farm_driver=debug,hyper=warn,reqwest=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
