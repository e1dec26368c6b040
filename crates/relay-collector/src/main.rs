use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use relay_collector::poem::serve;
use relay_collector::Aggregator;
use relay_collector::CollectorArgs;
use relay_collector::CollectorConfig;
use relay_collector::CollectorServer;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let args = CollectorArgs::parse();
    utils::logging::init();

    let config = CollectorConfig::from(&args);
    tracing::info!("Starting relay-collector {}", env!("CARGO_PKG_VERSION"));

    let aggregator = Arc::new(Aggregator::new(config.aggregator));
    let server = CollectorServer::start(&config, Arc::clone(&aggregator))
        .await
        .map_err(|report| anyhow!("{report:?}"))?;

    let token = server.cancellation_token();
    let mut scrape = tokio::spawn(serve(config.scrape_addr.clone(), aggregator, token.clone()));

    let scrape_result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("listen for shutdown signal")?;
            tracing::info!("Shutdown requested");
            None
        }
        result = &mut scrape => Some(result),
    };

    let stats = server.shutdown().await;
    tracing::info!(
        connections = stats.connections,
        merged = stats.merged,
        rejected = stats.rejected,
        malformed = stats.malformed,
        "Collector finished"
    );

    let scrape_result = match scrape_result {
        Some(result) => result,
        None => scrape.await,
    };
    scrape_result
        .context("scrape task panicked")?
        .map_err(|report| anyhow!("{report:?}"))
}
