use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;
use twapd::TwapdError;
use twapd::aggregator::Aggregator;
use twapd::broker::Broker;
use twapd::config::fetch_config;
use twapd::engine::TwapEngine;
use twapd::exchange::{FeedAdapter, build_codec};
use twapd::server::Server;

#[tokio::main]
async fn main() -> Result<(), TwapdError> {
    // Initialize tracing subscriber for logging output.
    tracing_subscriber::fmt::init();

    let config = fetch_config()?;
    info!(
        symbols = ?config.symbols,
        exchanges = ?config.exchanges,
        addr = %config.listen_addr,
        "starting"
    );

    let aggregator = Arc::new(Aggregator::new(config.staleness_window));
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    for exchange in &config.exchanges {
        let adapter = FeedAdapter::new(
            build_codec(*exchange),
            config.symbols.clone(),
            tx.clone(),
        );
        tokio::spawn(adapter.run());
    }
    drop(tx);
    tokio::spawn(Arc::clone(&aggregator).run(rx));

    let broker = Arc::new(Broker::new(Arc::clone(&aggregator), config.tick_interval));
    tokio::spawn(Arc::clone(&broker).run());

    // The engine takes submissions programmatically; keeping it alive here
    // so embedding an order API in front of it is just a handle away.
    let _engine = Arc::new(TwapEngine::new(
        Arc::clone(&aggregator),
        config.slice_interval,
    ));

    Server::new(broker, config.listen_addr).run().await
}
