//! Feed connection lifecycle management.
//!
//! [`FeedAdapter`] drives one exchange codec through connect, subscribe,
//! read, and resync, with automatic reconnection under exponential
//! backoff. Parsing happens here, off the aggregator's critical path;
//! canonical updates are published over a bounded channel, so a congested
//! aggregator applies backpressure to the feed reader instead of silently
//! losing updates.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use tungstenite::Message;

use super::{Decoded, ExchangeId, FeedCodec};
use crate::error::{Result, TwapdError};
use crate::models::book::BookUpdate;

/// Initial backoff duration between reconnection attempts.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum backoff duration between reconnection attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Why the reader loop exited.
enum DisconnectReason {
    /// The connection was lost or errored.
    ConnectionError,
    /// The codec needs a fresh snapshot this exchange only serves on a
    /// new connection.
    ResyncReconnect,
    /// The aggregator's channel closed (service shutting down).
    Shutdown,
}

/// Owns one live feed connection and its codec.
pub struct FeedAdapter {
    codec: Box<dyn FeedCodec>,
    symbols: Vec<String>,
    tx: mpsc::Sender<BookUpdate>,
    http: reqwest::Client,
    dropped_messages: u64,
}

impl FeedAdapter {
    /// Creates an adapter publishing canonical updates into `tx`.
    #[must_use]
    pub fn new(codec: Box<dyn FeedCodec>, symbols: Vec<String>, tx: mpsc::Sender<BookUpdate>) -> Self {
        Self {
            codec,
            symbols,
            tx,
            http: reqwest::Client::new(),
            dropped_messages: 0,
        }
    }

    fn exchange(&self) -> ExchangeId {
        self.codec.id()
    }

    /// Runs the adapter until service shutdown.
    ///
    /// Each connection attempt is independent: local codec state is
    /// discarded, the feed is re-subscribed, and snapshot anchors are
    /// re-fetched. Failures back off exponentially up to one minute.
    pub async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            self.codec.reset();

            let url = self.codec.ws_url(&self.symbols);
            info!(exchange = %self.exchange(), url = %url, "connecting to feed");

            let (mut write, mut read) = match connect_async(&url).await {
                Ok((stream, _)) => stream.split(),
                Err(e) => {
                    error!(exchange = %self.exchange(), "feed connection failed: {e}");
                    if self.publish(BookUpdate::FeedDown { exchange: self.exchange() }).await.is_err() {
                        return;
                    }
                    info!(
                        exchange = %self.exchange(),
                        backoff_secs = backoff.as_secs(),
                        "backing off before retry"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            };

            // Subscribe, then anchor any snapshot-seeded streams.
            let mut subscribed = true;
            for frame in self.codec.subscribe_frames(&self.symbols) {
                if let Err(e) = write.send(Message::Text(frame.into())).await {
                    warn!(exchange = %self.exchange(), "subscribe failed: {e}");
                    subscribed = false;
                    break;
                }
            }
            if subscribed {
                if let Err(reason) = self.anchor_snapshots().await {
                    match reason {
                        DisconnectReason::Shutdown => return,
                        _ => subscribed = false,
                    }
                }
            }
            if !subscribed {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }

            info!(exchange = %self.exchange(), "feed connected and subscribed");
            backoff = INITIAL_BACKOFF;

            let reason = self.read_loop(&mut write, &mut read).await;

            match reason {
                DisconnectReason::ResyncReconnect => {
                    info!(exchange = %self.exchange(), "resync requested, reconnecting");
                    // No backoff for a planned resync.
                }
                DisconnectReason::ConnectionError => {
                    if self.publish(BookUpdate::FeedDown { exchange: self.exchange() }).await.is_err() {
                        return;
                    }
                    info!(
                        exchange = %self.exchange(),
                        backoff_secs = backoff.as_secs(),
                        "feed lost, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                DisconnectReason::Shutdown => {
                    info!(exchange = %self.exchange(), "adapter shutting down");
                    return;
                }
            }
        }
    }

    /// Fetches REST snapshots for every symbol the codec anchors that way.
    async fn anchor_snapshots(&mut self) -> std::result::Result<(), DisconnectReason> {
        for symbol in self.symbols.clone() {
            match self.fetch_snapshot(&symbol).await {
                Ok(Some(update)) => {
                    if self.publish(update).await.is_err() {
                        return Err(DisconnectReason::Shutdown);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        exchange = %self.exchange(),
                        symbol = %symbol,
                        "snapshot fetch failed: {e}"
                    );
                    return Err(DisconnectReason::ConnectionError);
                }
            }
        }
        Ok(())
    }

    async fn fetch_snapshot(&mut self, symbol: &str) -> Result<Option<BookUpdate>> {
        let Some(url) = self.codec.snapshot_url(symbol) else {
            return Ok(None);
        };
        debug!(exchange = %self.exchange(), symbol = %symbol, "fetching depth snapshot");
        let body = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let update = self.codec.decode_snapshot(symbol, &body)?;
        Ok(Some(update))
    }

    /// Reads feed messages until disconnection, resync, or shutdown.
    async fn read_loop(
        &mut self,
        write: &mut (impl SinkExt<Message> + Unpin),
        read: &mut (impl StreamExt<Item = tungstenite::Result<Message>> + Unpin),
    ) -> DisconnectReason {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match self.codec.decode(&text) {
                    Ok(Decoded::Updates(updates)) => {
                        for update in updates {
                            if self.publish(update).await.is_err() {
                                return DisconnectReason::Shutdown;
                            }
                        }
                    }
                    Ok(Decoded::Resync { symbol }) => {
                        warn!(
                            exchange = %self.exchange(),
                            symbol = %symbol,
                            "book out of sync, resyncing"
                        );
                        match self.fetch_snapshot(&symbol).await {
                            Ok(Some(update)) => {
                                if self.publish(update).await.is_err() {
                                    return DisconnectReason::Shutdown;
                                }
                            }
                            // No out-of-band snapshot; a fresh connection
                            // yields one.
                            Ok(None) => return DisconnectReason::ResyncReconnect,
                            Err(e) => {
                                warn!(
                                    exchange = %self.exchange(),
                                    symbol = %symbol,
                                    "resync snapshot failed: {e}"
                                );
                                return DisconnectReason::ConnectionError;
                            }
                        }
                    }
                    Ok(Decoded::Ignore) => {}
                    Err(e) => {
                        // Malformed payloads are dropped and counted, never
                        // forwarded downstream.
                        self.dropped_messages += 1;
                        warn!(
                            exchange = %self.exchange(),
                            dropped = self.dropped_messages,
                            "dropping unparseable message: {e}"
                        );
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        return DisconnectReason::ConnectionError;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!(exchange = %self.exchange(), "feed stream ended");
                    return DisconnectReason::ConnectionError;
                }
                Some(Ok(_)) => {} // Binary/Pong frames
                Some(Err(e)) => {
                    warn!(exchange = %self.exchange(), "feed error: {e}");
                    return DisconnectReason::ConnectionError;
                }
            }
        }
    }

    /// Publishes one canonical update. Blocks when the aggregator is
    /// congested; the socket's buffer absorbs the feed in the meantime.
    /// Fails only when the aggregator has dropped its receiver, which the
    /// run loop treats as shutdown.
    async fn publish(&self, update: BookUpdate) -> Result<()> {
        self.tx
            .send(update)
            .await
            .map_err(|_| TwapdError::ChannelClosed("book update channel"))
    }

    /// Number of malformed messages dropped since startup.
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::build_codec;

    fn assert_send<T: Send>(_: &T) {}

    // The adapter future is moved into tokio::spawn on a multi-threaded
    // runtime, so it must stay Send whichever codec it boxes.
    #[test]
    fn run_future_is_send_for_every_codec() {
        let (tx, _rx) = mpsc::channel(1);
        for id in ExchangeId::ALL {
            let adapter = FeedAdapter::new(build_codec(id), vec!["BTCUSD".to_string()], tx.clone());
            assert_send(&adapter.run());
        }
    }

    #[tokio::test]
    async fn publish_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let adapter = FeedAdapter::new(
            build_codec(ExchangeId::Kraken),
            vec!["BTCUSD".to_string()],
            tx,
        );
        let err = adapter
            .publish(BookUpdate::FeedDown {
                exchange: ExchangeId::Kraken,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TwapdError::ChannelClosed(_)));
    }
}
