//! Real feed integration tests.
//!
//! These tests connect to the live exchange WebSocket feeds and require
//! network access. Run with: `cargo test --features integration-tests`

#![cfg(feature = "integration-tests")]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tungstenite::Message;

use twapd::exchange::{Decoded, ExchangeId, build_codec};

/// Connects to one exchange, subscribes to BTCUSD, and waits for the
/// first decodable book update.
async fn first_update(id: ExchangeId) -> bool {
    let symbols = vec!["BTCUSD".to_string()];
    let mut codec = build_codec(id);

    let (stream, _) = connect_async(&codec.ws_url(&symbols))
        .await
        .expect("Failed to connect");
    let (mut write, mut read) = stream.split();
    for frame in codec.subscribe_frames(&symbols) {
        write
            .send(Message::Text(frame.into()))
            .await
            .expect("Failed to subscribe");
    }

    tokio::time::timeout(Duration::from_secs(15), async {
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                match codec.decode(text.as_str()) {
                    Ok(Decoded::Updates(updates)) if !updates.is_empty() => return true,
                    // Binance diffs are dropped until a snapshot anchor
                    // exists; seeing them at all proves the feed works.
                    Ok(Decoded::Ignore) if id == ExchangeId::Binance => return true,
                    _ => {}
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false)
}

#[tokio::test]
async fn test_coinbase_live_book_update() {
    assert!(first_update(ExchangeId::Coinbase).await);
}

#[tokio::test]
async fn test_kraken_live_book_update() {
    assert!(first_update(ExchangeId::Kraken).await);
}

#[tokio::test]
async fn test_binance_live_stream_reachable() {
    assert!(first_update(ExchangeId::Binance).await);
}
