//! WebSocket server for merged book subscribers.
//!
//! Each accepted connection gets a reader loop (parsing control frames)
//! and a writer task (draining the broker's outbound channel). A malformed
//! request is answered with an error frame and the connection stays open;
//! disconnecting tears the registration down so the broker stops computing
//! views nobody is watching.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{info, warn};
use tungstenite::Message;

use crate::Result;
use crate::broker::{Broker, ClientId};
use crate::models::{ClientRequest, ServerMessage, SubscriptionAction};

/// Accepts subscriber connections and wires them to the broker.
pub struct Server {
    broker: Arc<Broker>,
    listen_addr: String,
}

impl Server {
    #[must_use]
    pub fn new(broker: Arc<Broker>, listen_addr: String) -> Self {
        Self {
            broker,
            listen_addr,
        }
    }

    /// Accept loop. Runs until the listener socket fails.
    ///
    /// # Errors
    ///
    /// Returns a [`TwapdError`](crate::TwapdError) if binding or accepting
    /// on the listen address fails.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(addr = %self.listen_addr, "listening for subscribers");
        loop {
            let (stream, peer) = listener.accept().await?;
            let broker = Arc::clone(&self.broker);
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, peer, broker).await {
                    warn!(%peer, error = %err, "connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (mut write, mut read) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = broker.register(tx.clone()).await;
    info!(client = id, %peer, "subscriber connected");

    let _ = tx.send(ServerMessage::Welcome {
        message: "connected to merged order book stream".to_string(),
    });

    // Single-writer task: acks and broadcasts share one ordered channel.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let Ok(json) = serde_json::to_string(&frame) else {
                continue;
            };
            if write.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_request(&broker, id, &tx, text.as_str()).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    broker.unregister(id).await;
    drop(tx);
    let _ = writer.await;
    info!(client = id, %peer, "subscriber disconnected");
    Ok(())
}

/// Parses one control frame and queues the acknowledgement.
async fn handle_request(
    broker: &Broker,
    id: ClientId,
    tx: &mpsc::UnboundedSender<ServerMessage>,
    text: &str,
) {
    let reply = match serde_json::from_str::<ClientRequest>(text) {
        Ok(req) => match req.action {
            SubscriptionAction::Subscribe => {
                let exchanges = broker.subscribe(id, &req.symbol, &req.exchanges).await;
                ServerMessage::SubscribeSuccess {
                    message: format!("subscribed to {}", req.symbol),
                    symbol: req.symbol,
                    exchanges,
                }
            }
            SubscriptionAction::Unsubscribe => {
                if broker.unsubscribe(id, &req.symbol).await {
                    ServerMessage::UnsubscribeSuccess {
                        message: format!("unsubscribed from {}", req.symbol),
                        symbol: req.symbol,
                    }
                } else {
                    ServerMessage::Error {
                        error: format!("not subscribed to {}", req.symbol),
                    }
                }
            }
        },
        Err(err) => ServerMessage::Error {
            error: format!("invalid request: {err}"),
        },
    };
    let _ = tx.send(reply);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::Aggregator;
    use crate::broker::DEFAULT_TICK_INTERVAL;
    use crate::exchange::ExchangeId;

    async fn client() -> (Arc<Broker>, ClientId, mpsc::UnboundedSender<ServerMessage>, mpsc::UnboundedReceiver<ServerMessage>) {
        let broker = Arc::new(Broker::new(
            Arc::new(Aggregator::default()),
            DEFAULT_TICK_INTERVAL,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let id = broker.register(tx.clone()).await;
        (broker, id, tx, rx)
    }

    #[tokio::test]
    async fn subscribe_request_is_acknowledged() {
        let (broker, id, tx, mut rx) = client().await;
        handle_request(
            &broker,
            id,
            &tx,
            r#"{"action":"subscribe","symbol":"BTCUSD","exchanges":["kraken"]}"#,
        )
        .await;

        match rx.recv().await.unwrap() {
            ServerMessage::SubscribeSuccess {
                symbol, exchanges, ..
            } => {
                assert_eq!(symbol, "BTCUSD");
                assert_eq!(exchanges, vec![ExchangeId::Kraken]);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_request_gets_error_frame() {
        let (broker, id, tx, mut rx) = client().await;
        handle_request(&broker, id, &tx, "not json").await;

        assert!(matches!(
            rx.recv().await.unwrap(),
            ServerMessage::Error { .. }
        ));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_symbol_gets_error_frame() {
        let (broker, id, tx, mut rx) = client().await;
        handle_request(
            &broker,
            id,
            &tx,
            r#"{"action":"unsubscribe","symbol":"ETHUSD","exchanges":[]}"#,
        )
        .await;

        match rx.recv().await.unwrap() {
            ServerMessage::Error { error } => assert!(error.contains("ETHUSD")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
