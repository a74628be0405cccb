//! Fan-out of merged book views to subscriber connections.
//!
//! The broker owns the subscription registry and a tick loop. Each tick it
//! computes every distinct (symbol, exchange set) view once, regardless of
//! how many connections subscribed to it, and pushes the frame through each
//! subscriber's outbound channel. A connection whose channel is gone is
//! pruned on the spot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info};

use crate::aggregator::Aggregator;
use crate::exchange::ExchangeId;
use crate::models::{ServerMessage, iso_timestamp};

/// Default interval between merged-view broadcasts.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Depth of each side in a broadcast frame.
pub const BROADCAST_DEPTH: usize = 10;

/// Identifier handed to each subscriber connection on registration.
pub type ClientId = u64;

struct Client {
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Symbol to the exchange set it is subscribed under. Resubscribing
    /// the same symbol replaces the set.
    subscriptions: HashMap<String, Vec<ExchangeId>>,
}

/// Subscription registry and broadcast scheduler.
pub struct Broker {
    aggregator: Arc<Aggregator>,
    tick_interval: Duration,
    next_id: AtomicU64,
    clients: Mutex<HashMap<ClientId, Client>>,
}

impl Broker {
    #[must_use]
    pub fn new(aggregator: Arc<Aggregator>, tick_interval: Duration) -> Self {
        Self {
            aggregator,
            tick_interval,
            next_id: AtomicU64::new(1),
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a connection and returns its id. `tx` receives every
    /// frame the broker wants delivered to this connection.
    pub async fn register(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.lock().await.insert(
            id,
            Client {
                tx,
                subscriptions: HashMap::new(),
            },
        );
        info!(client = id, "client registered");
        id
    }

    /// Drops a connection and all of its subscriptions.
    pub async fn unregister(&self, id: ClientId) {
        if self.clients.lock().await.remove(&id).is_some() {
            info!(client = id, "client unregistered");
        }
    }

    /// Subscribes `id` to a symbol across an exchange set. An empty set
    /// means all exchanges. Subscribing the same symbol again replaces the
    /// previous set, so the call is idempotent.
    ///
    /// Returns the normalized exchange set echoed in the acknowledgement.
    pub async fn subscribe(
        &self,
        id: ClientId,
        symbol: &str,
        exchanges: &[ExchangeId],
    ) -> Vec<ExchangeId> {
        let set = normalize_exchanges(exchanges);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get_mut(&id) {
            client
                .subscriptions
                .insert(symbol.to_string(), set.clone());
            debug!(client = id, %symbol, ?set, "subscribed");
        }
        set
    }

    /// Removes `id`'s subscription to `symbol`. Returns `false` when no
    /// such subscription existed; the caller reports that to the client.
    pub async fn unsubscribe(&self, id: ClientId, symbol: &str) -> bool {
        let mut clients = self.clients.lock().await;
        let removed = clients
            .get_mut(&id)
            .is_some_and(|client| client.subscriptions.remove(symbol).is_some());
        if removed {
            debug!(client = id, %symbol, "unsubscribed");
        }
        removed
    }

    /// Broadcast loop. Runs until the process shuts down.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            self.broadcast_tick().await;
        }
    }

    /// Computes each distinct subscribed view once and delivers it.
    async fn broadcast_tick(&self) {
        // (symbol, exchange set) -> clients wanting it. Built under the
        // lock, but the merge reads happen after it is released.
        let mut wanted: BTreeMap<(String, Vec<ExchangeId>), Vec<ClientId>> = BTreeMap::new();
        {
            let clients = self.clients.lock().await;
            for (id, client) in clients.iter() {
                for (symbol, set) in &client.subscriptions {
                    wanted
                        .entry((symbol.clone(), set.clone()))
                        .or_default()
                        .push(*id);
                }
            }
        }

        for ((symbol, set), subscribers) in wanted {
            let view = self
                .aggregator
                .merged_view(&symbol, &set, BROADCAST_DEPTH)
                .await;
            if view.is_empty() {
                continue;
            }
            let frame = ServerMessage::book_update(view, iso_timestamp());

            let mut dead = Vec::new();
            {
                let clients = self.clients.lock().await;
                for id in subscribers {
                    match clients.get(&id) {
                        Some(client) if client.tx.send(frame.clone()).is_ok() => {}
                        Some(_) => dead.push(id),
                        None => {}
                    }
                }
            }
            for id in dead {
                self.unregister(id).await;
            }
        }
    }
}

/// Sorts and dedups an exchange set; an empty request means all exchanges.
fn normalize_exchanges(exchanges: &[ExchangeId]) -> Vec<ExchangeId> {
    let mut set: Vec<ExchangeId> = if exchanges.is_empty() {
        ExchangeId::ALL.to_vec()
    } else {
        exchanges.to_vec()
    };
    set.sort_unstable();
    set.dedup();
    set
}
