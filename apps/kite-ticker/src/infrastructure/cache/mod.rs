//! Latest-Tick Cache
//!
//! Short-lived map from trading symbol to the most recent tick, fed from the
//! tick channel. Entries older than the TTL are treated as absent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::domain::streaming::Tick;

/// Default entry lifetime.
pub const DEFAULT_TICK_TTL: Duration = Duration::from_secs(5);

/// Latest tick per symbol with a freshness bound.
#[derive(Debug)]
pub struct TickCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Tick, Instant)>>,
}

impl Default for TickCache {
    fn default() -> Self {
        Self::new(DEFAULT_TICK_TTL)
    }
}

impl TickCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store a tick under its symbol, replacing the previous one.
    pub fn insert(&self, tick: Tick) {
        self.entries
            .write()
            .insert(tick.symbol.clone(), (tick, Instant::now()));
    }

    /// Latest tick for `symbol` if it is still fresh.
    #[must_use]
    pub fn get(&self, symbol: &str) -> Option<Tick> {
        let entries = self.entries.read();
        entries
            .get(symbol)
            .filter(|(_, stored)| stored.elapsed() < self.ttl)
            .map(|(tick, _)| tick.clone())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, (_, stored)| stored.elapsed() < self.ttl);
        before - entries.len()
    }

    /// Number of stored entries, fresh or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Feed the cache from a tick receiver until cancelled or the channel
    /// closes. Expired entries are purged once per TTL.
    pub fn spawn_feeder(
        self: Arc<Self>,
        mut ticks: broadcast::Receiver<Tick>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut purge = tokio::time::interval(self.ttl.max(Duration::from_millis(1)));
            purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = purge.tick() => {
                        let removed = self.purge_expired();
                        if removed > 0 {
                            tracing::trace!(removed, "Purged stale ticks");
                        }
                    }
                    received = ticks.recv() => match received {
                        Ok(tick) => self.insert(tick),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Tick cache lagging");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::debug!("Tick cache feeder stopped");
        })
    }
}
