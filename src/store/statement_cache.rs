use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::export::health::HealthMetrics;

use super::Statement;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StatementKey {
    database: String,
    table: &'static str,
}

impl StatementKey {
    fn new(database: &str, table: &'static str) -> Self {
        Self {
            database: database.to_string(),
            table,
        }
    }
}

struct CachedStatement {
    statement: Arc<Statement>,
    last_used: Instant,
}

/// Registry of compiled statements keyed by (database, table).
///
/// Every lookup refreshes the entry's last-used time. Entries idle longer
/// than `idle_timeout` are closed and dropped, either lazily on lookup or by
/// the periodic sweep. At most one live statement exists per key.
pub struct StatementCache {
    entries: DashMap<StatementKey, CachedStatement>,
    idle_timeout: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl StatementCache {
    pub fn new(idle_timeout: Duration, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            entries: DashMap::new(),
            idle_timeout,
            health,
        }
    }

    pub fn get(&self, database: &str, table: &'static str) -> Option<Arc<Statement>> {
        self.get_at(database, table, Instant::now())
    }

    /// Looks up a statement as of `now`, evicting it if it went idle or was
    /// closed underneath the cache.
    pub fn get_at(&self, database: &str, table: &'static str, now: Instant) -> Option<Arc<Statement>> {
        let key = StatementKey::new(database, table);

        {
            let mut entry = self.entries.get_mut(&key)?;
            if !self.is_stale(&entry, now) {
                entry.last_used = now;
                return Some(Arc::clone(&entry.statement));
            }
        }

        let removed = self
            .entries
            .remove_if(&key, |_, cached| self.is_stale(cached, now));
        if let Some((_, stale)) = removed {
            stale.statement.close();
            self.record_evictions(1);
        }

        None
    }

    /// Registers a freshly compiled statement and returns the live one.
    ///
    /// If another caller registered the same key first, `statement` is
    /// closed and the existing entry is returned.
    pub fn put(&self, database: &str, table: &'static str, statement: Statement) -> Arc<Statement> {
        let candidate = Arc::new(statement);
        let now = Instant::now();

        let live = {
            let mut entry = self
                .entries
                .entry(StatementKey::new(database, table))
                .or_insert_with(|| CachedStatement {
                    statement: Arc::clone(&candidate),
                    last_used: now,
                });
            if entry.statement.is_closed() {
                entry.statement = Arc::clone(&candidate);
            }
            entry.last_used = now;
            Arc::clone(&entry.statement)
        };

        if !Arc::ptr_eq(&live, &candidate) {
            candidate.close();
        }
        self.record_size();

        live
    }

    /// Closes and drops entries idle as of `now`. Returns how many went.
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let mut evicted = 0;
        self.entries.retain(|key, cached| {
            if self.is_idle(cached.last_used, now) {
                cached.statement.close();
                tracing::debug!(database = %key.database, table = key.table, "statement evicted");
                evicted += 1;
                false
            } else {
                true
            }
        });

        self.record_evictions(evicted);
        evicted
    }

    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    /// Closes every live statement.
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        self.entries.retain(|_, cached| {
            cached.statement.close();
            closed += 1;
            false
        });
        self.record_size();
        closed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs the idle sweep every `idle_timeout` until `cancel` fires, then
    /// closes everything still cached.
    pub fn spawn_sweeper(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.idle_timeout);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            // First tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let closed = self.close_all();
                        tracing::info!(closed, "statement cache closed");
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle();
                        if evicted > 0 {
                            tracing::debug!(evicted, remaining = self.len(), "statement sweep");
                        }
                    }
                }
            }
        })
    }

    fn is_stale(&self, cached: &CachedStatement, now: Instant) -> bool {
        cached.statement.is_closed() || self.is_idle(cached.last_used, now)
    }

    fn is_idle(&self, last_used: Instant, now: Instant) -> bool {
        now.saturating_duration_since(last_used) > self.idle_timeout
    }

    fn record_evictions(&self, evicted: usize) {
        if let Some(health) = &self.health {
            health.statement_evictions.inc_by(evicted as f64);
        }
        self.record_size();
    }

    fn record_size(&self) {
        if let Some(health) = &self.health {
            health.statement_cache_size.set(self.entries.len() as f64);
        }
    }
}
