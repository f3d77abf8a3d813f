//! Live search statistics: cached counters and coalesced broadcast
//!
//! Holds one cached snapshot with a short TTL so subscriber reads do
//! not hammer the store. Matcher transitions apply incremental deltas
//! to a fresh cache; a stale cache falls back to a full recompute.
//! Broadcasts are debounced: any burst of stat-affecting events inside
//! the window produces a single `search:stats` emission carrying the
//! final counts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::current_timestamp;
use crate::directory::UserDirectory;
use crate::error::Result;
use crate::protocol::messages::{
    AvgSearchTime, Gender, GenderCounts, SearchStats, STATS_ROOM, UserId,
};
use crate::server::hub::ConnectionHub;
use crate::store::Store;

/// Users with lastActive in this window count as online
pub const ONLINE_WINDOW_MS: u64 = 30_000;

/// Match averages cover this trailing window
pub const MATCH_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// The matcher transition that triggered a stats delta
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsAction {
    Start,
    Cancel,
    Match,
}

/// Cached global counters, derivable from the store at any time
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub searching: GenderCounts,
    pub online: GenderCounts,
    pub avg_search_time: AvgSearchTime,
    /// Unix millis when this snapshot was computed
    pub cached_at: u64,
}

impl StatsSnapshot {
    pub fn to_payload(&self) -> SearchStats {
        SearchStats {
            t: self.searching.t,
            m: self.searching.m,
            f: self.searching.f,
            online: self.online,
            avg_search_time: self.avg_search_time,
        }
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    snapshot: Option<StatsSnapshot>,
    cached_instant: Option<Instant>,
    updating: bool,
    pending: bool,
    broadcast_scheduled: bool,
}

/// Owner of the stats cache and the debounced broadcast loop
pub struct StatsBroadcaster {
    store: Arc<Store>,
    directory: Arc<dyn UserDirectory>,
    hub: Arc<ConnectionHub>,
    cache_ttl: Duration,
    debounce: Duration,
    inner: Mutex<StatsInner>,
}

impl StatsBroadcaster {
    pub fn new(
        store: Arc<Store>,
        directory: Arc<dyn UserDirectory>,
        hub: Arc<ConnectionHub>,
        cache_ttl: Duration,
        debounce: Duration,
    ) -> Self {
        Self {
            store,
            directory,
            hub,
            cache_ttl,
            debounce,
            inner: Mutex::new(StatsInner::default()),
        }
    }

    /// Current snapshot: cached when fresh, recomputed otherwise
    pub async fn snapshot(self: &Arc<Self>) -> Result<StatsSnapshot> {
        {
            let inner = self.inner.lock().await;
            if let (Some(snapshot), Some(at)) = (&inner.snapshot, inner.cached_instant) {
                if at.elapsed() < self.cache_ttl {
                    return Ok(snapshot.clone());
                }
            }
        }
        self.refresh().await
    }

    /// Full recompute from the store and directory
    async fn refresh(self: &Arc<Self>) -> Result<StatsSnapshot> {
        let now = current_timestamp();
        let searching = self.store.searching_counts().await?;
        let online = self
            .directory
            .online_counts(now.saturating_sub(ONLINE_WINDOW_MS))
            .await?;
        let aggregates = self
            .store
            .match_aggregates(now.saturating_sub(MATCH_WINDOW_MS))
            .await?;

        let snapshot = StatsSnapshot {
            searching,
            online,
            avg_search_time: AvgSearchTime {
                t: aggregates.avg_total_ms,
                m: aggregates.avg_male_ms,
                f: aggregates.avg_female_ms,
                matches_24h: aggregates.matches,
            },
            cached_at: now,
        };

        let mut inner = self.inner.lock().await;
        inner.snapshot = Some(snapshot.clone());
        inner.cached_instant = Some(Instant::now());
        Ok(snapshot)
    }

    /// Apply an incremental delta for a matcher transition
    ///
    /// A stale cache, or a gender the counters do not track, invalidates
    /// instead; the next reader recomputes. Always schedules a
    /// (coalesced) rebroadcast.
    pub async fn record(self: &Arc<Self>, action: StatsAction, gender: Gender) {
        {
            let mut inner = self.inner.lock().await;
            let fresh = inner
                .cached_instant
                .map(|at| at.elapsed() < self.cache_ttl)
                .unwrap_or(false);

            if fresh && gender != Gender::Other {
                if let Some(snapshot) = inner.snapshot.as_mut() {
                    apply_delta(snapshot, action, gender);
                }
            } else {
                inner.snapshot = None;
                inner.cached_instant = None;
            }
        }

        self.schedule_broadcast().await;
    }

    /// Schedule a debounced broadcast; bursts inside the window coalesce
    pub async fn schedule_broadcast(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            if inner.broadcast_scheduled {
                return;
            }
            inner.broadcast_scheduled = true;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(this.debounce).await;
            {
                let mut inner = this.inner.lock().await;
                inner.broadcast_scheduled = false;
            }
            this.broadcast_now().await;
        });
    }

    /// Push the current snapshot to every stats subscriber
    fn broadcast_now(
        self: &Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            {
                let mut inner = self.inner.lock().await;
                if inner.updating {
                    inner.pending = true;
                    return;
                }
                inner.updating = true;
            }

            match self.snapshot().await {
                Ok(snapshot) => {
                    let delivered = self
                        .hub
                        .broadcast_to_room(STATS_ROOM, &snapshot.to_payload(), None)
                        .await;
                    debug!(subscribers = delivered, "stats broadcast");
                }
                Err(e) => {
                    // Non-fatal: invalidate so the next reader recomputes
                    warn!(error = %e, "stats refresh failed");
                    let mut inner = self.inner.lock().await;
                    inner.snapshot = None;
                    inner.cached_instant = None;
                }
            }

            let rerun = {
                let mut inner = self.inner.lock().await;
                inner.updating = false;
                std::mem::take(&mut inner.pending)
            };
            if rerun {
                self.schedule_broadcast().await;
            }
        })
    }

    /// Handle `search:subscribe_stats`: join the room and push the
    /// current snapshot immediately, corrected for the subscriber's own
    /// not-yet-reflected search
    pub async fn subscribe(self: &Arc<Self>, session_id: &str, user_id: UserId) -> Result<()> {
        self.hub.join_room(session_id, STATS_ROOM).await;

        let mut snapshot = self.snapshot().await?;
        if let Some(own) = self.store.active_search(user_id).await? {
            if own.created_at >= snapshot.cached_at {
                apply_delta(&mut snapshot, StatsAction::Start, own.gender);
            }
        }

        self.hub
            .send_to_session_event(session_id, &snapshot.to_payload())
            .await;
        Ok(())
    }

    /// Handle `search:unsubscribe_stats`
    pub async fn unsubscribe(&self, session_id: &str) {
        self.hub.leave_room(session_id, STATS_ROOM).await;
    }
}

fn apply_delta(snapshot: &mut StatsSnapshot, action: StatsAction, gender: Gender) {
    let counts = &mut snapshot.searching;
    match action {
        StatsAction::Start => {
            counts.t += 1;
            match gender {
                Gender::Male => counts.m += 1,
                Gender::Female => counts.f += 1,
                Gender::Other => {}
            }
        }
        StatsAction::Cancel => {
            counts.t = counts.t.saturating_sub(1);
            match gender {
                Gender::Male => counts.m = counts.m.saturating_sub(1),
                Gender::Female => counts.f = counts.f.saturating_sub(1),
                Gender::Other => {}
            }
        }
        StatsAction::Match => {
            // Both participants leave searching; only the caller's side
            // is known here, the partner corrects on the next refresh
            counts.t = counts.t.saturating_sub(2);
            match gender {
                Gender::Male => counts.m = counts.m.saturating_sub(1),
                Gender::Female => counts.f = counts.f.saturating_sub(1),
                Gender::Other => {}
            }
            snapshot.avg_search_time.matches_24h += 1;
        }
    }
}
