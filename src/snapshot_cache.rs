use crate::errors::SyncError;
use crate::model::Snapshot;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Where the snapshot handed out by [`SnapshotCache::get_or_fetch`] came from.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheOrigin {
    /// Held snapshot was younger than the freshness window; nothing was fetched.
    Fresh,
    /// The fetch succeeded and replaced the held snapshot.
    Refreshed,
    /// The fetch failed; the previous snapshot is served unchanged.
    Stale(SyncError),
}

#[derive(Debug)]
pub struct CachedSnapshot<'a> {
    pub snapshot: &'a Snapshot,
    pub origin: CacheOrigin,
}

struct Held {
    snapshot: Snapshot,
    stored_at: Instant,
}

/// Holds at most one snapshot. Serving stale data beats blanking out state
/// during a portal outage.
#[derive(Default)]
pub struct SnapshotCache {
    held: Option<Held>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.held.as_ref().map(|h| &h.snapshot)
    }

    pub fn age(&self) -> Option<Duration> {
        self.held.as_ref().map(|h| h.stored_at.elapsed())
    }

    pub async fn get_or_fetch<F, Fut>(
        &mut self,
        freshness: Duration,
        fetch: F,
    ) -> Result<CachedSnapshot<'_>, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Snapshot, SyncError>>,
    {
        let fresh = self
            .held
            .as_ref()
            .is_some_and(|h| h.stored_at.elapsed() < freshness);

        let origin = if fresh {
            CacheOrigin::Fresh
        } else {
            match fetch().await {
                Ok(snapshot) => {
                    self.held = Some(Held {
                        snapshot,
                        stored_at: Instant::now(),
                    });
                    CacheOrigin::Refreshed
                }
                Err(e) if self.held.is_some() => CacheOrigin::Stale(e),
                Err(e) => return Err(e),
            }
        };

        match &self.held {
            Some(held) => Ok(CachedSnapshot {
                snapshot: &held.snapshot,
                origin,
            }),
            None => Err(SyncError::Fetch("no snapshot available".to_string())),
        }
    }
}
