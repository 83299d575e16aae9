use crate::data_fetcher::ConsumptionSource;
use crate::discovery_publisher::{DiscoveryPublisher, PublishReport, PublishedEntityRegistry};
use crate::errors::SyncError;
use crate::model::{ConsumptionType, Snapshot};
use crate::mqtt_transport::MessageTransport;
use crate::normalizer::{normalize, RawPortalData, ReferenceTable};
use crate::portal_session::{Credentials, SessionProvider};
use crate::snapshot_cache::{CacheOrigin, SnapshotCache, DEFAULT_FRESHNESS_WINDOW};
use std::future::Future;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Authenticating,
    Fetching,
    Publishing,
    Sleeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    pub interval: Duration,
    pub freshness: Duration,
    /// Shorter delay after an authentication failure. `None` keeps the full interval.
    pub auth_retry: Option<Duration>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SCAN_INTERVAL,
            freshness: DEFAULT_FRESHNESS_WINDOW,
            auth_retry: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub origin: CacheOrigin,
    pub published: PublishReport,
}

/// Drives the periodic sync: login, fetch, normalize, publish, sleep.
///
/// Owns the snapshot cache and the entity registry for the lifetime of the
/// process. A failing cycle is logged and followed by the next sleep; only
/// the shutdown future ends [`SyncCoordinator::run`].
pub struct SyncCoordinator<S, F, T> {
    sessions: S,
    source: F,
    publisher: DiscoveryPublisher<T>,
    credentials: Credentials,
    references: ReferenceTable,
    settings: SyncSettings,
    cache: SnapshotCache,
    registry: PublishedEntityRegistry,
    phase: SyncPhase,
}

impl<S, F, T> SyncCoordinator<S, F, T>
where
    S: SessionProvider,
    F: ConsumptionSource,
    T: MessageTransport,
{
    pub fn new(
        sessions: S,
        source: F,
        publisher: DiscoveryPublisher<T>,
        credentials: Credentials,
        settings: SyncSettings,
    ) -> Self {
        Self {
            sessions,
            source,
            publisher,
            credentials,
            references: ReferenceTable::new(),
            settings,
            cache: SnapshotCache::new(),
            registry: PublishedEntityRegistry::new(),
            phase: SyncPhase::Idle,
        }
    }

    pub fn with_references(mut self, references: ReferenceTable) -> Self {
        self.references = references;
        self
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    pub fn registry(&self) -> &PublishedEntityRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn publisher(&self) -> &DiscoveryPublisher<T> {
        &self.publisher
    }

    /// One full cycle. Authentication and fetching only happen when the
    /// cached snapshot is older than the freshness window.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, SyncError> {
        let sessions = &self.sessions;
        let source = &self.source;
        let credentials = &self.credentials;
        let references = &self.references;
        let phase = &mut self.phase;
        let keep_previous = self.cache.snapshot().is_some();
        let cached = self
            .cache
            .get_or_fetch(self.settings.freshness, move || {
                collect(sessions, source, credentials, references, keep_previous, phase)
            })
            .await;

        let cached = match cached {
            Ok(cached) => cached,
            Err(e) => {
                self.phase = SyncPhase::Idle;
                return Err(e);
            }
        };

        match &cached.origin {
            CacheOrigin::Fresh => debug!("Cached snapshot still fresh, portal not queried"),
            CacheOrigin::Refreshed => debug!("Snapshot refreshed from portal"),
            CacheOrigin::Stale(e) => warn!(error = %e, "Portal sync failed, republishing cached snapshot"),
        }

        self.phase = SyncPhase::Publishing;
        let published = self.publisher.publish(cached.snapshot, &mut self.registry).await;
        let origin = cached.origin;
        self.phase = SyncPhase::Idle;

        Ok(CycleReport {
            origin,
            published: published?,
        })
    }

    /// Delay before the next cycle, based on how this one ended.
    pub fn next_delay(&self, result: &Result<CycleReport, SyncError>) -> Duration {
        let auth_failed = match result {
            Err(SyncError::Authentication(_)) => true,
            Ok(report) => matches!(report.origin, CacheOrigin::Stale(SyncError::Authentication(_))),
            Err(_) => false,
        };
        match self.settings.auth_retry {
            Some(retry) if auth_failed => retry,
            _ => self.settings.interval,
        }
    }

    /// Runs cycles until `shutdown` resolves, then closes the transport.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        info!(interval = ?self.settings.interval, "Starting sync loop");

        loop {
            let result = self.run_cycle().await;
            match &result {
                Ok(report) => info!(
                    entities = report.published.entities_updated,
                    discovery = report.published.discovery_sent,
                    "Sync cycle complete"
                ),
                Err(e) => error!(error = %e, "Sync cycle failed"),
            }

            let delay = self.next_delay(&result);
            self.phase = SyncPhase::Sleeping;
            info!(next_in = ?delay, "Sleeping until next sync");

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("Shutdown requested, closing MQTT connection");
        self.publisher.close().await;
        self.phase = SyncPhase::Idle;
    }
}

/// Logs in and pulls everything for one snapshot. The session is dropped on return.
///
/// With `keep_previous` set, a fetch where every consumption type failed is
/// an error so the cached snapshot stays in place. Without a previous
/// snapshot the best-effort result (account plus absent totals) is returned.
async fn collect<S, F>(
    sessions: &S,
    source: &F,
    credentials: &Credentials,
    references: &ReferenceTable,
    keep_previous: bool,
    phase: &mut SyncPhase,
) -> Result<Snapshot, SyncError>
where
    S: SessionProvider,
    F: ConsumptionSource,
{
    *phase = SyncPhase::Authenticating;
    let session = sessions.acquire(credentials).await?;

    *phase = SyncPhase::Fetching;
    let (account, heating, hot_water, cold_water) = tokio::join!(
        source.fetch_account(&session),
        source.fetch_consumption(&session, ConsumptionType::Heating),
        source.fetch_consumption(&session, ConsumptionType::HotWater),
        source.fetch_consumption(&session, ConsumptionType::ColdWater),
    );

    let mut raw = RawPortalData::default();
    raw.account = match account {
        Ok(account) => Some(account),
        Err(e) => {
            warn!(error = %e, "Account fetch failed, skipping customer info");
            None
        }
    };

    let results = [heating, hot_water, cold_water];
    // A rejected session fails every type alike; treat it as a failed login.
    if let Some(e) = results.iter().filter_map(|r| r.as_ref().err()).find(|e| !e.is_partial()) {
        return Err(e.clone());
    }

    let results = ConsumptionType::ALL.into_iter().zip(results);
    let mut first_error = None;
    let mut succeeded = 0;
    for (consumption_type, result) in results {
        match &result {
            Ok(consumption) => {
                succeeded += 1;
                debug!(%consumption_type, rows = consumption.table.len(), "Consumption fetched");
            }
            Err(e) => {
                warn!(%consumption_type, error = %e, "Consumption fetch failed, type published as unavailable");
                first_error.get_or_insert_with(|| e.clone());
            }
        }
        raw.consumption.insert(consumption_type, result);
    }

    // Nothing usable came back; keep whatever the cache holds.
    if let (0, Some(e), true) = (succeeded, first_error, keep_previous) {
        return Err(e);
    }

    Ok(normalize(&raw, references, OffsetDateTime::now_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_fetcher::{RawConsumption, RawMeterRecord};
    use crate::home_assistant::{EntityKey, Topics};
    use crate::portal_session::{RawAccount, Session};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    #[derive(Clone, Default)]
    struct FakeSessions {
        logins: Arc<AtomicUsize>,
        reject: Arc<AtomicBool>,
    }

    #[async_trait]
    impl SessionProvider for FakeSessions {
        async fn acquire(&self, _credentials: &Credentials) -> Result<Session, SyncError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.reject.load(Ordering::SeqCst) {
                return Err(SyncError::Authentication("invalid credentials".to_string()));
            }
            Ok(Session::new(reqwest::Client::new(), "4711"))
        }
    }

    #[derive(Clone, Default)]
    struct FakePortal {
        failing: Option<ConsumptionType>,
        all_down: Arc<AtomicBool>,
        session_rejected: bool,
    }

    #[async_trait]
    impl ConsumptionSource for FakePortal {
        async fn fetch_account(&self, _session: &Session) -> Result<RawAccount, SyncError> {
            Ok(RawAccount {
                user_number: Some("4711".to_string()),
                email: Some("tenant@example.com".to_string()),
                ..Default::default()
            })
        }

        async fn fetch_consumption(
            &self,
            _session: &Session,
            consumption_type: ConsumptionType,
        ) -> Result<RawConsumption, SyncError> {
            if self.session_rejected {
                return Err(SyncError::Authentication("session expired".to_string()));
            }
            if self.all_down.load(Ordering::SeqCst) || self.failing == Some(consumption_type) {
                return Err(SyncError::Fetch("HTTP 503".to_string()));
            }
            Ok(RawConsumption {
                table: vec![RawMeterRecord {
                    raum: Some("Küche".to_string()),
                    ger_nr: Some(format!("{}1", consumption_type.dialog_key())),
                    ablesung: Some(150.0),
                    anfangsstand: Some(100.0),
                    bewertung: Some(1.0),
                    ..Default::default()
                }],
                chart: Vec::new(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<(String, String)>,
        closed: bool,
    }

    #[async_trait]
    impl MessageTransport for RecordingTransport {
        async fn publish(&mut self, topic: &str, payload: Vec<u8>, _retain: bool) -> Result<(), SyncError> {
            self.sent
                .push((topic.to_string(), String::from_utf8_lossy(&payload).into_owned()));
            Ok(())
        }

        async fn close(&mut self) {
            self.closed = true;
        }
    }

    fn coordinator(
        sessions: FakeSessions,
        portal: FakePortal,
        settings: SyncSettings,
    ) -> SyncCoordinator<FakeSessions, FakePortal, RecordingTransport> {
        let publisher = DiscoveryPublisher::new(RecordingTransport::default(), Topics::default());
        let credentials = Credentials {
            email: "tenant@example.com".to_string(),
            password: "secret".to_string(),
        };
        SyncCoordinator::new(sessions, portal, publisher, credentials, settings)
    }

    fn state_of<'a>(sent: &'a [(String, String)], object_id: &str) -> Vec<&'a str> {
        let topic = format!("minol/{object_id}/state");
        sent.iter()
            .filter(|(t, _)| *t == topic)
            .map(|(_, p)| p.as_str())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cache_skips_portal() {
        let sessions = FakeSessions::default();
        let mut sync = coordinator(sessions.clone(), FakePortal::default(), SyncSettings::default());

        let first = assert_ok!(sync.run_cycle().await);
        assert_eq!(first.origin, CacheOrigin::Refreshed);
        assert_eq!(first.published.discovery_sent, 7);

        let second = assert_ok!(sync.run_cycle().await);
        assert_eq!(second.origin, CacheOrigin::Fresh);
        assert_eq!(second.published.discovery_sent, 0);
        assert_eq!(sessions.logins.load(Ordering::SeqCst), 1);
        assert_eq!(sync.registry().len(), 7);
        assert_eq!(sync.phase(), SyncPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_login_republishes_stale_snapshot() {
        let sessions = FakeSessions::default();
        let mut sync = coordinator(sessions.clone(), FakePortal::default(), SyncSettings::default());
        assert_ok!(sync.run_cycle().await);
        let fetched_at = sync.cache().snapshot().map(|s| s.fetched_at);

        tokio::time::advance(Duration::from_secs(2 * 60 * 60)).await;
        sessions.reject.store(true, Ordering::SeqCst);

        let report = assert_ok!(sync.run_cycle().await);
        assert!(matches!(report.origin, CacheOrigin::Stale(SyncError::Authentication(_))));
        assert_eq!(sync.cache().snapshot().map(|s| s.fetched_at), fetched_at);

        let sent = &sync.publisher().transport().sent;
        assert_eq!(state_of(sent, "heating_total"), vec!["50", "50"]);
    }

    #[tokio::test]
    async fn test_failed_login_without_cache_is_error() {
        let sessions = FakeSessions::default();
        sessions.reject.store(true, Ordering::SeqCst);
        let mut sync = coordinator(sessions, FakePortal::default(), SyncSettings::default());

        let result = sync.run_cycle().await;

        assert!(matches!(result, Err(SyncError::Authentication(_))));
        assert!(sync.publisher().transport().sent.is_empty());
        assert!(sync.registry().is_empty());
    }

    #[tokio::test]
    async fn test_one_failed_type_is_published_as_unavailable() {
        let portal = FakePortal {
            failing: Some(ConsumptionType::HotWater),
            ..Default::default()
        };
        let mut sync = coordinator(FakeSessions::default(), portal, SyncSettings::default());

        assert_ok!(sync.run_cycle().await);

        let sent = &sync.publisher().transport().sent;
        assert_eq!(state_of(sent, "hot_water_total"), vec!["None"]);
        assert_eq!(state_of(sent, "heating_total"), vec!["50"]);
        assert_eq!(state_of(sent, "cold_water_total"), vec!["50"]);
        assert!(sync
            .registry()
            .is_registered(&EntityKey::Total(ConsumptionType::HotWater)));
    }

    #[tokio::test]
    async fn test_all_types_failing_without_cache_publishes_account() {
        let portal = FakePortal::default();
        portal.all_down.store(true, Ordering::SeqCst);
        let mut sync = coordinator(FakeSessions::default(), portal, SyncSettings::default());

        let report = assert_ok!(sync.run_cycle().await);

        assert_eq!(report.origin, CacheOrigin::Refreshed);
        let sent = &sync.publisher().transport().sent;
        assert_eq!(state_of(sent, "customer_info"), vec!["4711"]);
        for object_id in ["heating_total", "hot_water_total", "cold_water_total"] {
            assert_eq!(state_of(sent, object_id), vec!["None"]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_types_failing_keeps_cached_snapshot() {
        let portal = FakePortal::default();
        let mut sync = coordinator(FakeSessions::default(), portal.clone(), SyncSettings::default());
        assert_ok!(sync.run_cycle().await);
        let cached = sync.cache().snapshot().cloned();

        tokio::time::advance(Duration::from_secs(2 * 60 * 60)).await;
        portal.all_down.store(true, Ordering::SeqCst);

        let report = assert_ok!(sync.run_cycle().await);
        assert!(matches!(report.origin, CacheOrigin::Stale(SyncError::Fetch(_))));
        assert_eq!(sync.cache().snapshot().cloned(), cached);
        assert_eq!(state_of(&sync.publisher().transport().sent, "heating_total"), vec!["50", "50"]);
    }

    #[tokio::test]
    async fn test_rejected_session_fails_the_fetch() {
        let portal = FakePortal {
            session_rejected: true,
            ..Default::default()
        };
        let mut sync = coordinator(FakeSessions::default(), portal, SyncSettings::default());

        let result = sync.run_cycle().await;

        assert!(matches!(result, Err(SyncError::Authentication(_))));
        assert!(sync.publisher().transport().sent.is_empty());
    }

    #[test]
    fn test_next_delay() {
        let settings = SyncSettings {
            auth_retry: Some(Duration::from_secs(15 * 60)),
            ..Default::default()
        };
        let sync = coordinator(FakeSessions::default(), FakePortal::default(), settings);

        let auth = Err(SyncError::Authentication("denied".to_string()));
        let transport = Err(SyncError::Transport("down".to_string()));
        assert_eq!(sync.next_delay(&auth), Duration::from_secs(15 * 60));
        assert_eq!(sync.next_delay(&transport), DEFAULT_SCAN_INTERVAL);

        let default_sync = coordinator(FakeSessions::default(), FakePortal::default(), SyncSettings::default());
        assert_eq!(default_sync.next_delay(&auth), DEFAULT_SCAN_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_shutdown() {
        let sessions = FakeSessions::default();
        let mut sync = coordinator(sessions.clone(), FakePortal::default(), SyncSettings::default());

        let shutdown = tokio::time::sleep(DEFAULT_SCAN_INTERVAL * 2 + Duration::from_secs(1));
        sync.run(shutdown).await;

        assert_eq!(sessions.logins.load(Ordering::SeqCst), 3);
        assert!(sync.publisher().transport().closed);
        let sent = &sync.publisher().transport().sent;
        assert_eq!(state_of(sent, "customer_info").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_keeps_loop_alive() {
        struct BrokenTransport;

        #[async_trait]
        impl MessageTransport for BrokenTransport {
            async fn publish(&mut self, _topic: &str, _payload: Vec<u8>, _retain: bool) -> Result<(), SyncError> {
                Err(SyncError::Transport("connection refused".to_string()))
            }
        }

        let sessions = FakeSessions::default();
        let publisher = DiscoveryPublisher::new(BrokenTransport, Topics::default());
        let credentials = Credentials {
            email: "tenant@example.com".to_string(),
            password: "secret".to_string(),
        };
        let mut sync = SyncCoordinator::new(
            sessions.clone(),
            FakePortal::default(),
            publisher,
            credentials,
            SyncSettings::default(),
        );

        let result = sync.run_cycle().await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
        // the snapshot was stored before publishing failed
        assert!(sync.cache().snapshot().is_some());

        sync.run(tokio::time::sleep(DEFAULT_SCAN_INTERVAL / 2)).await;
        assert_eq!(sessions.logins.load(Ordering::SeqCst), 1);
    }
}
