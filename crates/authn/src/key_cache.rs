//! Coalescing cache of JWKS key sets.
//!
//! [`KeyCache`] keeps one [`KeySet`] snapshot per [`KeySource`] and hands out
//! `Arc<SigningKey>`s from it.
//!
//! # Architecture
//!
//! ```text
//! get_key(source, kid)
//!   → snapshot fresh (age < ttl, not force-expired)?  → lookup kid
//!   → otherwise join the in-flight refresh for `source`, or start one
//!        refresh task: fetch (bounded by fetch_timeout) → decode
//!                      → swap snapshot → broadcast outcome to every waiter
//!   → lookup kid in the fresh set
//!   → refresh failed? serve the snapshot if it is still within its TTL or
//!     younger than fallback_ttl, else KeyRetrieval
//!
//! get_key_or_refetch(source, kid)
//!   → get_key; kid missing from a cached set → force-expire that set if it
//!     is still live → get_key once more
//! ```
//!
//! # Concurrency
//!
//! - Snapshots live behind a `parking_lot::RwLock`; lookups only take the
//!   read lock and a refresh replaces the whole `Arc<KeySet>`.
//! - At most one fetch per source is outstanding. The fetch runs on its own
//!   Tokio task and publishes its outcome on a `watch` channel, so a caller
//!   that is cancelled while waiting does not cancel the fetch for others.
//! - No lock is held across an `.await`.
//! - Force-expiry keeps the snapshot and the in-flight refresh. Each source
//!   carries a generation bumped by [`KeyCache::invalidate`]; a refresh that
//!   started under an older generation is installed already expired.
//! - A refresh that fails after a force-expiry restores the previous set, so
//!   an outage does not turn one unknown `kid` into a refetch per request.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use fail::fail_point;
use parking_lot::{Mutex, RwLock};
use tokio::{sync::watch, time::Instant};
use tracing::Instrument;

use crate::{
    config::{KeyCacheConfig, KeySource},
    error::{AuthError, ConfigError, FetchError},
    fetcher::{HttpKeySetFetcher, KeySetFetcher},
    jwks::{JwkSet, KeySet, SigningKey},
};

/// Source of the current time for key set ages.
///
/// The default [`SystemClock`] reads `tokio::time::Instant`, which follows
/// Tokio's paused clock in tests.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by `tokio::time::Instant::now`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCacheMetricsSnapshot {
    /// Discovery fetches started.
    pub fetches: u64,
    /// Discovery fetches that failed.
    pub fetch_errors: u64,
    /// Callers that joined a refresh already in flight.
    pub coalesced: u64,
    /// Lookups answered from a fresh snapshot.
    pub hits: u64,
    /// Lookups that found no fresh snapshot.
    pub misses: u64,
    /// Lookups answered from a stale snapshot after a failed refresh.
    pub fallback_hits: u64,
    /// Key sets force-expired because a `kid` was missing from them.
    pub rotations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
    coalesced: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    fallback_hits: AtomicU64,
    rotations: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> KeyCacheMetricsSnapshot {
        KeyCacheMetricsSnapshot {
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fallback_hits: self.fallback_hits.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
        }
    }
}

/// Outcome published by a refresh task; `None` until the fetch completes.
type FetchOutcome = Option<Result<Arc<KeySet>, FetchError>>;

struct Flight {
    id: u64,
    /// Started while the source was force-expired.
    forced: bool,
    outcome: watch::Receiver<FetchOutcome>,
}

/// Per-source cache state.
#[derive(Default)]
struct Entry {
    set: Option<Arc<KeySet>>,
    /// Set by force-expiry; cleared when a refresh installs or restores a set.
    expired: bool,
    generation: u64,
}

#[derive(Default)]
struct Slots {
    entries: HashMap<KeySource, Entry>,
    /// Bumped by [`KeyCache::clear_all`].
    epoch: u64,
}

impl Slots {
    fn stamp(&self, source: &KeySource) -> Stamp {
        Stamp {
            epoch: self.epoch,
            generation: self.entries.get(source).map_or(0, |entry| entry.generation),
        }
    }
}

/// Cache state a refresh started from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    epoch: u64,
    generation: u64,
}

/// Live snapshot as seen by one lookup.
struct Snapshot {
    set: Arc<KeySet>,
    fresh: bool,
}

/// How a lookup obtained its key set.
enum Served {
    /// Fresh snapshot; nothing was fetched.
    Cached,
    /// Result of a refresh. `forced` if the refresh followed a force-expiry.
    Refreshed { forced: bool },
    /// Snapshot served because the refresh failed with this error.
    Fallback(FetchError),
}

struct Inner {
    fetcher: Arc<dyn KeySetFetcher>,
    config: KeyCacheConfig,
    clock: Arc<dyn Clock>,
    slots: RwLock<Slots>,
    in_flight: Mutex<HashMap<KeySource, Flight>>,
    next_flight_id: AtomicU64,
    counters: Counters,
}

/// Shared cache of signing keys fetched from JWKS discovery endpoints.
///
/// Cloning is cheap and every clone shares the same snapshots, in-flight
/// refreshes and counters.
///
/// # Example
///
/// ```no_run
/// use jwks_authn::{KeyCache, KeyCacheConfig, KeySource};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let cache = KeyCache::http(KeyCacheConfig::default())?;
/// let source = KeySource::cognito("us-east-1", "us-east-1_ABC123")?;
/// let key = cache.get_key(&source, "K1").await?;
/// println!("resolved {}", key.kid());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct KeyCache {
    inner: Arc<Inner>,
}

impl KeyCache {
    /// Creates a cache that fetches key sets with `fetcher`.
    #[must_use]
    pub fn new(fetcher: Arc<dyn KeySetFetcher>, config: KeyCacheConfig) -> Self {
        Self::with_clock(fetcher, config, Arc::new(SystemClock))
    }

    /// Creates a cache with an explicit clock.
    #[must_use]
    pub fn with_clock(
        fetcher: Arc<dyn KeySetFetcher>,
        config: KeyCacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                fetcher,
                config,
                clock,
                slots: RwLock::new(Slots::default()),
                in_flight: Mutex::new(HashMap::new()),
                next_flight_id: AtomicU64::new(0),
                counters: Counters::default(),
            }),
        }
    }

    /// Creates a cache backed by [`HttpKeySetFetcher`], using the config's
    /// fetch timeout for HTTP requests.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the HTTP client cannot be built.
    pub fn http(config: KeyCacheConfig) -> Result<Self, ConfigError> {
        let fetcher = HttpKeySetFetcher::builder().timeout(config.fetch_timeout()).build()?;
        Ok(Self::new(Arc::new(fetcher), config))
    }

    /// Resolves the signing key `kid` for `source`.
    ///
    /// Serves from the current snapshot while it is younger than the TTL and
    /// not force-expired; otherwise waits for a refresh (joining one already
    /// in flight) and looks the key up in the fresh set. Never refetches for
    /// an unknown `kid` on its own; see
    /// [`get_key_or_refetch`](Self::get_key_or_refetch).
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownKey`] if the set does not contain `kid`
    /// - [`AuthError::KeyRetrieval`] if a needed refresh failed and no
    ///   fallback snapshot was usable
    #[tracing::instrument(
        skip(self, source),
        fields(authority = source.authority(), pool_id = source.pool_id())
    )]
    pub async fn get_key(
        &self,
        source: &KeySource,
        kid: &str,
    ) -> Result<Arc<SigningKey>, AuthError> {
        let (set, _) = self.resolve_set(source).await?;
        lookup(&set, kid)
    }

    /// Resolves `kid`, refetching once when it is missing from a cached set.
    ///
    /// The set the miss came from is force-expired only if it is still the
    /// live set, so concurrent callers missing the same `kid` share a single
    /// refetch and callers arriving after it look in the new set. A miss in
    /// a set fetched after a force-expiry is final.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownKey`] if `kid` is absent from the refetched set
    /// - [`AuthError::KeyRetrieval`] if the refetch failed and the stale set
    ///   does not contain `kid`
    #[tracing::instrument(
        skip(self, source),
        fields(authority = source.authority(), pool_id = source.pool_id())
    )]
    pub async fn get_key_or_refetch(
        &self,
        source: &KeySource,
        kid: &str,
    ) -> Result<Arc<SigningKey>, AuthError> {
        let (set, served) = self.resolve_set(source).await?;
        if let Some(key) = set.get(kid) {
            return Ok(key);
        }
        match served {
            Served::Refreshed { forced: true } => return Err(AuthError::unknown_key(kid)),
            Served::Fallback(err) => return Err(AuthError::KeyRetrieval { source: err }),
            Served::Cached | Served::Refreshed { forced: false } => {},
        }

        if self.expire_if_current(source, &set) {
            Counters::bump(&self.inner.counters.rotations);
            tracing::debug!("kid not in key set, refetching for key rotation");
        }

        let (set, served) = self.resolve_set(source).await?;
        set.get(kid).ok_or_else(|| match served {
            Served::Fallback(err) => AuthError::KeyRetrieval { source: err },
            Served::Cached | Served::Refreshed { .. } => AuthError::unknown_key(kid),
        })
    }

    /// Fetches the key set for `source` now, regardless of the snapshot's
    /// age, joining a refresh already in flight.
    ///
    /// A failed refresh leaves the current snapshot in place.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyRetrieval`] if the fetch fails.
    #[tracing::instrument(
        skip(self, source),
        fields(authority = source.authority(), pool_id = source.pool_id())
    )]
    pub async fn refresh(&self, source: &KeySource) -> Result<Arc<KeySet>, AuthError> {
        self.await_refresh(source, false).await.map(|(set, _)| set).map_err(AuthError::from)
    }

    /// Force-expires the key set of `source`.
    ///
    /// The set stays available as a fallback, but the next lookup fetches.
    /// A refresh already in flight keeps running and its waiters get its
    /// result; since it started before this call, its set is installed
    /// already expired.
    ///
    /// An audit event is emitted at INFO level.
    #[tracing::instrument(
        skip(self, source),
        fields(authority = source.authority(), pool_id = source.pool_id())
    )]
    pub fn invalidate(&self, source: &KeySource) {
        let expired = {
            let mut slots = self.inner.slots.write();
            let entry = slots.entries.entry(source.clone()).or_default();
            entry.expired = true;
            entry.generation += 1;
            entry.set.is_some()
        };

        tracing::info!(
            audit.action = "invalidate_key_set",
            audit.resource = %source,
            audit.result = "success",
            audit.expired = expired,
            "audit_event"
        );
    }

    /// Drops every snapshot and detaches every in-flight refresh; a detached
    /// refresh still answers its waiters but installs nothing.
    ///
    /// An audit event is emitted at INFO level.
    #[tracing::instrument(skip(self))]
    pub fn clear_all(&self) {
        let evicted = {
            let mut slots = self.inner.slots.write();
            slots.epoch += 1;
            let count = slots.entries.values().filter(|entry| entry.set.is_some()).count();
            slots.entries.clear();
            count
        };
        self.inner.in_flight.lock().clear();

        tracing::info!(
            audit.action = "clear_key_sets",
            audit.resource = "all_key_sources",
            audit.result = "success",
            audit.evicted = evicted,
            "audit_event"
        );
    }

    /// Current snapshot for `source`, fresh or not.
    #[must_use]
    pub fn key_set(&self, source: &KeySource) -> Option<Arc<KeySet>> {
        self.inner.slots.read().entries.get(source).and_then(|entry| entry.set.clone())
    }

    /// Whether lookups for `source` are served without fetching.
    #[must_use]
    pub fn is_fresh(&self, source: &KeySource) -> bool {
        self.snapshot(source).is_some_and(|snapshot| snapshot.fresh)
    }

    /// Number of sources with a snapshot.
    #[must_use]
    pub fn source_count(&self) -> usize {
        self.inner.slots.read().entries.values().filter(|entry| entry.set.is_some()).count()
    }

    /// Cache settings.
    #[must_use]
    pub fn config(&self) -> &KeyCacheConfig {
        &self.inner.config
    }

    /// Current counter values.
    #[must_use]
    pub fn metrics(&self) -> KeyCacheMetricsSnapshot {
        self.inner.counters.snapshot()
    }

    fn snapshot(&self, source: &KeySource) -> Option<Snapshot> {
        let slots = self.inner.slots.read();
        let entry = slots.entries.get(source)?;
        let set = Arc::clone(entry.set.as_ref()?);
        let fresh = !entry.expired && set.age(self.inner.clock.now()) < self.inner.config.ttl();
        Some(Snapshot { set, fresh })
    }

    /// Key set for `source`: the fresh snapshot, a refreshed one, or a stale
    /// one if the refresh failed and it is still usable.
    async fn resolve_set(&self, source: &KeySource) -> Result<(Arc<KeySet>, Served), AuthError> {
        if let Some(snapshot) = self.snapshot(source)
            && snapshot.fresh
        {
            Counters::bump(&self.inner.counters.hits);
            tracing::debug!(cache = "hit", "key set cache hit");
            return Ok((snapshot.set, Served::Cached));
        }

        Counters::bump(&self.inner.counters.misses);
        tracing::debug!(cache = "miss", "key set missing or expired");

        match self.await_refresh(source, true).await {
            Ok(refreshed) => Ok(refreshed),
            Err(err) => match self.snapshot(source) {
                Some(snapshot) if snapshot.fresh || self.within_fallback(&snapshot.set) => {
                    Counters::bump(&self.inner.counters.fallback_hits);
                    tracing::warn!(
                        cache = "fallback",
                        fallback_age_secs = snapshot.set.age(self.inner.clock.now()).as_secs(),
                        error = %err,
                        "serving stale key set, discovery endpoint unavailable"
                    );
                    Ok((snapshot.set, Served::Fallback(err)))
                },
                _ => Err(AuthError::KeyRetrieval { source: err }),
            },
        }
    }

    fn within_fallback(&self, set: &KeySet) -> bool {
        self.inner
            .config
            .fallback_ttl()
            .is_some_and(|fallback_ttl| set.age(self.inner.clock.now()) < fallback_ttl)
    }

    /// Force-expires `source` if `set` is still its live set. Returns
    /// whether `set` was live.
    fn expire_if_current(&self, source: &KeySource, set: &Arc<KeySet>) -> bool {
        let mut slots = self.inner.slots.write();
        let Some(entry) = slots.entries.get_mut(source) else {
            return false;
        };
        if !entry.set.as_ref().is_some_and(|live| Arc::ptr_eq(live, set)) {
            return false;
        }
        if !entry.expired {
            entry.expired = true;
            entry.generation += 1;
        }
        true
    }

    /// Waits for the refresh of `source`, starting one if none is in flight.
    ///
    /// With `reuse_fresh`, a snapshot that became fresh while this caller
    /// was deciding to refresh is returned instead of fetching again.
    async fn await_refresh(
        &self,
        source: &KeySource,
        reuse_fresh: bool,
    ) -> Result<(Arc<KeySet>, Served), FetchError> {
        let (mut outcome, forced) = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(flight) = in_flight.get(source) {
                Counters::bump(&self.inner.counters.coalesced);
                tracing::debug!("joining in-flight key set refresh");
                (flight.outcome.clone(), flight.forced)
            } else {
                if reuse_fresh
                    && let Some(snapshot) = self.snapshot(source)
                    && snapshot.fresh
                {
                    return Ok((snapshot.set, Served::Cached));
                }
                self.start_refresh(&mut in_flight, source)
            }
        };

        let published = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        published
            .unwrap_or_else(|| Err(FetchError::internal("key set refresh ended without a result")))
            .map(|set| (set, Served::Refreshed { forced }))
    }

    fn start_refresh(
        &self,
        in_flight: &mut HashMap<KeySource, Flight>,
        source: &KeySource,
    ) -> (watch::Receiver<FetchOutcome>, bool) {
        let (stamp, forced) = {
            let slots = self.inner.slots.read();
            let forced = slots.entries.get(source).is_some_and(|entry| entry.expired);
            (slots.stamp(source), forced)
        };

        let (tx, rx) = watch::channel(None);
        let id = self.inner.next_flight_id.fetch_add(1, Ordering::Relaxed);
        in_flight.insert(source.clone(), Flight { id, forced, outcome: rx.clone() });

        let guard = FlightGuard { inner: Arc::clone(&self.inner), source: source.clone(), id };
        let span = tracing::debug_span!(
            "key_set_refresh",
            authority = source.authority(),
            pool_id = source.pool_id(),
            forced
        );

        tokio::spawn(
            async move {
                let outcome = guard.inner.fetch_and_install(&guard.source, stamp).await;
                tx.send_replace(Some(outcome));
                drop(guard);
            }
            .instrument(span),
        );

        (rx, forced)
    }
}

impl fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyCache")
            .field("config", &self.inner.config)
            .field("sources", &self.source_count())
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn fetch_and_install(
        &self,
        source: &KeySource,
        stamp: Stamp,
    ) -> Result<Arc<KeySet>, FetchError> {
        Counters::bump(&self.counters.fetches);

        let document = match self.fetch(source).await {
            Ok(document) => document,
            Err(err) => {
                Counters::bump(&self.counters.fetch_errors);
                tracing::warn!(error = %err, "key set fetch failed");
                self.restore(source, stamp);
                return Err(err);
            },
        };

        let set = Arc::new(KeySet::from_jwk_set(&document, self.clock.now()));
        let mut slots = self.slots.write();
        if slots.epoch != stamp.epoch {
            drop(slots);
            tracing::debug!(keys = set.len(), "discarding refreshed key set: cache was cleared");
            return Ok(set);
        }

        let entry = slots.entries.entry(source.clone()).or_default();
        entry.set = Some(Arc::clone(&set));
        let current = entry.generation == stamp.generation;
        if current {
            entry.expired = false;
        }
        drop(slots);

        if current {
            tracing::debug!(keys = set.len(), "installed refreshed key set");
        } else {
            tracing::debug!(
                keys = set.len(),
                "installed refreshed key set as expired: invalidated during fetch"
            );
        }
        Ok(set)
    }

    /// Undoes a force-expiry after a failed refresh, unless the source was
    /// invalidated again or cleared meanwhile.
    fn restore(&self, source: &KeySource, stamp: Stamp) {
        let restored = {
            let mut slots = self.slots.write();
            let epoch = slots.epoch;
            match slots.entries.get_mut(source) {
                Some(entry)
                    if epoch == stamp.epoch
                        && entry.expired
                        && entry.set.is_some()
                        && entry.generation == stamp.generation =>
                {
                    entry.expired = false;
                    true
                },
                _ => false,
            }
        };
        if restored {
            tracing::debug!("restored force-expired key set after failed refresh");
        }
    }

    async fn fetch(&self, source: &KeySource) -> Result<JwkSet, FetchError> {
        fail_point!("key-cache-before-fetch", |_| {
            Err(FetchError::internal("injected failure before key set fetch"))
        });

        let timeout = self.config.fetch_timeout();
        tokio::time::timeout(timeout, self.fetcher.fetch(source))
            .await
            .map_err(|_| FetchError::timeout(timeout))?
    }
}

/// Removes its flight from the in-flight table when the refresh task ends,
/// including when it panics or is cancelled.
struct FlightGuard {
    inner: Arc<Inner>,
    source: KeySource,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight.get(&self.source).is_some_and(|flight| flight.id == self.id) {
            in_flight.remove(&self.source);
        }
    }
}

fn lookup(set: &KeySet, kid: &str) -> Result<Arc<SigningKey>, AuthError> {
    set.get(kid).ok_or_else(|| AuthError::unknown_key(kid))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
    use rstest::rstest;

    use super::*;
    use crate::{jwks::Jwk, testutil::MockKeySetFetcher};

    fn test_jwk(kid: &str) -> Jwk {
        Jwk {
            kty: "OKP".into(),
            kid: Some(kid.into()),
            alg: Some("EdDSA".into()),
            crv: Some("Ed25519".into()),
            x: Some(URL_SAFE_NO_PAD.encode([9u8; 32])),
            ..Jwk::default()
        }
    }

    fn document(kids: &[&str]) -> JwkSet {
        JwkSet { keys: kids.iter().map(|kid| test_jwk(kid)).collect() }
    }

    fn source() -> KeySource {
        KeySource::cognito("us-east-1", "us-east-1_ABC123").unwrap()
    }

    fn cache_with(fetcher: &Arc<MockKeySetFetcher>, config: KeyCacheConfig) -> KeyCache {
        KeyCache::new(Arc::clone(fetcher) as Arc<dyn KeySetFetcher>, config)
    }

    fn ttl_config(ttl_secs: u64) -> KeyCacheConfig {
        KeyCacheConfig::builder().ttl(Duration::from_secs(ttl_secs)).build().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_after_first_fetch() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());

        let first = cache.get_key(&source(), "K1").await.unwrap();
        let second = cache.get_key(&source(), "K1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetcher.calls(), 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.fetches, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_kid_in_fresh_set_does_not_refetch() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());

        cache.get_key(&source(), "K1").await.unwrap();
        let err = cache.get_key(&source(), "K2").await.unwrap_err();

        assert!(matches!(err, AuthError::UnknownKey { ref kid } if kid == "K2"));
        assert_eq!(fetcher.calls(), 1);
    }

    #[rstest]
    #[case::just_before_expiry(59, 1)]
    #[case::at_expiry(60, 2)]
    #[case::long_after_expiry(3_600, 2)]
    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry(#[case] elapsed_secs: u64, #[case] expected_fetches: usize) {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, ttl_config(60));

        cache.get_key(&source(), "K1").await.unwrap();
        tokio::time::advance(Duration::from_secs(elapsed_secs)).await;
        cache.get_key(&source(), "K1").await.unwrap();

        assert_eq!(fetcher.calls(), expected_fetches);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let fetcher =
            MockKeySetFetcher::with_delay(Ok(document(&["K1"])), Duration::from_millis(250));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..100 {
            let cache = cache.clone();
            tasks.spawn(async move { cache.get_key(&source(), "K1").await });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap().kid(), "K1");
        }

        assert_eq!(fetcher.calls(), 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.fetches, 1);
        assert_eq!(metrics.coalesced, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_is_key_retrieval() {
        let fetcher = MockKeySetFetcher::new(Err(FetchError::status(503)));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());

        let err = cache.get_key(&source(), "K1").await.unwrap_err();

        assert!(err.is_server_error());
        assert!(matches!(
            err,
            AuthError::KeyRetrieval { source: FetchError::Status { status: 503 } }
        ));
        assert_eq!(cache.metrics().fetch_errors, 1);
        assert!(cache.key_set(&source()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_fresh_snapshot() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        cache.get_key(&source(), "K1").await.unwrap();

        fetcher.respond(Err(FetchError::network("connection reset")));
        assert!(cache.refresh(&source()).await.is_err());

        assert!(cache.get_key(&source(), "K1").await.is_ok());
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_timeout() {
        let fetcher =
            MockKeySetFetcher::with_delay(Ok(document(&["K1"])), Duration::from_secs(30));
        let config =
            KeyCacheConfig::builder().fetch_timeout(Duration::from_secs(2)).build().unwrap();
        let cache = cache_with(&fetcher, config);

        let err = cache.get_key(&source(), "K1").await.unwrap_err();

        assert!(matches!(
            err,
            AuthError::KeyRetrieval { source: FetchError::Timeout { timeout } }
                if timeout == Duration::from_secs(2)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_serves_expired_set_when_refresh_fails() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let config = KeyCacheConfig::builder()
            .ttl(Duration::from_secs(60))
            .fallback_ttl(Duration::from_secs(600))
            .build()
            .unwrap();
        let cache = cache_with(&fetcher, config);
        cache.get_key(&source(), "K1").await.unwrap();

        fetcher.respond(Err(FetchError::timeout(Duration::from_secs(10))));
        tokio::time::advance(Duration::from_secs(61)).await;

        let key = cache.get_key(&source(), "K1").await.unwrap();
        assert_eq!(key.kid(), "K1");
        assert_eq!(cache.metrics().fallback_hits, 1);

        tokio::time::advance(Duration::from_secs(600)).await;
        let err = cache.get_key(&source(), "K1").await.unwrap_err();
        assert!(err.is_server_error(), "fallback window must be bounded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fallback_without_fallback_ttl() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, ttl_config(60));
        cache.get_key(&source(), "K1").await.unwrap();

        fetcher.respond(Err(FetchError::status(500)));
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(cache.get_key(&source(), "K1").await.unwrap_err().is_server_error());
        assert_eq!(cache.metrics().fallback_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_on_expired_set_share_one_fetch() {
        let fetcher =
            MockKeySetFetcher::with_delay(Ok(document(&["K1"])), Duration::from_millis(250));
        let cache = cache_with(&fetcher, ttl_config(60));
        cache.get_key(&source(), "K1").await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..100 {
            let cache = cache.clone();
            tasks.spawn(async move { cache.get_key(&source(), "K1").await });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap().kid(), "K1");
        }

        assert_eq!(fetcher.calls(), 2);
        assert_eq!(cache.metrics().coalesced, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_forces_refetch_but_keeps_set() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        cache.get_key(&source(), "K1").await.unwrap();

        cache.invalidate(&source());
        assert!(cache.key_set(&source()).is_some());
        assert!(!cache.is_fresh(&source()));

        fetcher.respond(Ok(document(&["K1", "K2"])));
        cache.get_key(&source(), "K2").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert!(cache.is_fresh(&source()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_joins_refresh_in_flight() {
        let fetcher = MockKeySetFetcher::with_delay(Ok(document(&["K1"])), Duration::from_secs(1));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());

        let waiter = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_key(&source(), "K1").await })
        };
        while fetcher.calls() == 0 {
            tokio::task::yield_now().await;
        }

        cache.invalidate(&source());
        let joined = cache.get_key(&source(), "K1").await.unwrap();

        assert_eq!(joined.kid(), "K1");
        assert_eq!(waiter.await.unwrap().unwrap().kid(), "K1");
        assert_eq!(fetcher.calls(), 1, "invalidate must not start a second flight");
        assert_eq!(cache.metrics().coalesced, 1);

        // The set fetched before the invalidation is kept but not trusted.
        assert!(cache.key_set(&source()).is_some());
        assert!(!cache.is_fresh(&source()));
        cache.get_key(&source(), "K1").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidating_one_source_keeps_other_refresh() {
        let fetcher = MockKeySetFetcher::with_delay(Ok(document(&["K1"])), Duration::from_secs(1));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        let other = KeySource::cognito("eu-west-1", "eu-west-1_XYZ").unwrap();

        let pending = {
            let cache = cache.clone();
            let other = other.clone();
            tokio::spawn(async move { cache.get_key(&other, "K1").await })
        };
        while fetcher.calls() == 0 {
            tokio::task::yield_now().await;
        }

        cache.invalidate(&source());
        pending.await.unwrap().unwrap();

        assert!(cache.is_fresh(&other));
        cache.get_key(&other, "K1").await.unwrap();
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_kid_refetches_once() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        cache.get_key(&source(), "K1").await.unwrap();

        fetcher.respond(Ok(document(&["K1", "K2"])));
        assert_eq!(cache.get_key_or_refetch(&source(), "K2").await.unwrap().kid(), "K2");

        let err = cache.get_key_or_refetch(&source(), "K3").await.unwrap_err();
        assert!(matches!(err, AuthError::UnknownKey { ref kid } if kid == "K3"));
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(cache.metrics().rotations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_unknown_kid_share_one_refetch() {
        let fetcher =
            MockKeySetFetcher::with_delay(Ok(document(&["K1"])), Duration::from_millis(250));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        cache.get_key(&source(), "K1").await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..100 {
            let cache = cache.clone();
            tasks.spawn(async move { cache.get_key_or_refetch(&source(), "K2").await });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(matches!(result.unwrap(), Err(AuthError::UnknownKey { .. })));
        }

        assert_eq!(fetcher.calls(), 2, "one warm-up fetch plus one shared refetch");
        assert_eq!(cache.metrics().rotations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_if_current_ignores_replaced_set() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        let stale = cache.refresh(&source()).await.unwrap();
        cache.refresh(&source()).await.unwrap();

        assert!(!cache.expire_if_current(&source(), &stale));
        assert!(cache.is_fresh(&source()));
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refetch_restores_unexpired_set() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        cache.get_key(&source(), "K1").await.unwrap();

        fetcher.respond(Err(FetchError::status(503)));
        let err = cache.get_key_or_refetch(&source(), "K2").await.unwrap_err();
        assert!(err.is_server_error(), "a failed refetch is not an unknown key: {err:?}");

        // Known keys are still served without another fetch.
        for _ in 0..10 {
            assert_eq!(cache.get_key(&source(), "K1").await.unwrap().kid(), "K1");
        }
        assert_eq!(fetcher.calls(), 2);
        assert!(cache.is_fresh(&source()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_kid_during_outage_keeps_fallback() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let config = KeyCacheConfig::builder()
            .ttl(Duration::from_secs(60))
            .fallback_ttl(Duration::from_secs(600))
            .build()
            .unwrap();
        let cache = cache_with(&fetcher, config);
        cache.get_key(&source(), "K1").await.unwrap();

        fetcher.respond(Err(FetchError::status(503)));
        tokio::time::advance(Duration::from_secs(61)).await;

        let err = cache.get_key_or_refetch(&source(), "K2").await.unwrap_err();
        assert!(err.is_server_error());
        assert_eq!(cache.get_key_or_refetch(&source(), "K1").await.unwrap().kid(), "K1");
        assert_eq!(cache.metrics().fallback_hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sources_are_isolated() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        let other = KeySource::cognito("eu-west-1", "eu-west-1_XYZ").unwrap();

        cache.get_key(&source(), "K1").await.unwrap();
        cache.get_key(&other, "K1").await.unwrap();
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(cache.source_count(), 2);

        cache.invalidate(&other);
        assert!(cache.is_fresh(&source()));
        assert!(!cache.is_fresh(&other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_all() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        let other = KeySource::new("issuer.test", "pool").unwrap();
        cache.get_key(&source(), "K1").await.unwrap();
        cache.get_key(&other, "K1").await.unwrap();

        cache.clear_all();

        assert_eq!(cache.source_count(), 0);
        cache.get_key(&source(), "K1").await.unwrap();
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_descriptor_is_skipped() {
        let mut broken = test_jwk("broken");
        broken.x = Some("not base64!".into());
        let fetcher = MockKeySetFetcher::new(Ok(JwkSet { keys: vec![test_jwk("K1"), broken] }));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());

        assert!(cache.get_key(&source(), "K1").await.is_ok());
        assert!(matches!(
            cache.get_key(&source(), "broken").await,
            Err(AuthError::UnknownKey { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_state() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = cache_with(&fetcher, KeyCacheConfig::default());
        let clone = cache.clone();

        cache.get_key(&source(), "K1").await.unwrap();
        clone.get_key(&source(), "K1").await.unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert_eq!(clone.metrics().hits, 1);
    }

    struct FixedClock(Instant);

    impl Clock for FixedClock {
        fn now(&self) -> Instant {
            self.0
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_clock_controls_freshness() {
        let fetcher = MockKeySetFetcher::new(Ok(document(&["K1"])));
        let cache = KeyCache::with_clock(
            Arc::clone(&fetcher) as Arc<dyn KeySetFetcher>,
            ttl_config(1),
            Arc::new(FixedClock(Instant::now())),
        );

        cache.get_key(&source(), "K1").await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        cache.get_key(&source(), "K1").await.unwrap();

        assert_eq!(fetcher.calls(), 1, "a frozen clock never ages the snapshot");
    }
}
