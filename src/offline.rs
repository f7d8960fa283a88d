//! # Offline Coordinator
//!
//! Decides where a search is served from and keeps the result cache warm.
//!
//! ## Modes
//!
//! | From | Trigger | To |
//! |---|---|---|
//! | any | probe fails | `Offline` |
//! | `Offline` | probe succeeds | `Online` |
//! | `Online` | remote call fails | `Degraded` |
//! | `Degraded` | remote call succeeds | `Online` |
//!
//! Every transition emits [`CoreEvent::ModeChanged`].
//!
//! ## Serving
//!
//! - `Online`/`Degraded`: live search through the [`SearchUnifier`]. A fully
//!   successful result set is cached (pre-rerank) under the normalized query
//!   key. If the remote branch fails the cached copy is served, or the local
//!   results when nothing is cached.
//! - `Offline`: no remote call. Cache hit or local-only results flagged
//!   [`SessionStatus::UnavailableOffline`].

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::{
    serialized_size_estimate, ApproximateSize, BoundedImportanceCache, CacheStatistics,
    EvictionReason,
};
use crate::error::{CoreError, Result};
use crate::events::{CoreEvent, EventHub};
use crate::model::{normalize_text, UnifiedResult};
use crate::sources::ReachabilityProbe;
use crate::unifier::{SearchOptions, SearchUnifier};

/// Number of entries reported in [`SearchCacheStats::popular_queries`]
const POPULAR_QUERY_COUNT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Online,
    /// Reachable, but the last remote call failed
    Degraded,
    Offline,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    Live,
    Cache,
    /// Local library only, nothing cached for the query
    LocalOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Ok,
    /// Remote branch failed, results came from the cache or the library
    RemoteFailed,
    /// Local branch failed, results are remote only
    LocalFailed,
    /// Offline and nothing cached for this query
    UnavailableOffline,
    /// A newer query from the same search box replaced this one
    Superseded,
}

/// Outcome of one coordinated search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSession {
    pub results: Vec<UnifiedResult>,
    pub served_from: ServedFrom,
    pub mode: SearchMode,
    pub status: SessionStatus,
    pub error: Option<String>,
    /// Set when served from the cache
    pub cached_at: Option<DateTime<Utc>>,
    pub truncated: bool,
}

impl SearchSession {
    fn new(results: Vec<UnifiedResult>, served_from: ServedFrom, mode: SearchMode, status: SessionStatus) -> Self {
        Self {
            results,
            served_from,
            mode,
            status,
            error: None,
            cached_at: None,
            truncated: false,
        }
    }

    fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    fn from_cache(cached: CachedSearch, mode: SearchMode, status: SessionStatus) -> Self {
        Self {
            results: cached.results,
            served_from: ServedFrom::Cache,
            mode,
            status,
            error: None,
            cached_at: Some(cached.cached_at),
            truncated: cached.truncated,
        }
    }
}

/// Cached payload for one query key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedSearch {
    pub query: String,
    pub results: Vec<UnifiedResult>,
    pub cached_at: DateTime<Utc>,
    /// Results beyond the per-query limit were dropped
    pub truncated: bool,
}

impl ApproximateSize for CachedSearch {
    fn approximate_size(&self) -> usize {
        serialized_size_estimate(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PopularQuery {
    pub query: String,
    pub count: u64,
}

/// Cache counters plus the most searched queries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchCacheStats {
    #[serde(flatten)]
    pub cache: CacheStatistics,
    pub popular_queries: Vec<PopularQuery>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchStatus {
    pub mode: SearchMode,
    pub last_error: Option<String>,
    /// Offline was requested explicitly; probing is off
    pub forced_offline: bool,
}

/// Normalized cache key: the query alone, plus sorted engines and
/// categories when given
#[must_use]
pub fn cache_key(query: &str, engines: Option<&[String]>, categories: Option<&[String]>) -> String {
    let mut key = normalize_text(query);
    let mut append = |label: &str, values: Option<&[String]>| {
        if let Some(values) = values.filter(|v| !v.is_empty()) {
            let mut values: Vec<String> = values.iter().map(|v| normalize_text(v)).collect();
            values.sort();
            values.dedup();
            key.push_str(&format!("|{label}={}", values.join(",")));
        }
    };
    append("engines", engines);
    append("categories", categories);
    key
}

struct ModeState {
    mode: SearchMode,
    last_error: Option<String>,
    forced_offline: bool,
}

/// One registered call for a search box; see [`OfflineCoordinator::begin`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchTicket {
    search_box: String,
    generation: u64,
}

/// Tunables for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub cache_max_memory: usize,
    pub cache_ttl: Duration,
    pub max_results_per_query: usize,
    pub probe_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            cache_max_memory: 50 * 1024 * 1024,
            cache_ttl: Duration::from_secs(3600),
            max_results_per_query: 100,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

pub struct OfflineCoordinator {
    unifier: SearchUnifier,
    probe: Arc<dyn ReachabilityProbe>,
    cache: Arc<Mutex<BoundedImportanceCache<CachedSearch>>>,
    pending_evictions: Arc<Mutex<Vec<(String, EvictionReason)>>>,
    state: Mutex<ModeState>,
    /// Latest generation per search box with a call in flight. Entries are
    /// removed when that call finishes.
    generations: Mutex<HashMap<String, u64>>,
    next_generation: AtomicU64,
    popular: Mutex<HashMap<String, u64>>,
    events: Arc<EventHub>,
    settings: CoordinatorSettings,
    dirty: AtomicBool,
}

impl fmt::Debug for OfflineCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OfflineCoordinator")
            .field("mode", &self.mode())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OfflineCoordinator {
    #[must_use]
    pub fn new(
        unifier: SearchUnifier,
        probe: Arc<dyn ReachabilityProbe>,
        events: Arc<EventHub>,
        settings: CoordinatorSettings,
    ) -> Self {
        let pending_evictions: Arc<Mutex<Vec<(String, EvictionReason)>>> = Arc::default();
        let mut cache =
            BoundedImportanceCache::new(settings.cache_max_memory).with_default_ttl(settings.cache_ttl);
        let sink = Arc::clone(&pending_evictions);
        // Events go out after the cache lock is released
        cache.set_eviction_listener(move |key, reason| {
            lock(&sink).push((key.to_string(), reason));
        });

        Self {
            unifier,
            probe,
            cache: Arc::new(Mutex::new(cache)),
            pending_evictions,
            state: Mutex::new(ModeState {
                mode: SearchMode::Online,
                last_error: None,
                forced_offline: false,
            }),
            generations: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            popular: Mutex::new(HashMap::new()),
            events,
            settings,
            dirty: AtomicBool::new(false),
        }
    }

    /// Run `f` on the cache, then publish any evictions it caused
    fn with_cache<R>(&self, f: impl FnOnce(&mut BoundedImportanceCache<CachedSearch>) -> R) -> R {
        let result = f(&mut lock(&self.cache));
        let evicted: Vec<(String, EvictionReason)> = std::mem::take(&mut *lock(&self.pending_evictions));
        for (key, reason) in evicted {
            debug!("Cache entry `{key}` removed ({reason:?})");
            self.dirty.store(true, Ordering::Relaxed);
            self.events.emit(&CoreEvent::CacheEvicted { key, reason });
        }
        result
    }

    #[must_use]
    pub fn mode(&self) -> SearchMode {
        lock(&self.state).mode
    }

    #[must_use]
    pub fn status(&self) -> SearchStatus {
        let state = lock(&self.state);
        SearchStatus {
            mode: state.mode,
            last_error: state.last_error.clone(),
            forced_offline: state.forced_offline,
        }
    }

    fn transition(&self, to: SearchMode, reason: Option<String>) {
        let from = {
            let mut state = lock(&self.state);
            if reason.is_some() {
                state.last_error.clone_from(&reason);
            } else if to == SearchMode::Online {
                state.last_error = None;
            }
            if state.mode == to {
                return;
            }
            std::mem::replace(&mut state.mode, to)
        };
        info!("Search mode {from} -> {to}");
        self.events.emit(&CoreEvent::ModeChanged { from, to, reason });
    }

    /// Pin the coordinator to `Offline` (or release it). While pinned the
    /// reachability probe is skipped.
    pub fn force_offline(&self, offline: bool) {
        lock(&self.state).forced_offline = offline;
        if offline {
            self.transition(SearchMode::Offline, Some("offline mode requested".to_string()));
        } else {
            self.transition(SearchMode::Online, None);
        }
    }

    /// Probe the remote endpoint once and apply the result
    pub async fn check_connectivity(&self) -> SearchMode {
        if lock(&self.state).forced_offline {
            return SearchMode::Offline;
        }
        let reachable = tokio::time::timeout(self.settings.probe_timeout, self.probe.probe())
            .await
            .unwrap_or(false);

        match (reachable, self.mode()) {
            (false, _) => self.transition(
                SearchMode::Offline,
                Some("remote endpoint unreachable".to_string()),
            ),
            (true, SearchMode::Offline) => self.transition(SearchMode::Online, None),
            (true, _) => {}
        }
        self.mode()
    }

    /// Register a new call for `search_box`, superseding any call still in
    /// flight for it. `None` when the caller has no search box.
    pub fn begin(&self, search_box: Option<&str>) -> Option<SearchTicket> {
        let search_box = search_box?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.generations).insert(search_box.to_string(), generation);
        Some(SearchTicket {
            search_box: search_box.to_string(),
            generation,
        })
    }

    /// Whether no newer call was started for the ticket's search box. Calls
    /// without a ticket are always current.
    #[must_use]
    pub fn is_current(&self, ticket: Option<&SearchTicket>) -> bool {
        ticket.map_or(true, |ticket| {
            lock(&self.generations).get(&ticket.search_box) == Some(&ticket.generation)
        })
    }

    /// Release the ticket. The latest call for a search box removes its
    /// entry, so the map only holds boxes with a call in flight.
    pub fn finish(&self, ticket: Option<SearchTicket>) {
        if let Some(ticket) = ticket {
            let mut generations = lock(&self.generations);
            if generations.get(&ticket.search_box) == Some(&ticket.generation) {
                generations.remove(&ticket.search_box);
            }
        }
    }

    /// Empty session for a call replaced by a newer one
    #[must_use]
    pub fn superseded(&self, served_from: ServedFrom) -> SearchSession {
        SearchSession::new(Vec::new(), served_from, self.mode(), SessionStatus::Superseded)
    }

    fn cached(&self, key: &str) -> Option<CachedSearch> {
        self.with_cache(|cache| cache.get(key))
    }

    /// Cache `results` for `query`. Oversized or over-budget sets are logged
    /// and skipped.
    pub fn store_results(&self, query: &str, options: &SearchOptions, results: &[UnifiedResult]) -> bool {
        let key = cache_key(query, options.engines.as_deref(), options.categories.as_deref());
        let limit = self.settings.max_results_per_query;
        let payload = CachedSearch {
            query: normalize_text(query),
            results: results.iter().take(limit).cloned().collect(),
            cached_at: Utc::now(),
            truncated: results.len() > limit,
        };
        let stored = self.with_cache(|cache| match cache.try_set(&key, payload, None) {
            Ok(()) => true,
            Err(CoreError::CacheCapacityExceeded { size, budget, .. }) => {
                warn!("Result set for `{key}` ({size} bytes) exceeds cache budget {budget}, not cached");
                false
            }
            Err(e) => {
                warn!("Not caching `{key}`: {e}");
                false
            }
        });
        if stored {
            self.dirty.store(true, Ordering::Relaxed);
        }
        stored
    }

    fn count_popular(&self, query: &str) {
        *lock(&self.popular).entry(normalize_text(query)).or_insert(0) += 1;
    }

    #[must_use]
    pub fn popular_queries(&self, limit: usize) -> Vec<PopularQuery> {
        let mut all: Vec<PopularQuery> = lock(&self.popular)
            .iter()
            .map(|(query, count)| PopularQuery {
                query: query.clone(),
                count: *count,
            })
            .collect();
        all.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.query.cmp(&b.query)));
        all.truncate(limit);
        all
    }

    /// Search according to the current mode. Only fails when both branches
    /// failed and nothing was cached.
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<SearchSession> {
        let ticket = self.begin(options.search_box.as_deref());
        let session = self.search_with_ticket(query, options, ticket.as_ref()).await;
        self.finish(ticket);
        session
    }

    /// [`Self::search`] for a call registered with [`Self::begin`]. Once the
    /// ticket is stale only the cache write still happens.
    pub async fn search_with_ticket(
        &self,
        query: &str,
        options: &SearchOptions,
        ticket: Option<&SearchTicket>,
    ) -> Result<SearchSession> {
        let session = self.serve(query, options, ticket).await;

        if !self.is_current(ticket) {
            debug!("Search `{query}` superseded by a newer query");
            return Ok(self.superseded(session.as_ref().map_or(ServedFrom::LocalOnly, |s| s.served_from)));
        }
        session
    }

    async fn serve(&self, query: &str, options: &SearchOptions, ticket: Option<&SearchTicket>) -> Result<SearchSession> {
        if query.trim().is_empty() {
            return Ok(SearchSession::new(Vec::new(), ServedFrom::Live, self.mode(), SessionStatus::Ok));
        }

        let key = cache_key(query, options.engines.as_deref(), options.categories.as_deref());
        let mode = self.mode();

        if mode == SearchMode::Offline || options.local_only {
            return Ok(self.serve_offline(query, &key, options, mode).await);
        }

        match self.unifier.search(query, options).await {
            Ok(outcome) if !outcome.remote_failed() => {
                if self.is_current(ticket) {
                    self.transition(SearchMode::Online, None);
                    self.count_popular(query);
                }
                let status = if outcome.local_error.is_some() {
                    SessionStatus::LocalFailed
                } else {
                    self.store_results(query, options, &outcome.results);
                    SessionStatus::Ok
                };
                Ok(SearchSession::new(outcome.results, ServedFrom::Live, SearchMode::Online, status)
                    .with_error(outcome.local_error))
            }
            Ok(outcome) => {
                let reason = outcome.remote_error.clone();
                if self.is_current(ticket) {
                    self.remote_failed(reason.clone());
                }
                let mode = self.mode();
                Ok(match self.cached(&key) {
                    Some(cached) => SearchSession::from_cache(cached, mode, SessionStatus::RemoteFailed),
                    None => SearchSession::new(
                        outcome.results,
                        ServedFrom::LocalOnly,
                        mode,
                        SessionStatus::RemoteFailed,
                    ),
                }
                .with_error(reason))
            }
            Err(e) => {
                if self.is_current(ticket) {
                    self.remote_failed(Some(e.to_string()));
                }
                match self.cached(&key) {
                    Some(cached) => Ok(SearchSession::from_cache(cached, self.mode(), SessionStatus::RemoteFailed)
                        .with_error(Some(e.to_string()))),
                    None => {
                        error!("Search `{query}` failed on both branches: {e}");
                        Err(e)
                    }
                }
            }
        }
    }

    fn remote_failed(&self, reason: Option<String>) {
        if self.mode() == SearchMode::Online {
            self.transition(SearchMode::Degraded, reason);
        } else {
            lock(&self.state).last_error = reason;
        }
    }

    async fn serve_offline(&self, query: &str, key: &str, options: &SearchOptions, mode: SearchMode) -> SearchSession {
        if let Some(cached) = self.cached(key) {
            debug!("Serving `{key}` from cache ({mode})");
            return SearchSession::from_cache(cached, mode, SessionStatus::Ok);
        }
        match self.unifier.search_local(query, options).await {
            Ok(results) => SearchSession::new(
                results,
                ServedFrom::LocalOnly,
                mode,
                SessionStatus::UnavailableOffline,
            ),
            Err(e) => {
                error!("Local search for `{query}` failed: {e}");
                SearchSession::new(
                    Vec::new(),
                    ServedFrom::LocalOnly,
                    mode,
                    SessionStatus::UnavailableOffline,
                )
                .with_error(Some(e.to_string()))
            }
        }
    }

    #[must_use]
    pub fn cache_statistics(&self) -> SearchCacheStats {
        SearchCacheStats {
            cache: self.with_cache(|cache| cache.statistics()),
            popular_queries: self.popular_queries(POPULAR_QUERY_COUNT),
        }
    }

    /// Drop every cached result set. Returns how many were removed.
    pub fn clear_cache(&self) -> usize {
        let removed = self.with_cache(BoundedImportanceCache::clear);
        self.dirty.store(true, Ordering::Relaxed);
        info!("Cleared {removed} cached searches");
        self.events.emit(&CoreEvent::CacheCleared { removed });
        removed
    }

    /// Shrink or grow the cache budget; shrinking evicts right away
    pub fn set_cache_budget(&self, max_memory: usize) {
        self.with_cache(|cache| cache.set_max_memory(max_memory));
    }

    /// Expire and relieve pressure once
    pub fn sweep(&self) {
        let report = self.with_cache(BoundedImportanceCache::sweep);
        if report.expired + report.evicted > 0 {
            debug!("Cache sweep: {} expired, {} evicted", report.expired, report.evicted);
        }
    }

    pub fn load_snapshot(&self, path: &Path) -> Result<usize> {
        let restored = self.with_cache(|cache| cache.load_snapshot(path))?;
        if restored > 0 {
            info!("Restored {restored} cached searches from {}", path.display());
        }
        Ok(restored)
    }

    /// Write the cache to `path` and clear the dirty flag
    pub async fn save_snapshot(&self, path: &Path) -> Result<usize> {
        self.dirty.store(false, Ordering::Relaxed);
        let cache = Arc::clone(&self.cache);
        let path = path.to_path_buf();
        let saved = tokio::task::spawn_blocking(move || lock(&cache).save_snapshot(&path)).await??;
        debug!("Saved {saved} cached searches");
        Ok(saved)
    }

    /// Periodic probe, sweep and debounced snapshot save until `cancel` fires
    pub async fn run_maintenance(
        self: Arc<Self>,
        probe_interval: Duration,
        sweep_interval: Duration,
        snapshot_path: Option<PathBuf>,
        cancel: CancellationToken,
    ) {
        let mut probe_tick = tokio::time::interval(probe_interval);
        let mut sweep_tick = tokio::time::interval(sweep_interval);
        probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = probe_tick.tick() => {
                    self.check_connectivity().await;
                }
                _ = sweep_tick.tick() => {
                    self.sweep();
                    if let Some(path) = &snapshot_path {
                        if self.dirty.load(Ordering::Relaxed) {
                            if let Err(e) = self.save_snapshot(path).await {
                                warn!("Failed to save cache snapshot: {e}");
                            }
                        }
                    }
                }
            }
        }
        debug!("Search maintenance stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::model::{LibraryFilters, LocalTrackFields, RemoteResultFields};
    use crate::sources::{LocalLibrary, RemoteSearch};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn track(id: &str, title: &str) -> LocalTrackFields {
        LocalTrackFields {
            id: id.to_string(),
            title: title.to_string(),
            artist: "Radiohead".to_string(),
            album: None,
            duration_sec: None,
            path: None,
            genre: None,
        }
    }

    struct Library;

    #[async_trait]
    impl LocalLibrary for Library {
        async fn query_library(&self, text: &str, _: &LibraryFilters) -> Result<Vec<LocalTrackFields>> {
            Ok(if text.contains("radiohead") {
                vec![track("1", "Airbag")]
            } else {
                Vec::new()
            })
        }

        async fn get_item(&self, _: &str) -> Result<Option<LocalTrackFields>> {
            Ok(None)
        }
    }

    fn remote_result(query: &str) -> RemoteResultFields {
        RemoteResultFields {
            id: format!("https://example.org/{query}"),
            title: "Creep".to_string(),
            artist: "Radiohead".to_string(),
            album: None,
            duration_sec: None,
            url: format!("https://example.org/{query}"),
            engine: None,
            content: None,
            score: None,
        }
    }

    /// Fails while `failing` is set; counts calls
    #[derive(Default)]
    struct Remote {
        failing: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RemoteSearch for Remote {
        async fn search(&self, query: &str, _: Option<&[String]>, _: Option<&[String]>) -> Result<Vec<RemoteResultFields>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(CoreError::RemoteUnavailable("down".to_string()));
            }
            Ok(vec![remote_result(query)])
        }
    }

    /// Answers `slow` after 100 ms, anything else at once
    struct SlowRemote;

    #[async_trait]
    impl RemoteSearch for SlowRemote {
        async fn search(&self, query: &str, _: Option<&[String]>, _: Option<&[String]>) -> Result<Vec<RemoteResultFields>> {
            if query == "slow" {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(vec![remote_result(query)])
        }
    }

    struct Probe(AtomicBool);

    #[async_trait]
    impl ReachabilityProbe for Probe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn build(
        remote: Arc<dyn RemoteSearch>,
        probe: &Arc<Probe>,
        events: Arc<EventHub>,
        settings: CoordinatorSettings,
    ) -> OfflineCoordinator {
        let unifier = SearchUnifier::new(Arc::new(Library), remote, Duration::from_secs(10), Vec::new());
        OfflineCoordinator::new(unifier, Arc::clone(probe) as Arc<dyn ReachabilityProbe>, events, settings)
    }

    fn coordinator(remote: &Arc<Remote>, probe: &Arc<Probe>) -> OfflineCoordinator {
        build(
            Arc::clone(remote) as Arc<dyn RemoteSearch>,
            probe,
            Arc::new(EventHub::new()),
            CoordinatorSettings::default(),
        )
    }

    fn fixtures() -> (Arc<Remote>, Arc<Probe>) {
        (Arc::new(Remote::default()), Arc::new(Probe(AtomicBool::new(true))))
    }

    #[test]
    fn test_cache_key_normalization() {
        assert_eq!(cache_key("  RadioHead  ", None, None), "radiohead");
        let engines = vec!["discogs".to_string(), "Bandcamp".to_string()];
        let categories = vec!["music".to_string()];
        assert_eq!(
            cache_key("radiohead", Some(&engines), Some(&categories)),
            "radiohead|engines=bandcamp,discogs|categories=music"
        );
        assert_eq!(cache_key("radiohead", Some(&[]), None), "radiohead");
    }

    #[tokio::test]
    async fn test_live_search_is_cached() {
        let (remote, probe) = fixtures();
        let coordinator = coordinator(&remote, &probe);

        let session = coordinator.search("radiohead", &SearchOptions::default()).await.unwrap();
        assert_eq!(session.served_from, ServedFrom::Live);
        assert_eq!(session.results.len(), 2);
        assert_eq!(coordinator.cache_statistics().cache.item_count, 1);
        assert_eq!(coordinator.popular_queries(10)[0].query, "radiohead");
    }

    #[tokio::test]
    async fn test_offline_serves_cache_without_remote_call() {
        let (remote, probe) = fixtures();
        let coordinator = coordinator(&remote, &probe);
        coordinator.search("radiohead", &SearchOptions::default()).await.unwrap();

        probe.0.store(false, Ordering::SeqCst);
        assert_eq!(coordinator.check_connectivity().await, SearchMode::Offline);

        let calls = remote.calls.load(Ordering::SeqCst);
        let session = coordinator.search("RADIOHEAD", &SearchOptions::default()).await.unwrap();
        assert_eq!(session.served_from, ServedFrom::Cache);
        assert_eq!(session.mode, SearchMode::Offline);
        assert_eq!(session.results.len(), 2);
        assert!(session.cached_at.is_some());
        assert_eq!(remote.calls.load(Ordering::SeqCst), calls, "no remote call while offline");
    }

    #[tokio::test]
    async fn test_offline_cache_miss_is_flagged() {
        let (remote, probe) = fixtures();
        let coordinator = coordinator(&remote, &probe);
        coordinator.force_offline(true);

        let session = coordinator.search("new query", &SearchOptions::default()).await.unwrap();
        assert!(session.results.is_empty());
        assert_eq!(session.status, SessionStatus::UnavailableOffline);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_degraded_then_recovered() {
        let (remote, probe) = fixtures();
        let coordinator = coordinator(&remote, &probe);
        coordinator.search("radiohead", &SearchOptions::default()).await.unwrap();

        remote.failing.store(true, Ordering::SeqCst);
        let degraded = coordinator.search("radiohead", &SearchOptions::default()).await.unwrap();
        assert_eq!(degraded.mode, SearchMode::Degraded);
        assert_eq!(degraded.served_from, ServedFrom::Cache);
        assert_eq!(degraded.status, SessionStatus::RemoteFailed);
        assert!(coordinator.status().last_error.is_some());

        // A successful probe does not clear Degraded on its own
        coordinator.check_connectivity().await;
        assert_eq!(coordinator.mode(), SearchMode::Degraded);

        remote.failing.store(false, Ordering::SeqCst);
        let before_recovery = Utc::now();
        let recovered = coordinator.search("radiohead", &SearchOptions::default()).await.unwrap();
        assert_eq!(recovered.mode, SearchMode::Online);
        assert_eq!(recovered.served_from, ServedFrom::Live);
        assert!(coordinator.status().last_error.is_none());

        let refreshed = coordinator.cached("radiohead").unwrap();
        assert!(refreshed.cached_at >= before_recovery, "live results replaced the cached copy");
        assert_eq!(refreshed.results, recovered.results);
    }

    #[tokio::test]
    async fn test_remote_failure_without_cache_serves_local() {
        let (remote, probe) = fixtures();
        remote.failing.store(true, Ordering::SeqCst);
        let coordinator = coordinator(&remote, &probe);

        let session = coordinator.search("radiohead", &SearchOptions::default()).await.unwrap();
        assert_eq!(session.served_from, ServedFrom::LocalOnly);
        assert_eq!(session.results.len(), 1);
        assert_eq!(coordinator.cache_statistics().cache.item_count, 0, "partial results are not cached");
    }

    #[tokio::test]
    async fn test_mode_changes_emit_events() {
        let (remote, probe) = fixtures();
        let events = Arc::new(EventHub::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        events.subscribe(EventKind::ModeChanged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let coordinator = build(remote, &probe, events, CoordinatorSettings::default());

        probe.0.store(false, Ordering::SeqCst);
        coordinator.check_connectivity().await;
        coordinator.check_connectivity().await;
        probe.0.store(true, Ordering::SeqCst);
        coordinator.check_connectivity().await;

        assert_eq!(seen.load(Ordering::SeqCst), 2, "online -> offline -> online");
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_query_supersedes_in_flight_one() {
        let (_, probe) = fixtures();
        let coordinator = Arc::new(build(
            Arc::new(SlowRemote),
            &probe,
            Arc::new(EventHub::new()),
            CoordinatorSettings::default(),
        ));
        let options = SearchOptions {
            search_box: Some("main".to_string()),
            ..SearchOptions::default()
        };

        let first = {
            let coordinator = Arc::clone(&coordinator);
            let options = options.clone();
            tokio::spawn(async move { coordinator.search("slow", &options).await })
        };
        // Let the first query register before the second one starts
        tokio::task::yield_now().await;

        let second = coordinator.search("fast", &options).await.unwrap();
        let first = first.await.unwrap().unwrap();

        assert_eq!(second.status, SessionStatus::Ok);
        assert_eq!(first.status, SessionStatus::Superseded);
        assert!(first.results.is_empty());
        assert_eq!(
            coordinator.cache_statistics().cache.item_count,
            2,
            "the superseded query still wrote its cache entry"
        );
        let popular: Vec<String> = coordinator.popular_queries(10).into_iter().map(|p| p.query).collect();
        assert_eq!(popular, vec!["fast".to_string()], "superseded query is not counted");
    }

    #[tokio::test]
    async fn test_superseded_failure_leaves_mode_alone() {
        let (remote, probe) = fixtures();
        let coordinator = coordinator(&remote, &probe);
        remote.failing.store(true, Ordering::SeqCst);

        let stale = coordinator.begin(Some("main"));
        let newer = coordinator.begin(Some("main"));
        let session = coordinator
            .search_with_ticket("radiohead", &SearchOptions::default(), stale.as_ref())
            .await
            .unwrap();

        assert_eq!(session.status, SessionStatus::Superseded);
        assert_eq!(coordinator.mode(), SearchMode::Online);
        assert!(coordinator.status().last_error.is_none());
        assert!(coordinator.is_current(newer.as_ref()));
    }

    #[test]
    fn test_finished_tickets_are_pruned() {
        let (remote, probe) = fixtures();
        let coordinator = coordinator(&remote, &probe);

        let stale = coordinator.begin(Some("main"));
        let latest = coordinator.begin(Some("main"));
        coordinator.finish(stale.clone());
        assert!(coordinator.is_current(latest.as_ref()), "a stale call cannot release the box");

        coordinator.finish(latest);
        assert!(lock(&coordinator.generations).is_empty());
        assert!(!coordinator.is_current(stale.as_ref()));
        assert!(coordinator.is_current(None));
    }

    #[tokio::test]
    async fn test_truncates_cached_results() {
        let (remote, probe) = fixtures();
        let coordinator = build(
            remote,
            &probe,
            Arc::new(EventHub::new()),
            CoordinatorSettings {
                max_results_per_query: 1,
                ..CoordinatorSettings::default()
            },
        );
        coordinator.search("radiohead", &SearchOptions::default()).await.unwrap();
        coordinator.force_offline(true);

        let session = coordinator.search("radiohead", &SearchOptions::default()).await.unwrap();
        assert_eq!(session.results.len(), 1);
        assert!(session.truncated);
    }

    #[tokio::test]
    async fn test_clear_cache_emits_event() {
        let (remote, probe) = fixtures();
        let events = Arc::new(EventHub::new());
        let cleared = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleared);
        events.subscribe(EventKind::CacheCleared, move |event| {
            if let CoreEvent::CacheCleared { removed } = event {
                counter.store(*removed, Ordering::SeqCst);
            }
        });
        let coordinator = build(remote, &probe, events, CoordinatorSettings::default());

        coordinator.search("radiohead", &SearchOptions::default()).await.unwrap();
        assert_eq!(coordinator.clear_cache(), 1);
        assert_eq!(cleared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("search_cache.json");
        let (remote, probe) = fixtures();

        let first = coordinator(&remote, &probe);
        first.search("radiohead", &SearchOptions::default()).await.unwrap();
        assert_eq!(first.save_snapshot(&path).await.unwrap(), 1);

        let second = coordinator(&remote, &probe);
        assert_eq!(second.load_snapshot(&path).unwrap(), 1);
        second.force_offline(true);
        let session = second.search("radiohead", &SearchOptions::default()).await.unwrap();
        assert_eq!(session.served_from, ServedFrom::Cache);
    }
}
