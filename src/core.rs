//! # Search Core
//!
//! [`SearchCoreContext`] carries every collaborator and setting the core
//! needs; [`SearchCore::start`] wires the components together once and owns
//! them for the application lifetime.
//!
//! ```text
//! perform_search ─▶ OfflineCoordinator ─▶ SearchUnifier ─▶ library + remote
//!                        │ cache
//!                        ▼
//!                  AffinityReranker ◀─ AffinityStore ◀─ record_play / rate / favorite
//! ```
//!
//! Background work (reachability probe, cache sweep and snapshot, interaction
//! writer) stops on [`SearchCore::shutdown`], which also flushes pending
//! interactions and saves the cache.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::affinity::{AffinityStore, PlayEvent};
use crate::config::{AppMode, CoreConfig};
use crate::db::Database;
use crate::error::Result;
use crate::events::{CoreEvent, EventHub, EventKind, SubscriptionToken};
use crate::model::{InteractionType, ResultSource, SearchInteraction, TrackStatistics};
use crate::offline::{
    OfflineCoordinator, SearchCacheStats, SearchSession, SearchStatus, SearchTicket, SessionStatus,
};
use crate::remote::{HttpProbe, SearxClient};
use crate::rerank::AffinityReranker;
use crate::scoring::ScoringPreferences;
use crate::sources::{LocalLibrary, ReachabilityProbe, RemoteSearch, StatisticsStore};
use crate::unifier::{SearchOptions, SearchUnifier};
use crate::writeback::InteractionWriteQueue;

/// Everything the core is built from
pub struct SearchCoreContext {
    pub library: Arc<dyn LocalLibrary>,
    pub remote: Arc<dyn RemoteSearch>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub store: Arc<dyn StatisticsStore>,
    pub events: Arc<EventHub>,
    pub config: CoreConfig,
    /// Where the result cache is persisted; `None` keeps it in memory only
    pub cache_snapshot: Option<PathBuf>,
}

impl std::fmt::Debug for SearchCoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCoreContext")
            .field("config", &self.config)
            .field("cache_snapshot", &self.cache_snapshot)
            .finish_non_exhaustive()
    }
}

impl SearchCoreContext {
    /// Production wiring: SQLite for library and statistics, HTTP for the
    /// federated search
    pub fn with_database(db: Arc<Database>, config: CoreConfig, cache_snapshot: Option<PathBuf>) -> Result<Self> {
        let remote = SearxClient::new(&config.remote_url, config.remote_timeout())?;
        let probe = HttpProbe::new(&config.remote_url, config.coordinator_settings().probe_timeout)?;
        Ok(Self {
            library: db.clone(),
            remote: Arc::new(remote),
            probe: Arc::new(probe),
            store: db,
            events: Arc::new(EventHub::new()),
            config,
            cache_snapshot,
        })
    }
}

/// Entry point for callers such as the CLI
pub struct SearchCore {
    coordinator: Arc<OfflineCoordinator>,
    affinity: Arc<AffinityStore>,
    reranker: AffinityReranker,
    library: Arc<dyn LocalLibrary>,
    store: Arc<dyn StatisticsStore>,
    events: Arc<EventHub>,
    interactions: InteractionWriteQueue,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    cache_snapshot: Option<PathBuf>,
}

impl std::fmt::Debug for SearchCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCore")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl SearchCore {
    /// Build the components and start the background tasks. Must run inside
    /// a tokio runtime.
    pub fn start(context: SearchCoreContext) -> Self {
        let SearchCoreContext {
            library,
            remote,
            probe,
            store,
            events,
            config,
            cache_snapshot,
        } = context;
        let cancel = CancellationToken::new();

        let unifier = SearchUnifier::new(
            Arc::clone(&library),
            remote,
            config.remote_timeout(),
            config.default_engines.clone(),
        );
        let coordinator = Arc::new(OfflineCoordinator::new(
            unifier,
            probe,
            Arc::clone(&events),
            config.coordinator_settings(),
        ));
        if config.mode == AppMode::Offline {
            coordinator.force_offline(true);
        }
        if let Some(path) = &cache_snapshot {
            if let Err(e) = coordinator.load_snapshot(path) {
                warn!("Ignoring unreadable cache snapshot {}: {e}", path.display());
            }
        }

        let (interactions, writer) =
            InteractionWriteQueue::spawn(Arc::clone(&store), config.interaction_flush(), cancel.clone());
        let affinity = Arc::new(
            AffinityStore::new(Arc::clone(&store), config.scoring.clone())
                .with_interaction_queue(interactions.clone()),
        );
        let reranker =
            AffinityReranker::new(Arc::clone(&affinity), Arc::clone(&store), Arc::clone(&library));

        let maintenance = tokio::spawn(Arc::clone(&coordinator).run_maintenance(
            config.probe_interval(),
            config.sweep_interval(),
            cache_snapshot.clone(),
            cancel.clone(),
        ));

        info!("Search core started ({:?} mode, remote {})", config.mode, config.remote_url);
        Self {
            coordinator,
            affinity,
            reranker,
            library,
            store,
            events,
            interactions,
            cancel,
            tasks: Mutex::new(vec![writer, maintenance]),
            cache_snapshot,
        }
    }

    /// Search, fall back as needed, then rerank by personal affinity.
    ///
    /// Only fails with [`crate::error::CoreError::SearchUnavailable`] when
    /// both branches failed and nothing was cached. A reranking failure is
    /// reported in [`SearchSession::error`] with the unreranked order. A call
    /// overtaken by a newer query for the same search box, before or during
    /// reranking, comes back [`SessionStatus::Superseded`].
    pub async fn perform_search(&self, query: &str, options: &SearchOptions) -> Result<SearchSession> {
        let ticket = self.coordinator.begin(options.search_box.as_deref());
        let session = self.search_and_rerank(query, options, ticket.as_ref()).await;
        self.coordinator.finish(ticket);
        session
    }

    async fn search_and_rerank(
        &self,
        query: &str,
        options: &SearchOptions,
        ticket: Option<&SearchTicket>,
    ) -> Result<SearchSession> {
        let mut session = self.coordinator.search_with_ticket(query, options, ticket).await?;
        if session.status == SessionStatus::Superseded || session.results.is_empty() {
            return Ok(session);
        }

        let results = std::mem::take(&mut session.results);
        let fallback = results.clone();
        match self.reranker.rerank(results, options.weight_override).await {
            Ok(reranked) => session.results = reranked,
            Err(e) => {
                error!("Reranking `{query}` failed: {e}");
                session.results = fallback;
                session.error.get_or_insert_with(|| e.to_string());
            }
        }

        if !self.coordinator.is_current(ticket) {
            debug!("Search `{query}` superseded while reranking");
            return Ok(self.coordinator.superseded(session.served_from));
        }
        Ok(session)
    }

    pub async fn get_suggestions(&self, partial: &str, limit: usize) -> Result<Vec<String>> {
        self.reranker.suggest(partial, limit).await
    }

    #[must_use]
    pub fn get_search_status(&self) -> SearchStatus {
        self.coordinator.status()
    }

    #[must_use]
    pub fn get_cache_statistics(&self) -> SearchCacheStats {
        self.coordinator.cache_statistics()
    }

    pub fn clear_cache(&self) -> usize {
        self.coordinator.clear_cache()
    }

    /// Probe the remote endpoint now instead of waiting for the timer
    pub async fn refresh_connectivity(&self) -> SearchStatus {
        self.coordinator.check_connectivity().await;
        self.coordinator.status()
    }

    pub fn set_offline(&self, offline: bool) {
        self.coordinator.force_offline(offline);
    }

    pub async fn record_rating(&self, item_id: &str, rating: u8) -> Result<TrackStatistics> {
        self.affinity.set_rating(item_id, rating).await
    }

    pub async fn toggle_favorite(&self, item_id: &str) -> Result<bool> {
        self.affinity.toggle_favorite(item_id).await
    }

    pub async fn record_play(&self, item_id: &str, event: PlayEvent) -> Result<TrackStatistics> {
        self.affinity.record_play(item_id, event).await
    }

    pub async fn get_statistics(&self, item_id: &str) -> Result<Option<TrackStatistics>> {
        self.affinity.get_statistics(item_id).await
    }

    pub async fn get_recently_played(&self, limit: usize) -> Result<Vec<TrackStatistics>> {
        self.affinity.get_recently_played(limit).await
    }

    pub async fn get_top_items(&self, limit: usize) -> Result<Vec<TrackStatistics>> {
        self.affinity.get_top_items(limit).await
    }

    /// Log a user interaction with a search result. Never fails or blocks;
    /// returns whether the entry was queued.
    pub fn record_interaction(
        &self,
        query: &str,
        result_id: &str,
        result_source: ResultSource,
        interaction_type: InteractionType,
    ) -> bool {
        self.record_interaction_at(SearchInteraction {
            query: query.to_string(),
            result_id: result_id.to_string(),
            result_source,
            interaction_type,
            at: Utc::now(),
            position: None,
            session_id: None,
        })
    }

    /// [`Self::record_interaction`] with position and session filled in
    pub fn record_interaction_at(&self, interaction: SearchInteraction) -> bool {
        if interaction.query.trim().is_empty() || interaction.result_id.trim().is_empty() {
            warn!("Dropping interaction without query or result id");
            return false;
        }
        self.interactions.enqueue(interaction)
    }

    /// Wait until every queued interaction is written
    pub async fn flush_interactions(&self) -> Result<()> {
        self.interactions.flush().await
    }

    /// Delete the whole interaction history, including entries still queued
    pub async fn clear_history(&self) -> Result<usize> {
        if let Err(e) = self.interactions.flush().await {
            warn!("Could not flush pending interactions before clearing: {e}");
        }
        let removed = self.store.clear_interactions().await?;
        info!("Cleared {removed} history entries");
        Ok(removed)
    }

    /// Remove an item from the library together with its statistics
    pub async fn remove_item(&self, item_id: &str) -> Result<bool> {
        let from_library = self.library.remove_item(item_id).await?;
        let from_statistics = self.affinity.remove_item(item_id).await?;
        Ok(from_library || from_statistics)
    }

    pub async fn preferences(&self) -> ScoringPreferences {
        self.affinity.preferences().await
    }

    /// Replace the scoring preferences and rescore every item
    pub async fn update_preferences(&self, preferences: ScoringPreferences) -> Result<usize> {
        self.affinity.set_preferences(preferences).await
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&CoreEvent) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        self.events.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.events.unsubscribe(token)
    }

    /// Flush pending interactions, stop background tasks and save the cache
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.interactions.flush().await {
            warn!("Final interaction flush failed: {e}");
        }
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {e}");
            }
        }

        if let Some(path) = &self.cache_snapshot {
            self.coordinator.save_snapshot(path).await?;
        }
        info!("Search core stopped");
        Ok(())
    }
}

impl Drop for SearchCore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
