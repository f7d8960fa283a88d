//! # Personal Affinity Store
//!
//! Keeps per-item [`TrackStatistics`] up to date and recomputes the personal
//! score after every change. All reads go straight to the durable store, so
//! a score is never older than the last committed write.
//!
//! ## Concurrency
//!
//! Each mutation is a read-modify-write on one item's row. Mutations on the
//! same item serialize through a per-item async mutex held across the whole
//! cycle. A preference change takes the preferences lock exclusively, which
//! waits out in-flight mutations before rescoring everything.

use chrono::Utc;
use log::{debug, error, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::RwLock;

use crate::error::{CoreError, Result};
use crate::model::{InteractionType, PlayContext, ResultSource, SearchInteraction, TrackStatistics};
use crate::scoring::{self, ScoringPreferences};
use crate::sources::StatisticsStore;
use crate::writeback::InteractionWriteQueue;

/// Prune dead per-item locks once the table grows past this
const LOCK_TABLE_PRUNE_AT: usize = 1024;

/// A single play event as reported by the player
#[derive(Debug, Clone, Default)]
pub struct PlayEvent {
    pub duration_played_sec: f64,
    /// Completion in percent, clamped into 0-100
    pub play_percentage: f64,
    /// `None` lets the store decide from `play_percentage`
    pub skipped: Option<bool>,
    pub context: PlayContext,
}

pub struct AffinityStore {
    store: Arc<dyn StatisticsStore>,
    preferences: RwLock<ScoringPreferences>,
    item_locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
    interactions: Option<InteractionWriteQueue>,
}

impl std::fmt::Debug for AffinityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityStore").finish_non_exhaustive()
    }
}

fn validate_item_id(item_id: &str) -> Result<()> {
    if item_id.trim().is_empty() {
        return Err(CoreError::InvalidInput("item id must not be empty".to_string()));
    }
    Ok(())
}

fn logged<T>(what: &str, item_id: &str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!("Failed to {what} for `{item_id}`: {e}");
    }
    result
}

impl AffinityStore {
    #[must_use]
    pub fn new(store: Arc<dyn StatisticsStore>, preferences: ScoringPreferences) -> Self {
        Self {
            store,
            preferences: RwLock::new(preferences.validated()),
            item_locks: Mutex::new(HashMap::new()),
            interactions: None,
        }
    }

    /// Log a `play` interaction whenever a play carries its originating query
    #[must_use]
    pub fn with_interaction_queue(mut self, queue: InteractionWriteQueue) -> Self {
        self.interactions = Some(queue);
        self
    }

    fn item_lock(&self, item_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.item_locks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(lock) = locks.get(item_id).and_then(Weak::upgrade) {
            return lock;
        }
        if locks.len() >= LOCK_TABLE_PRUNE_AT {
            locks.retain(|_, lock| lock.strong_count() > 0);
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(item_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    /// Serialized read-modify-write of one item's statistics, followed by a
    /// score refresh and a save
    async fn update<F>(&self, item_id: &str, mutate: F) -> Result<TrackStatistics>
    where
        F: FnOnce(&mut TrackStatistics) + Send,
    {
        let prefs = self.preferences.read().await;
        let lock = self.item_lock(item_id);
        let _guard = lock.lock().await;

        let mut stats = self
            .store
            .load_statistics(item_id)
            .await?
            .unwrap_or_else(|| TrackStatistics::new(item_id));
        mutate(&mut stats);
        scoring::refresh_score(&mut stats, &prefs, Utc::now());
        self.store.save_statistics(stats.clone()).await?;
        Ok(stats)
    }

    /// Record one play of `item_id` and return the updated statistics
    pub async fn record_play(&self, item_id: &str, event: PlayEvent) -> Result<TrackStatistics> {
        validate_item_id(item_id)?;
        if !event.duration_played_sec.is_finite() || event.duration_played_sec < 0.0 {
            return Err(CoreError::InvalidInput(format!(
                "invalid play duration {}",
                event.duration_played_sec
            )));
        }
        if event.play_percentage.is_nan() {
            return Err(CoreError::InvalidInput("play percentage is NaN".to_string()));
        }

        let pct = event.play_percentage.clamp(0.0, 100.0);
        let skipped = event.skipped.unwrap_or_else(|| scoring::is_skip(pct));
        let now = Utc::now();

        let result = self
            .update(item_id, |stats| {
                stats.play_count = stats.play_count.saturating_add(1);
                if skipped {
                    stats.skip_count = stats.skip_count.saturating_add(1);
                }
                stats.total_play_time_sec += event.duration_played_sec;
                let n = f64::from(stats.play_count);
                stats.avg_play_percentage += (pct - stats.avg_play_percentage) / n;
                stats.last_played_at = Some(now);
                stats.first_played_at.get_or_insert(now);
            })
            .await;
        let stats = logged("record play", item_id, result)?;

        debug!(
            "Play of `{item_id}` recorded ({pct:.0}%, skipped: {skipped}), score now {:.3}",
            stats.personal_score
        );

        if let (Some(queue), Some(query)) = (&self.interactions, event.context.query) {
            queue.enqueue(SearchInteraction {
                query,
                result_id: item_id.to_string(),
                result_source: ResultSource::Local,
                interaction_type: InteractionType::Play,
                at: now,
                position: event.context.position,
                session_id: event.context.session_id,
            });
        }

        Ok(stats)
    }

    /// Set a 1-5 star rating
    pub async fn set_rating(&self, item_id: &str, rating: u8) -> Result<TrackStatistics> {
        validate_item_id(item_id)?;
        if !(1..=5).contains(&rating) {
            return Err(CoreError::InvalidInput(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }
        let result = self.update(item_id, |stats| stats.rating = Some(rating)).await;
        logged("set rating", item_id, result)
    }

    /// Flip the favorite flag and return the new state
    pub async fn toggle_favorite(&self, item_id: &str) -> Result<bool> {
        validate_item_id(item_id)?;
        let result = self
            .update(item_id, |stats| stats.favorite = !stats.favorite)
            .await;
        let stats = logged("toggle favorite", item_id, result)?;
        debug!("`{item_id}` favorite: {}", stats.favorite);
        Ok(stats.favorite)
    }

    /// Current personal score, `0.0` for items without history
    pub async fn get_score(&self, item_id: &str) -> Result<f64> {
        Ok(self
            .store
            .load_statistics(item_id)
            .await?
            .map_or(0.0, |s| s.personal_score))
    }

    /// Scores for many items at once; missing items are absent from the map
    pub async fn get_scores(&self, item_ids: Vec<String>) -> Result<HashMap<String, f64>> {
        self.store.scores(item_ids).await
    }

    pub async fn get_statistics(&self, item_id: &str) -> Result<Option<TrackStatistics>> {
        self.store.load_statistics(item_id).await
    }

    pub async fn get_top_items(&self, limit: usize) -> Result<Vec<TrackStatistics>> {
        self.store.top_items(limit).await
    }

    pub async fn get_recently_played(&self, limit: usize) -> Result<Vec<TrackStatistics>> {
        self.store.recently_played(limit).await
    }

    pub async fn preferences(&self) -> ScoringPreferences {
        self.preferences.read().await.clone()
    }

    /// Replace the preferences and rescore every item. Returns how many
    /// items were rescored.
    pub async fn set_preferences(&self, preferences: ScoringPreferences) -> Result<usize> {
        let preferences = preferences.validated();
        let mut current = self.preferences.write().await;

        let mut all = self.store.all_statistics().await?;
        let count = all.len();
        let prefs = preferences.clone();
        let all = tokio::task::spawn_blocking(move || {
            scoring::refresh_scores(&mut all, &prefs, Utc::now());
            all
        })
        .await?;
        self.store.save_statistics_batch(all).await.map_err(|e| {
            error!("Failed to save rescored statistics: {e}");
            e
        })?;

        *current = preferences;
        info!("Scoring preferences updated, rescored {count} items");
        Ok(count)
    }

    /// Forget an item's statistics. Returns whether there were any.
    pub async fn remove_item(&self, item_id: &str) -> Result<bool> {
        let lock = self.item_lock(item_id);
        let _guard = lock.lock().await;
        let result = self.store.delete_statistics(item_id).await;
        logged("remove statistics", item_id, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn store() -> AffinityStore {
        let db = Arc::new(Database::open_in_memory().unwrap());
        AffinityStore::new(db, ScoringPreferences::default())
    }

    fn full_play(seconds: f64) -> PlayEvent {
        PlayEvent {
            duration_played_sec: seconds,
            play_percentage: 100.0,
            ..PlayEvent::default()
        }
    }

    #[tokio::test]
    async fn test_record_play_updates_aggregates() {
        let affinity = store();
        affinity.record_play("a", full_play(200.0)).await.unwrap();
        let stats = affinity
            .record_play(
                "a",
                PlayEvent {
                    duration_played_sec: 50.0,
                    play_percentage: 20.0,
                    ..PlayEvent::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(stats.play_count, 2);
        assert_eq!(stats.skip_count, 1, "a 20% play counts as a skip");
        assert_eq!(stats.total_play_time_sec, 250.0);
        assert!((stats.avg_play_percentage - 60.0).abs() < 1e-9);
        assert!(stats.first_played_at.unwrap() <= stats.last_played_at.unwrap());
        assert!(stats.personal_score > 0.0);
    }

    #[tokio::test]
    async fn test_explicit_skip_flag_wins() {
        let affinity = store();
        let stats = affinity
            .record_play(
                "a",
                PlayEvent {
                    duration_played_sec: 10.0,
                    play_percentage: 95.0,
                    skipped: Some(true),
                    ..PlayEvent::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(stats.skip_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_plays_are_not_lost() {
        let affinity = Arc::new(store());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let affinity = Arc::clone(&affinity);
            handles.push(tokio::spawn(async move {
                affinity.record_play("hot", full_play(1.0)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stats = affinity.get_statistics("hot").await.unwrap().unwrap();
        assert_eq!(stats.play_count, 50);
        assert_eq!(stats.total_play_time_sec, 50.0);
    }

    #[tokio::test]
    async fn test_rating_range_is_enforced() {
        let affinity = store();
        assert!(matches!(
            affinity.set_rating("a", 0).await,
            Err(CoreError::InvalidInput(_))
        ));
        assert!(matches!(
            affinity.set_rating("a", 6).await,
            Err(CoreError::InvalidInput(_))
        ));
        let stats = affinity.set_rating("a", 5).await.unwrap();
        assert_eq!(stats.rating, Some(5));
        assert!(stats.personal_score > 0.0, "rating alone rescored the item");
    }

    #[tokio::test]
    async fn test_favorite_toggle_raises_then_restores_score() {
        let affinity = store();
        affinity.record_play("a", full_play(100.0)).await.unwrap();
        let before = affinity.get_score("a").await.unwrap();

        assert!(affinity.toggle_favorite("a").await.unwrap());
        let loved = affinity.get_score("a").await.unwrap();
        assert!(loved > before, "favorite should strictly raise the score");

        assert!(!affinity.toggle_favorite("a").await.unwrap());
        let after = affinity.get_score("a").await.unwrap();
        assert!(after < loved);
    }

    #[tokio::test]
    async fn test_unknown_item_scores_zero() {
        let affinity = store();
        assert_eq!(affinity.get_score("never-seen").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_empty_item_id_is_rejected() {
        let affinity = store();
        assert!(affinity.record_play("  ", full_play(1.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_set_preferences_rescores_everything() {
        let affinity = store();
        affinity.record_play("a", full_play(100.0)).await.unwrap();
        affinity.set_rating("b", 5).await.unwrap();
        let before = affinity.get_score("b").await.unwrap();

        let prefs = ScoringPreferences {
            rating_weight: 2.0,
            ..ScoringPreferences::default()
        };
        assert_eq!(affinity.set_preferences(prefs).await.unwrap(), 2);

        let after = affinity.get_score("b").await.unwrap();
        assert!(after > before);
        assert_eq!(affinity.preferences().await.rating_weight, 2.0);
    }

    #[tokio::test]
    async fn test_top_and_recent() {
        let affinity = store();
        affinity.record_play("low", PlayEvent {
            duration_played_sec: 1.0,
            play_percentage: 5.0,
            ..PlayEvent::default()
        }).await.unwrap();
        affinity.record_play("high", full_play(300.0)).await.unwrap();
        affinity.toggle_favorite("high").await.unwrap();

        let top = affinity.get_top_items(1).await.unwrap();
        assert_eq!(top[0].item_id, "high");

        let recent = affinity.get_recently_played(10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_remove_item_forgets_statistics() {
        let affinity = store();
        affinity.record_play("a", full_play(1.0)).await.unwrap();
        assert!(affinity.remove_item("a").await.unwrap());
        assert!(affinity.get_statistics("a").await.unwrap().is_none());
        assert!(!affinity.remove_item("a").await.unwrap());
    }
}
