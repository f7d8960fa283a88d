//! Contracts for the collaborators the search core talks to.
//!
//! Everything slow sits behind one of these traits: the local metadata
//! store, the federated search endpoint, the reachability probe and the
//! durable statistics store. Production implementations live in
//! [`crate::db`] and [`crate::remote`]; tests plug in scripted fakes.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::Result;
use crate::model::{
    LibraryFilters, LocalTrackFields, RemoteResultFields, SearchInteraction, TrackStatistics,
};

/// Local music library lookup
#[async_trait]
pub trait LocalLibrary: Send + Sync {
    /// Free-text query over the library, best matches first
    async fn query_library(
        &self,
        text: &str,
        filters: &LibraryFilters,
    ) -> Result<Vec<LocalTrackFields>>;

    async fn get_item(&self, id: &str) -> Result<Option<LocalTrackFields>>;

    /// Delete an item. Read-only libraries keep the default, which removes
    /// nothing.
    async fn remove_item(&self, _id: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Federated search over remote engines
#[async_trait]
pub trait RemoteSearch: Send + Sync {
    /// Search `query` on the given engines (all engines when `None`).
    /// Network failures come back as [`crate::error::CoreError::RemoteUnavailable`].
    async fn search(
        &self,
        query: &str,
        engines: Option<&[String]>,
        categories: Option<&[String]>,
    ) -> Result<Vec<RemoteResultFields>>;
}

/// Cheap check whether the remote endpoint is reachable at all
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Durable storage for per-item statistics and the interaction log.
///
/// Single-item writes are assumed transactional.
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn load_statistics(&self, item_id: &str) -> Result<Option<TrackStatistics>>;

    async fn save_statistics(&self, stats: TrackStatistics) -> Result<()>;

    /// Write many rows in one transaction
    async fn save_statistics_batch(&self, stats: Vec<TrackStatistics>) -> Result<()>;

    async fn all_statistics(&self) -> Result<Vec<TrackStatistics>>;

    /// Stored scores for the given ids; ids without statistics are absent
    async fn scores(&self, item_ids: Vec<String>) -> Result<HashMap<String, f64>>;

    /// Highest personal score first
    async fn top_items(&self, limit: usize) -> Result<Vec<TrackStatistics>>;

    /// Most recently played first; never-played items are excluded
    async fn recently_played(&self, limit: usize) -> Result<Vec<TrackStatistics>>;

    async fn delete_statistics(&self, item_id: &str) -> Result<bool>;

    async fn append_interactions(&self, interactions: Vec<SearchInteraction>) -> Result<()>;

    /// Normalized past queries starting with `prefix`, most used first
    async fn matching_queries(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Remove the whole interaction history. Returns the number of rows removed.
    async fn clear_interactions(&self) -> Result<usize>;
}
