//! Personalized, offline-capable music search.
//!
//! Tunesift searches a local music library and a federated web search
//! endpoint at the same time, merges the two result lists, and reranks them
//! by what the user actually listens to. When the endpoint is slow or down,
//! results come from an importance-aware cache or the local library alone.
//!
//! Core modules:
//! - [`core`] - [`core::SearchCore`], the entry point wiring everything below
//! - [`unifier`] - Concurrent local + remote search and deduplication
//! - [`offline`] - Connectivity tracking, fallback and result caching
//! - [`rerank`] - Affinity reranking and query suggestions
//! - [`affinity`] - Per-item listening statistics and personal scores
//! - [`cache`] - Memory-bounded cache with importance-based eviction
//!
//! ### Supporting Modules
//!
//! - [`scoring`] - Personal score formula and preferences
//! - [`db`] - SQLite store for library, statistics and search history
//! - [`writeback`] - Batched background writes of search interactions
//! - [`remote`] - HTTP client for the federated search endpoint
//! - [`sources`] - Collaborator traits
//! - [`events`] - Mode change and cache notifications
//! - [`config`] - Configuration and data directory management
//! - [`cli`] - Command-line interface definitions with clap integration
//! - [`completion`] - Shell completion generation
//!
//! ## Quick Start Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunesift::config::{CoreConfig, DataPaths};
//! use tunesift::core::{SearchCore, SearchCoreContext};
//! use tunesift::db::Database;
//! use tunesift::unifier::SearchOptions;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let paths = DataPaths::resolve(None)?;
//! let db = Arc::new(Database::open(&paths.db_path)?);
//! let context = SearchCoreContext::with_database(db, CoreConfig::default(), Some(paths.cache_snapshot))?;
//! let core = SearchCore::start(context);
//!
//! let session = core.perform_search("karma police", &SearchOptions::default()).await?;
//! for result in &session.results {
//!     println!("{} - {}", result.artist(), result.title());
//! }
//!
//! core.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod affinity;
pub mod cache;
pub mod cli;
pub mod completion;
pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod events;
pub mod model;
pub mod offline;
pub mod remote;
pub mod rerank;
pub mod scoring;
pub mod sources;
pub mod unifier;
pub mod writeback;
