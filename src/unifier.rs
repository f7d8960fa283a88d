//! # Search Unifier
//!
//! Runs the local library lookup and the remote federated search side by
//! side, then merges both into one list of [`UnifiedResult`]s.
//!
//! ## Merge rules
//!
//! - Results are the same item when their normalized `(artist, title)`
//!   match, whatever the source.
//! - On a duplicate the local copy wins and keeps the remote copy attached,
//!   so the external URL survives.
//! - Each branch is ranked by position (`1 - i / n`) and the two are
//!   interleaved by that relevance, local first on ties.
//!
//! A failing branch never fails the call on its own. Only when both fail
//! does [`SearchUnifier::search`] return [`CoreError::SearchUnavailable`].

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CoreError, Result};
use crate::model::{LibraryFilters, LocalTrackFields, RemoteResultFields, UnifiedResult};
use crate::sources::{LocalLibrary, RemoteSearch};

/// Per-call search options
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchOptions {
    /// Remote engines to query; the configured defaults when `None`
    pub engines: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
    pub filters: LibraryFilters,
    /// Blend weight for this call only, clamped into `[0, 1]`
    pub weight_override: Option<f64>,
    /// Logical search box issuing the query. A newer query from the same box
    /// supersedes older in-flight ones.
    pub search_box: Option<String>,
    /// Skip the remote branch even when online
    pub local_only: bool,
}

/// Merged results plus per-branch failures
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedOutcome {
    pub results: Vec<UnifiedResult>,
    pub local_error: Option<String>,
    pub remote_error: Option<String>,
}

impl UnifiedOutcome {
    #[must_use]
    pub const fn remote_failed(&self) -> bool {
        self.remote_error.is_some()
    }
}

pub struct SearchUnifier {
    library: Arc<dyn LocalLibrary>,
    remote: Arc<dyn RemoteSearch>,
    remote_timeout: Duration,
    default_engines: Vec<String>,
}

impl std::fmt::Debug for SearchUnifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchUnifier")
            .field("remote_timeout", &self.remote_timeout)
            .field("default_engines", &self.default_engines)
            .finish_non_exhaustive()
    }
}

impl SearchUnifier {
    #[must_use]
    pub fn new(
        library: Arc<dyn LocalLibrary>,
        remote: Arc<dyn RemoteSearch>,
        remote_timeout: Duration,
        default_engines: Vec<String>,
    ) -> Self {
        Self {
            library,
            remote,
            remote_timeout,
            default_engines,
        }
    }

    fn engines<'a>(&'a self, options: &'a SearchOptions) -> Option<&'a [String]> {
        match &options.engines {
            Some(engines) => Some(engines.as_slice()),
            None if self.default_engines.is_empty() => None,
            None => Some(self.default_engines.as_slice()),
        }
    }

    async fn remote_branch(&self, query: &str, options: &SearchOptions) -> Result<Vec<RemoteResultFields>> {
        let call = self
            .remote
            .search(query, self.engines(options), options.categories.as_deref());
        match tokio::time::timeout(self.remote_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::RemoteUnavailable(format!(
                "remote search timed out after {} ms",
                self.remote_timeout.as_millis()
            ))),
        }
    }

    /// Local and remote concurrently, merged
    pub async fn search(&self, query: &str, options: &SearchOptions) -> Result<UnifiedOutcome> {
        let (local, remote) = tokio::join!(
            self.library.query_library(query, &options.filters),
            self.remote_branch(query, options),
        );

        match (local, remote) {
            (Ok(local), Ok(remote)) => {
                debug!("`{query}`: {} local, {} remote results", local.len(), remote.len());
                Ok(UnifiedOutcome {
                    results: merge(local, remote),
                    ..UnifiedOutcome::default()
                })
            }
            (Ok(local), Err(remote_err)) => {
                warn!("Remote branch failed for `{query}`: {remote_err}");
                Ok(UnifiedOutcome {
                    results: merge(local, Vec::new()),
                    remote_error: Some(remote_err.to_string()),
                    ..UnifiedOutcome::default()
                })
            }
            (Err(local_err), Ok(remote)) => {
                warn!("Local branch failed for `{query}`: {local_err}");
                Ok(UnifiedOutcome {
                    results: merge(Vec::new(), remote),
                    local_error: Some(local_err.to_string()),
                    ..UnifiedOutcome::default()
                })
            }
            (Err(local_err), Err(remote_err)) => Err(CoreError::SearchUnavailable {
                local: local_err.to_string(),
                remote: remote_err.to_string(),
            }),
        }
    }

    /// Library only, no network
    pub async fn search_local(&self, query: &str, options: &SearchOptions) -> Result<Vec<UnifiedResult>> {
        let local = self.library.query_library(query, &options.filters).await?;
        Ok(merge(local, Vec::new()))
    }
}

#[allow(clippy::cast_precision_loss)]
fn positional_relevance(index: usize, len: usize) -> f64 {
    1.0 - index as f64 / len.max(1) as f64
}

/// Deduplicate and interleave both branches
#[must_use]
pub fn merge(local: Vec<LocalTrackFields>, remote: Vec<RemoteResultFields>) -> Vec<UnifiedResult> {
    // (relevance, source rank, merged result)
    let mut ranked: Vec<(f64, u8, UnifiedResult)> = Vec::with_capacity(local.len() + remote.len());
    let mut seen: HashMap<(String, String), usize> = HashMap::new();

    let local_len = local.len();
    for (i, fields) in local.into_iter().enumerate() {
        let result = UnifiedResult::local(fields);
        let key = result.dedup_key();
        if seen.contains_key(&key) {
            continue;
        }
        seen.insert(key, ranked.len());
        ranked.push((positional_relevance(i, local_len), 0, result));
    }

    let remote_len = remote.len();
    for (i, fields) in remote.into_iter().enumerate() {
        let result = UnifiedResult::remote(fields);
        let key = result.dedup_key();
        match seen.get(&key) {
            Some(&slot) => {
                // Local copy absorbs the first remote twin; later twins drop
                if let UnifiedResult::Local { remote: attached, .. } = &mut ranked[slot].2 {
                    if attached.is_none() {
                        if let UnifiedResult::Remote { fields, .. } = result {
                            *attached = Some(fields);
                        }
                    }
                }
            }
            None => {
                seen.insert(key, ranked.len());
                ranked.push((positional_relevance(i, remote_len), 1, result));
            }
        }
    }

    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    ranked.into_iter().map(|(_, _, result)| result).collect()
}
