//! # Affinity Reranker
//!
//! Reorders a result list by blending its original order with the user's
//! personal scores:
//!
//! ```text
//! final = base * (1 - w) + personal / max_personal * w
//! base  = 1 - position / len
//! ```
//!
//! Results without a local item (or without history) score zero, so unplayed
//! items are never boosted. With `w = 0` the input order comes back
//! unchanged; the sort is stable.
//!
//! Also produces query suggestions: past queries first, then titles and
//! artists of high-affinity items.

use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::affinity::AffinityStore;
use crate::error::Result;
use crate::model::{normalize_text, UnifiedResult};
use crate::scoring::clamp_blend_weight;
use crate::sources::{LocalLibrary, StatisticsStore};

/// How many top-affinity items feed the suggestion list
const AFFINITY_SUGGESTION_POOL: usize = 50;

pub struct AffinityReranker {
    affinity: Arc<AffinityStore>,
    history: Arc<dyn StatisticsStore>,
    library: Arc<dyn LocalLibrary>,
}

impl std::fmt::Debug for AffinityReranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityReranker").finish_non_exhaustive()
    }
}

/// Blend `scores` into the order of `results` with weight `w`
#[must_use]
pub fn blend(results: Vec<UnifiedResult>, scores: &HashMap<String, f64>, w: f64) -> Vec<UnifiedResult> {
    let n = results.len();
    let personal: Vec<f64> = results
        .iter()
        .map(|r| {
            r.local_item_id()
                .and_then(|id| scores.get(id).copied())
                .filter(|s| s.is_finite())
                .map_or(0.0, |s| s.max(0.0))
        })
        .collect();
    let max = personal.iter().copied().fold(0.0_f64, f64::max);

    let mut ranked: Vec<(f64, UnifiedResult)> = results
        .into_iter()
        .zip(personal)
        .enumerate()
        .map(|(i, (mut result, score))| {
            #[allow(clippy::cast_precision_loss)]
            let base = 1.0 - i as f64 / n as f64;
            let normalized = if max > 0.0 { score / max } else { 0.0 };
            result.set_personal_score(score);
            (base * (1.0 - w) + normalized * w, result)
        })
        .collect();

    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));
    ranked.into_iter().map(|(_, result)| result).collect()
}

impl AffinityReranker {
    #[must_use]
    pub fn new(
        affinity: Arc<AffinityStore>,
        history: Arc<dyn StatisticsStore>,
        library: Arc<dyn LocalLibrary>,
    ) -> Self {
        Self {
            affinity,
            history,
            library,
        }
    }

    /// Rerank with the configured blend weight, or `weight_override` clamped
    /// into `[0, 1]`
    pub async fn rerank(
        &self,
        results: Vec<UnifiedResult>,
        weight_override: Option<f64>,
    ) -> Result<Vec<UnifiedResult>> {
        if results.is_empty() {
            return Ok(results);
        }
        let default_weight = self.affinity.preferences().await.blend_weight;
        let w = weight_override.map_or(default_weight, |w| clamp_blend_weight(w, default_weight));

        let ids: Vec<String> = results
            .iter()
            .filter_map(|r| r.local_item_id().map(str::to_string))
            .collect();
        let scores = if ids.is_empty() {
            HashMap::new()
        } else {
            self.affinity.get_scores(ids).await?
        };

        trace!("Reranking {} results with weight {w:.2}", results.len());
        Ok(blend(results, &scores, w))
    }

    /// Up to `limit` completions for `partial`: matching past queries first,
    /// then high-affinity titles and artists
    pub async fn suggest(&self, partial: &str, limit: usize) -> Result<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let prefix = normalize_text(partial);
        let mut seen: HashSet<String> = HashSet::new();
        let mut suggestions: Vec<String> = Vec::with_capacity(limit);

        for query in self.history.matching_queries(&prefix, limit).await? {
            if seen.insert(normalize_text(&query)) {
                suggestions.push(query);
            }
        }

        if suggestions.len() < limit {
            for stats in self.affinity.get_top_items(AFFINITY_SUGGESTION_POOL).await? {
                if suggestions.len() >= limit {
                    break;
                }
                let Some(item) = self.library.get_item(&stats.item_id).await? else {
                    continue;
                };
                for candidate in [item.title, item.artist] {
                    let normalized = normalize_text(&candidate);
                    if suggestions.len() < limit
                        && !normalized.is_empty()
                        && normalized.starts_with(&prefix)
                        && seen.insert(normalized)
                    {
                        suggestions.push(candidate);
                    }
                }
            }
        }

        debug!("{} suggestions for `{partial}`", suggestions.len());
        Ok(suggestions)
    }
}
