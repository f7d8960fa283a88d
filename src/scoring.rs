//! Personal scoring for library items.
//!
//! Turns an item's [`TrackStatistics`] into a single affinity score using the
//! user's [`ScoringPreferences`]:
//!
//! ```text
//! score = w_play       * norm(play_count)
//!       + w_rating     * rating / 5
//!       + w_recency    * exp(-age_days / half_life_days)
//!       + w_completion * avg_play_percentage / 100
//!       - skip_penalty * norm(skip_count)
//!
//! norm(x) = x / (x + k)
//! ```
//!
//! The result is clamped at zero and multiplied by `favorite_boost` for
//! favorites. Counts go through `norm` so no single count dominates forever.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::model::TrackStatistics;

/// Plays below this completion percentage count as skips when the caller
/// does not say otherwise
pub const SKIP_THRESHOLD_PCT: f64 = 80.0;

/// Minimum pre-boost score of a favorite, so favoriting an item with no
/// history still lifts it
const FAVORITE_FLOOR: f64 = 0.05;

/// User-tunable scoring weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringPreferences {
    pub play_count_weight: f64,
    pub rating_weight: f64,
    pub recency_weight: f64,
    pub completion_weight: f64,
    /// Decay constant of the recency term, `exp(-age_days / half_life)`
    pub recency_half_life_days: f64,
    pub skip_penalty: f64,
    pub favorite_boost: f64,
    /// `k` in `x / (x + k)`
    pub saturation_constant: f64,
    /// Share of the final ranking taken by personal score, `[0, 1]`
    pub blend_weight: f64,
}

impl Default for ScoringPreferences {
    fn default() -> Self {
        Self {
            play_count_weight: 0.3,
            rating_weight: 0.25,
            recency_weight: 0.2,
            completion_weight: 0.25,
            recency_half_life_days: 30.0,
            skip_penalty: 0.2,
            favorite_boost: 1.5,
            saturation_constant: 10.0,
            blend_weight: 0.3,
        }
    }
}

impl ScoringPreferences {
    /// Clamp every field into its valid range. Non-finite values fall back
    /// to the defaults.
    #[must_use]
    pub fn validated(self) -> Self {
        let defaults = Self::default();
        let non_negative = |value: f64, fallback: f64| {
            if value.is_finite() {
                value.max(0.0)
            } else {
                fallback
            }
        };
        let positive = |value: f64, fallback: f64| {
            if value.is_finite() && value > 0.0 {
                value
            } else {
                fallback
            }
        };

        Self {
            play_count_weight: non_negative(self.play_count_weight, defaults.play_count_weight),
            rating_weight: non_negative(self.rating_weight, defaults.rating_weight),
            recency_weight: non_negative(self.recency_weight, defaults.recency_weight),
            completion_weight: non_negative(self.completion_weight, defaults.completion_weight),
            recency_half_life_days: positive(
                self.recency_half_life_days,
                defaults.recency_half_life_days,
            ),
            skip_penalty: non_negative(self.skip_penalty, defaults.skip_penalty),
            // A boost of 1 or less would let favoriting leave the score flat
            favorite_boost: if self.favorite_boost.is_finite() && self.favorite_boost > 1.0 {
                self.favorite_boost
            } else {
                defaults.favorite_boost
            },
            saturation_constant: positive(self.saturation_constant, defaults.saturation_constant),
            blend_weight: clamp_blend_weight(self.blend_weight, defaults.blend_weight),
        }
    }
}

/// Clamp a blend weight into `[0, 1]`, using `fallback` for NaN
#[must_use]
pub fn clamp_blend_weight(weight: f64, fallback: f64) -> f64 {
    if weight.is_nan() {
        fallback.clamp(0.0, 1.0)
    } else {
        weight.clamp(0.0, 1.0)
    }
}

/// Saturating normalization into `[0, 1)`
#[inline]
#[must_use]
pub fn saturate(count: u32, k: f64) -> f64 {
    let x = f64::from(count);
    x / (x + k)
}

/// Whether a play at `play_percentage` counts as a skip
#[must_use]
pub fn is_skip(play_percentage: f64) -> bool {
    play_percentage < SKIP_THRESHOLD_PCT
}

/// Compute the personal score of `stats` as of `now`.
///
/// Pure function of the statistics (excluding the stored score) and the
/// preferences.
#[must_use]
pub fn personal_score(stats: &TrackStatistics, prefs: &ScoringPreferences, now: DateTime<Utc>) -> f64 {
    let k = prefs.saturation_constant;

    let play_term = prefs.play_count_weight * saturate(stats.play_count, k);
    let rating_term = stats
        .rating
        .map_or(0.0, |r| prefs.rating_weight * f64::from(r.min(5)) / 5.0);
    let recency_term = stats.last_played_at.map_or(0.0, |at| {
        #[allow(clippy::cast_precision_loss)]
        let age_days = ((now - at).num_seconds().max(0) as f64) / 86_400.0;
        prefs.recency_weight * (-age_days / prefs.recency_half_life_days).exp()
    });
    let completion_term =
        prefs.completion_weight * (stats.avg_play_percentage.clamp(0.0, 100.0) / 100.0);
    let skip_term = prefs.skip_penalty * saturate(stats.skip_count, k);

    let base = play_term + rating_term + recency_term + completion_term - skip_term;

    let score = if stats.favorite {
        base.max(FAVORITE_FLOOR) * prefs.favorite_boost
    } else {
        base.max(0.0)
    };

    log::trace!(
        "Score for `{}`: {score:.4} (play {play_term:.3}, rating {rating_term:.3}, recency {recency_term:.3}, completion {completion_term:.3}, skip -{skip_term:.3})",
        stats.item_id
    );
    score
}

/// Recompute and store the score on `stats`
pub fn refresh_score(stats: &mut TrackStatistics, prefs: &ScoringPreferences, now: DateTime<Utc>) {
    stats.personal_score = personal_score(stats, prefs, now);
    stats.score_updated_at = Some(now);
}

/// Recompute every score in parallel, e.g. after the preferences changed
pub fn refresh_scores(all: &mut [TrackStatistics], prefs: &ScoringPreferences, now: DateTime<Utc>) {
    all.par_iter_mut()
        .for_each(|stats| refresh_score(stats, prefs, now));
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn history(now: DateTime<Utc>) -> TrackStatistics {
        TrackStatistics {
            play_count: 12,
            skip_count: 2,
            total_play_time_sec: 2_400.0,
            avg_play_percentage: 85.0,
            last_played_at: Some(now - Duration::days(3)),
            first_played_at: Some(now - Duration::days(60)),
            rating: Some(4),
            ..TrackStatistics::new("track-1")
        }
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let now = Utc::now();
        let prefs = ScoringPreferences::default();
        let stats = history(now);
        assert_eq!(personal_score(&stats, &prefs, now), personal_score(&stats, &prefs, now));
    }

    #[test]
    fn test_favorite_strictly_increases_score() {
        let now = Utc::now();
        let prefs = ScoringPreferences::default();
        let plain = history(now);
        let loved = TrackStatistics { favorite: true, ..plain.clone() };

        assert!(personal_score(&loved, &prefs, now) > personal_score(&plain, &prefs, now));
    }

    #[test]
    fn test_favorite_lifts_item_without_history() {
        let now = Utc::now();
        let prefs = ScoringPreferences::default();
        let empty = TrackStatistics::new("fresh");
        let loved = TrackStatistics { favorite: true, ..empty.clone() };

        assert_eq!(personal_score(&empty, &prefs, now), 0.0);
        assert!(personal_score(&loved, &prefs, now) > 0.0);
    }

    #[test]
    fn test_score_is_never_negative() {
        let now = Utc::now();
        let prefs = ScoringPreferences::default();
        let hated = TrackStatistics {
            play_count: 1_000,
            skip_count: 1_000,
            avg_play_percentage: 1.0,
            ..TrackStatistics::new("hated")
        };
        let score = personal_score(&hated, &prefs, now);
        assert!(score >= 0.0, "score should be clamped at zero");
        assert!(score.is_finite());
    }

    #[test]
    fn test_recent_play_scores_higher() {
        let now = Utc::now();
        let prefs = ScoringPreferences::default();
        let recent = history(now);
        let stale = TrackStatistics {
            last_played_at: Some(now - Duration::days(365)),
            ..recent.clone()
        };
        assert!(personal_score(&recent, &prefs, now) > personal_score(&stale, &prefs, now));
    }

    #[test]
    fn test_rating_raises_score() {
        let now = Utc::now();
        let prefs = ScoringPreferences::default();
        let low = TrackStatistics { rating: Some(1), ..history(now) };
        let high = TrackStatistics { rating: Some(5), ..history(now) };
        assert!(personal_score(&high, &prefs, now) > personal_score(&low, &prefs, now));
    }

    #[test]
    fn test_play_count_saturates() {
        let k = ScoringPreferences::default().saturation_constant;
        assert_eq!(saturate(0, k), 0.0);
        assert!(saturate(10_000, k) < 1.0);
        assert!(saturate(20, k) > saturate(10, k));
    }

    #[test]
    fn test_skip_threshold() {
        assert!(is_skip(30.0));
        assert!(!is_skip(80.0));
        assert!(!is_skip(100.0));
    }

    #[test]
    fn test_validated_clamps_ranges() {
        let prefs = ScoringPreferences {
            play_count_weight: -1.0,
            recency_half_life_days: 0.0,
            favorite_boost: 0.5,
            blend_weight: 3.0,
            saturation_constant: f64::NAN,
            ..ScoringPreferences::default()
        }
        .validated();

        assert_eq!(prefs.play_count_weight, 0.0);
        assert_eq!(prefs.recency_half_life_days, 30.0);
        assert_eq!(prefs.favorite_boost, 1.5);
        assert_eq!(prefs.blend_weight, 1.0);
        assert_eq!(prefs.saturation_constant, 10.0);
    }

    #[test]
    fn test_favorite_boost_of_one_is_replaced() {
        let now = Utc::now();
        let prefs = ScoringPreferences {
            favorite_boost: 1.0,
            ..ScoringPreferences::default()
        }
        .validated();
        assert!(prefs.favorite_boost > 1.0);

        let plain = history(now);
        let loved = TrackStatistics { favorite: true, ..plain.clone() };
        assert!(personal_score(&loved, &prefs, now) > personal_score(&plain, &prefs, now));

        let custom = ScoringPreferences {
            favorite_boost: 1.01,
            ..ScoringPreferences::default()
        }
        .validated();
        assert_eq!(custom.favorite_boost, 1.01);
    }

    #[test]
    fn test_clamp_blend_weight_nan_uses_fallback() {
        assert_eq!(clamp_blend_weight(f64::NAN, 0.3), 0.3);
        assert_eq!(clamp_blend_weight(-0.5, 0.3), 0.0);
    }

    #[test]
    fn test_parallel_refresh_matches_individual() {
        let now = Utc::now();
        let prefs = ScoringPreferences::default();
        let mut all: Vec<TrackStatistics> = (0..100u32)
            .map(|i| TrackStatistics {
                play_count: i % 17,
                skip_count: i % 5,
                avg_play_percentage: f64::from(i % 100),
                favorite: i % 10 == 0,
                ..TrackStatistics::new(format!("t{i}"))
            })
            .collect();

        refresh_scores(&mut all, &prefs, now);

        for stats in &all {
            assert_eq!(stats.personal_score, personal_score(stats, &prefs, now));
            assert_eq!(stats.score_updated_at, Some(now));
        }
    }
}
