//! # Command-Line Interface Module
//!
//! Clap derive definitions for the `tunesift` binary. Every subcommand maps
//! onto one [`crate::core::SearchCore`] operation.
//!
//! ## Commands
//!
//! - `search`: Unified local + remote search, reranked by affinity
//! - `suggest`: Query completions from history and favorite items
//! - `status`: Online/degraded/offline state
//! - `cache`: Result cache statistics and clearing
//! - `play`, `rate`, `favorite`: Feed the affinity statistics
//! - `recent`, `top`: Listening statistics
//! - `library`: Add or remove local items
//! - `history`: Clear the search interaction log
//! - `prefs`: Show or change scoring preferences
//!
//! ## Examples
//!
//! ```bash
//! tunesift search "karma police" --engines bandcamp,youtube
//! tunesift play 42 --seconds 180 --percent 95
//! tunesift --offline search radiohead
//! ```

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::scoring::ScoringPreferences;

/// Shell types supported for completion generation
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    /// Bash shell
    Bash,
    /// Zsh shell
    Zsh,
    /// Fish shell
    Fish,
    /// PowerShell
    PowerShell,
    /// Elvish shell
    Elvish,
}

/// Main application arguments structure.
#[derive(Parser, Debug)]
#[command(name = "tunesift")]
#[command(about = "Tunesift: personalized, offline-capable music search")]
#[command(version)]
pub struct Args {
    /// Data directory (database, cache snapshot, config.toml)
    #[arg(long, global = true, env = "TUNESIFT_DATA_DIR", value_hint = clap::ValueHint::DirPath)]
    pub data_dir: Option<PathBuf>,

    /// Federated search endpoint, overriding config.toml
    #[arg(long, global = true, env = "TUNESIFT_REMOTE_URL", value_hint = clap::ValueHint::Url)]
    pub remote_url: Option<String>,

    /// Never contact the remote endpoint
    #[arg(long, global = true)]
    pub offline: bool,

    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Enumeration of all available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search the local library and the federated endpoint
    ///
    /// Results from both sides are merged, duplicates collapsed onto the
    /// local copy, and the list reranked by your listening history. When the
    /// endpoint is unreachable, cached or local-only results are shown.
    Search {
        /// Free-text query
        #[arg(value_hint = clap::ValueHint::Other)]
        query: String,

        /// Remote engines to ask, comma separated
        #[arg(long, value_delimiter = ',')]
        engines: Vec<String>,

        /// Remote categories, comma separated
        #[arg(long, value_delimiter = ',')]
        categories: Vec<String>,

        /// Maximum number of results to print
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Personal affinity weight in [0, 1]; 0 keeps relevance order
        #[arg(short, long)]
        weight: Option<f64>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Suggest query completions
    Suggest {
        /// Beginning of a query
        partial: String,

        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show whether remote search is online, degraded or offline
    ///
    /// Probes the endpoint once before reporting.
    Status,

    /// Inspect or clear the search result cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Record a play of a library item
    ///
    /// Without --skipped, a play below 80% completion counts as a skip.
    Play {
        /// Library item id
        item: String,

        /// Seconds actually listened
        #[arg(long)]
        seconds: f64,

        /// Share of the track listened, 0-100
        #[arg(long)]
        percent: f64,

        /// Mark the play as skipped regardless of completion
        #[arg(long)]
        skipped: bool,

        /// Query that led to this play, for search history
        #[arg(long)]
        query: Option<String>,
    },

    /// Rate a library item from 1 to 5
    Rate {
        item: String,

        #[arg(value_parser = clap::value_parser!(u8).range(1..=5))]
        rating: u8,
    },

    /// Toggle the favorite flag on a library item
    Favorite { item: String },

    /// Recently played items, newest first
    Recent {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Items with the highest personal score
    Top {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Manage the local library
    Library {
        #[command(subcommand)]
        action: LibraryAction,
    },

    /// Manage the search interaction history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Show scoring preferences, or change them and rescore every item
    Prefs(PrefsArgs),

    /// Generate shell completions
    ///
    /// Usage: tunesift completion bash > ~/.local/share/bash-completion/completions/tunesift
    Completion {
        /// Shell to generate completions for
        shell: Shell,
    },

    /// Print query completions for shell scripts (hidden command)
    #[command(hide = true)]
    CompleteQueries {
        #[arg(default_value = "")]
        partial: String,
    },
}

/// Cache management actions
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Hit rate, memory use, pressure and popular queries
    Stats,
    /// Drop every cached search
    Clear,
}

/// Library management actions
#[derive(Subcommand, Debug)]
pub enum LibraryAction {
    /// Add or update an item
    Add {
        /// Stable item id
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        artist: String,
        #[arg(long)]
        album: Option<String>,
        #[arg(long)]
        duration: Option<f64>,
        #[arg(long, value_hint = clap::ValueHint::FilePath)]
        path: Option<String>,
        #[arg(long)]
        genre: Option<String>,
    },
    /// Remove an item and its statistics
    Remove { id: String },
}

/// History management actions
#[derive(Subcommand, Debug)]
pub enum HistoryAction {
    /// Delete every recorded search interaction
    Clear,
}

/// Scoring preference overrides; with none given the current values are shown
#[derive(ClapArgs, Debug, Default)]
pub struct PrefsArgs {
    #[arg(long)]
    pub play_count_weight: Option<f64>,
    #[arg(long)]
    pub completion_weight: Option<f64>,
    #[arg(long)]
    pub skip_penalty: Option<f64>,
    #[arg(long)]
    pub rating_weight: Option<f64>,
    #[arg(long)]
    pub recency_weight: Option<f64>,
    #[arg(long)]
    pub favorite_boost: Option<f64>,
    #[arg(long)]
    pub recency_half_life_days: Option<f64>,
    #[arg(long)]
    pub blend_weight: Option<f64>,
}

impl PrefsArgs {
    /// No override given, only show the current values
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.play_count_weight.is_none()
            && self.completion_weight.is_none()
            && self.skip_penalty.is_none()
            && self.rating_weight.is_none()
            && self.recency_weight.is_none()
            && self.favorite_boost.is_none()
            && self.recency_half_life_days.is_none()
            && self.blend_weight.is_none()
    }

    /// `current` with every given override applied, then validated
    #[must_use]
    pub fn apply(&self, current: ScoringPreferences) -> ScoringPreferences {
        ScoringPreferences {
            play_count_weight: self.play_count_weight.unwrap_or(current.play_count_weight),
            completion_weight: self.completion_weight.unwrap_or(current.completion_weight),
            skip_penalty: self.skip_penalty.unwrap_or(current.skip_penalty),
            rating_weight: self.rating_weight.unwrap_or(current.rating_weight),
            recency_weight: self.recency_weight.unwrap_or(current.recency_weight),
            favorite_boost: self.favorite_boost.unwrap_or(current.favorite_boost),
            recency_half_life_days: self
                .recency_half_life_days
                .unwrap_or(current.recency_half_life_days),
            blend_weight: self.blend_weight.unwrap_or(current.blend_weight),
            ..current
        }
        .validated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_search_engines_split_on_commas() {
        let args = Args::parse_from(["tunesift", "search", "karma police", "--engines", "bandcamp,youtube", "-w", "0.5"]);
        match args.command {
            Command::Search { query, engines, weight, .. } => {
                assert_eq!(query, "karma police");
                assert_eq!(engines, vec!["bandcamp", "youtube"]);
                assert_eq!(weight, Some(0.5));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_rating_out_of_range_is_rejected() {
        assert!(Args::try_parse_from(["tunesift", "rate", "42", "6"]).is_err());
        assert!(Args::try_parse_from(["tunesift", "rate", "42", "5"]).is_ok());
    }

    #[test]
    fn test_prefs_overrides_are_validated() {
        let args = PrefsArgs {
            blend_weight: Some(2.0),
            skip_penalty: Some(0.5),
            ..PrefsArgs::default()
        };
        assert!(!args.is_empty());
        let prefs = args.apply(ScoringPreferences::default());
        assert_eq!(prefs.blend_weight, 1.0);
        assert_eq!(prefs.skip_penalty, 0.5);
        assert_eq!(prefs.rating_weight, ScoringPreferences::default().rating_weight);
    }

    #[test]
    fn test_global_offline_flag() {
        let args = Args::parse_from(["tunesift", "status", "--offline"]);
        assert!(args.offline);
    }
}
