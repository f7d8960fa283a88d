//! # Data Model
//!
//! Shared types flowing between the cache, the affinity store, the unifier
//! and the reranker.
//!
//! [`UnifiedResult`] is a sum type over the two result origins. Code that
//! needs source-specific fields matches on it; the common subset (id, title,
//! artist, album, duration) is available through accessor methods.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Where a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    Local,
    Remote,
}

impl ResultSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ResultSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ResultSource {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(CoreError::InvalidInput(format!("unknown result source `{other}`"))),
        }
    }
}

/// What the user did with a search result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InteractionType {
    Click,
    Play,
    Download,
    Ignore,
}

impl InteractionType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Click => "click",
            Self::Play => "play",
            Self::Download => "download",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for InteractionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "click" => Ok(Self::Click),
            "play" => Ok(Self::Play),
            "download" => Ok(Self::Download),
            "ignore" => Ok(Self::Ignore),
            other => Err(CoreError::InvalidInput(format!(
                "unknown interaction type `{other}`"
            ))),
        }
    }
}

/// Per-item listening statistics.
///
/// `personal_score` is derived: it is only ever written by
/// [`crate::scoring::personal_score`] after one of the other fields changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackStatistics {
    pub item_id: String,
    pub play_count: u32,
    pub skip_count: u32,
    pub total_play_time_sec: f64,
    /// Running average of play completion, in percent (0-100)
    pub avg_play_percentage: f64,
    pub last_played_at: Option<DateTime<Utc>>,
    pub first_played_at: Option<DateTime<Utc>>,
    /// 1-5 stars
    pub rating: Option<u8>,
    pub personal_score: f64,
    pub score_updated_at: Option<DateTime<Utc>>,
    pub favorite: bool,
}

impl TrackStatistics {
    /// Fresh statistics for an item that has never been interacted with
    #[must_use]
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            play_count: 0,
            skip_count: 0,
            total_play_time_sec: 0.0,
            avg_play_percentage: 0.0,
            last_played_at: None,
            first_played_at: None,
            rating: None,
            personal_score: 0.0,
            score_updated_at: None,
            favorite: false,
        }
    }
}

/// Append-only record of a user acting on a search result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchInteraction {
    pub query: String,
    pub result_id: String,
    pub result_source: ResultSource,
    pub interaction_type: InteractionType,
    pub at: DateTime<Utc>,
    pub position: Option<u32>,
    pub session_id: Option<String>,
}

/// Optional context attached to a play event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlayContext {
    /// The query the item was played from, if it came out of a search
    pub query: Option<String>,
    pub position: Option<u32>,
    pub session_id: Option<String>,
}

/// A track as the local metadata store describes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalTrackFields {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_sec: Option<f64>,
    pub path: Option<String>,
    pub genre: Option<String>,
}

/// A result as the federated search endpoint describes it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResultFields {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_sec: Option<f64>,
    pub url: String,
    pub engine: Option<String>,
    pub content: Option<String>,
    /// Relevance the endpoint assigned, if any
    pub score: Option<f64>,
}

/// Filters passed through to the local library query
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryFilters {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub limit: Option<usize>,
}

/// One search result, local or remote.
///
/// A local result that was also found remotely keeps the remote copy in
/// `remote` so fields like the external URL survive deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum UnifiedResult {
    Local {
        fields: LocalTrackFields,
        remote: Option<RemoteResultFields>,
        personal_score: Option<f64>,
    },
    Remote {
        fields: RemoteResultFields,
        personal_score: Option<f64>,
    },
}

impl UnifiedResult {
    #[must_use]
    pub const fn local(fields: LocalTrackFields) -> Self {
        Self::Local {
            fields,
            remote: None,
            personal_score: None,
        }
    }

    #[must_use]
    pub const fn remote(fields: RemoteResultFields) -> Self {
        Self::Remote {
            fields,
            personal_score: None,
        }
    }

    #[must_use]
    pub const fn source(&self) -> ResultSource {
        match self {
            Self::Local { .. } => ResultSource::Local,
            Self::Remote { .. } => ResultSource::Remote,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Local { fields, .. } => &fields.id,
            Self::Remote { fields, .. } => &fields.id,
        }
    }

    #[must_use]
    pub fn title(&self) -> &str {
        match self {
            Self::Local { fields, .. } => &fields.title,
            Self::Remote { fields, .. } => &fields.title,
        }
    }

    #[must_use]
    pub fn artist(&self) -> &str {
        match self {
            Self::Local { fields, .. } => &fields.artist,
            Self::Remote { fields, .. } => &fields.artist,
        }
    }

    #[must_use]
    pub fn album(&self) -> Option<&str> {
        match self {
            Self::Local { fields, remote, .. } => fields
                .album
                .as_deref()
                .or_else(|| remote.as_ref().and_then(|r| r.album.as_deref())),
            Self::Remote { fields, .. } => fields.album.as_deref(),
        }
    }

    #[must_use]
    pub fn duration_sec(&self) -> Option<f64> {
        match self {
            Self::Local { fields, remote, .. } => fields
                .duration_sec
                .or_else(|| remote.as_ref().and_then(|r| r.duration_sec)),
            Self::Remote { fields, .. } => fields.duration_sec,
        }
    }

    /// Id of the matching library item, if there is one
    #[must_use]
    pub fn local_item_id(&self) -> Option<&str> {
        match self {
            Self::Local { fields, .. } => Some(&fields.id),
            Self::Remote { .. } => None,
        }
    }

    /// External URL, taken from the remote copy for merged local results
    #[must_use]
    pub fn external_url(&self) -> Option<&str> {
        match self {
            Self::Local { remote, .. } => remote.as_ref().map(|r| r.url.as_str()),
            Self::Remote { fields, .. } => Some(&fields.url),
        }
    }

    /// Personal score, only present after reranking
    #[must_use]
    pub const fn personal_score(&self) -> Option<f64> {
        match self {
            Self::Local { personal_score, .. } | Self::Remote { personal_score, .. } => {
                *personal_score
            }
        }
    }

    pub fn set_personal_score(&mut self, score: f64) {
        match self {
            Self::Local { personal_score, .. } | Self::Remote { personal_score, .. } => {
                *personal_score = Some(score);
            }
        }
    }

    /// Identity used for deduplication: normalized `(artist, title)`
    #[must_use]
    pub fn dedup_key(&self) -> (String, String) {
        (normalize_text(self.artist()), normalize_text(self.title()))
    }
}

/// Lowercase, trim and collapse internal whitespace
#[must_use]
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(id: &str, artist: &str, title: &str) -> LocalTrackFields {
        LocalTrackFields {
            id: id.to_string(),
            title: title.to_string(),
            artist: artist.to_string(),
            album: None,
            duration_sec: Some(240.0),
            path: None,
            genre: None,
        }
    }

    #[test]
    fn test_normalize_text_collapses_case_and_whitespace() {
        assert_eq!(normalize_text("  Paranoid   Android "), "paranoid android");
        assert_eq!(normalize_text("RADIOHEAD"), "radiohead");
        assert_eq!(normalize_text("\tA\n B "), "a b");
    }

    #[test]
    fn test_dedup_key_ignores_case_and_spacing() {
        let a = UnifiedResult::local(local("1", "Radiohead", "Karma Police"));
        let b = UnifiedResult::local(local("2", "  radiohead", "karma   POLICE "));
        assert_eq!(a.dedup_key(), b.dedup_key());
    }

    #[test]
    fn test_merged_local_exposes_remote_url_and_album() {
        let remote = RemoteResultFields {
            id: "https://example.org/ok".to_string(),
            title: "Karma Police".to_string(),
            artist: "Radiohead".to_string(),
            album: Some("OK Computer".to_string()),
            duration_sec: None,
            url: "https://example.org/ok".to_string(),
            engine: Some("musicbrainz".to_string()),
            content: None,
            score: None,
        };
        let result = UnifiedResult::Local {
            fields: local("1", "Radiohead", "Karma Police"),
            remote: Some(remote),
            personal_score: None,
        };

        assert_eq!(result.external_url(), Some("https://example.org/ok"));
        assert_eq!(result.album(), Some("OK Computer"));
        assert_eq!(result.local_item_id(), Some("1"));
        assert_eq!(result.source(), ResultSource::Local);
    }

    #[test]
    fn test_enum_string_round_trip() {
        for kind in [
            InteractionType::Click,
            InteractionType::Play,
            InteractionType::Download,
            InteractionType::Ignore,
        ] {
            assert_eq!(kind.as_str().parse::<InteractionType>().unwrap(), kind);
        }
        assert!("bogus".parse::<ResultSource>().is_err());
    }

    #[test]
    fn test_unified_result_serializes_with_source_tag() {
        let result = UnifiedResult::local(local("1", "Radiohead", "Airbag"));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["source"], "local");
        let back: UnifiedResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }
}
