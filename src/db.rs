//! SQLite storage for the library, listening statistics and the search
//! interaction log.
//!
//! One [`Database`] handle implements both [`LocalLibrary`] and
//! [`StatisticsStore`]. The connection sits behind a mutex and every query
//! runs on the blocking thread pool so async callers never stall the runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, trace};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, Result};
use crate::model::{
    normalize_text, LibraryFilters, LocalTrackFields, SearchInteraction, TrackStatistics,
};
use crate::sources::{LocalLibrary, StatisticsStore};

/// Default cap on library query results
const DEFAULT_LIBRARY_LIMIT: usize = 50;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tracks (
    id           TEXT PRIMARY KEY,
    title        TEXT NOT NULL,
    artist       TEXT NOT NULL,
    album        TEXT,
    duration_sec REAL,
    path         TEXT,
    genre        TEXT
);

CREATE TABLE IF NOT EXISTS track_statistics (
    item_id             TEXT PRIMARY KEY,
    play_count          INTEGER NOT NULL DEFAULT 0,
    skip_count          INTEGER NOT NULL DEFAULT 0,
    total_play_time_sec REAL    NOT NULL DEFAULT 0,
    avg_play_percentage REAL    NOT NULL DEFAULT 0,
    last_played_at      INTEGER,
    first_played_at     INTEGER,
    rating              INTEGER,
    personal_score      REAL    NOT NULL DEFAULT 0,
    score_updated_at    INTEGER,
    favorite            INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_statistics_score ON track_statistics(personal_score DESC);
CREATE INDEX IF NOT EXISTS idx_statistics_last_played ON track_statistics(last_played_at DESC);

CREATE TABLE IF NOT EXISTS search_interactions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    query            TEXT    NOT NULL,
    normalized_query TEXT    NOT NULL,
    result_id        TEXT    NOT NULL,
    result_source    TEXT    NOT NULL,
    interaction_type TEXT    NOT NULL,
    at               INTEGER NOT NULL,
    position         INTEGER,
    session_id       TEXT
);

CREATE INDEX IF NOT EXISTS idx_interactions_query ON search_interactions(normalized_query);
";

const STATISTICS_COLUMNS: &str = "item_id, play_count, skip_count, total_play_time_sec, \
     avg_play_percentage, last_played_at, first_played_at, rating, personal_score, \
     score_updated_at, favorite";

/// Shared SQLite handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Open (or create) the database file at `path` and make sure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            CoreError::LocalStore(format!("cannot open database at {}: {e}", path.display()))
        })?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        info!("Opened database at {}", path.display());
        Self::with_connection(conn)
    }

    /// Throwaway database, mostly for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| CoreError::LocalStore("database connection mutex poisoned".to_string()))?;
            f(&mut guard)
        })
        .await?
    }

    /// Insert or replace a library track
    pub async fn upsert_track(&self, track: LocalTrackFields) -> Result<()> {
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO tracks (id, title, artist, album, duration_sec, path, genre)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title, artist = excluded.artist, album = excluded.album,
                    duration_sec = excluded.duration_sec, path = excluded.path, genre = excluded.genre",
                params![
                    track.id,
                    track.title,
                    track.artist,
                    track.album,
                    track.duration_sec,
                    track.path,
                    track.genre
                ],
            )?;
            trace!("Upserted track `{}`", track.id);
            Ok(())
        })
        .await
    }

    /// Delete a library track together with its statistics.
    /// Returns whether the track existed.
    pub async fn remove_track(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM tracks WHERE id = ?1", [&id])?;
            let cascaded = tx.execute("DELETE FROM track_statistics WHERE item_id = ?1", [&id])?;
            tx.commit()?;
            debug!("Removed track `{id}` ({removed} track rows, {cascaded} statistics rows)");
            Ok(removed > 0)
        })
        .await
    }

    pub async fn track_count(&self) -> Result<usize> {
        self.run(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM tracks", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
        .await
    }
}

fn to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|t| t.timestamp_millis())
}

fn from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

/// Escape `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn row_to_track(row: &Row<'_>) -> rusqlite::Result<LocalTrackFields> {
    Ok(LocalTrackFields {
        id: row.get(0)?,
        title: row.get(1)?,
        artist: row.get(2)?,
        album: row.get(3)?,
        duration_sec: row.get(4)?,
        path: row.get(5)?,
        genre: row.get(6)?,
    })
}

fn row_to_statistics(row: &Row<'_>) -> rusqlite::Result<TrackStatistics> {
    Ok(TrackStatistics {
        item_id: row.get(0)?,
        play_count: row.get(1)?,
        skip_count: row.get(2)?,
        total_play_time_sec: row.get(3)?,
        avg_play_percentage: row.get(4)?,
        last_played_at: from_millis(row.get(5)?),
        first_played_at: from_millis(row.get(6)?),
        rating: row.get(7)?,
        personal_score: row.get(8)?,
        score_updated_at: from_millis(row.get(9)?),
        favorite: row.get(10)?,
    })
}

fn write_statistics(conn: &Connection, stats: &TrackStatistics) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO track_statistics (item_id, play_count, skip_count, total_play_time_sec,
            avg_play_percentage, last_played_at, first_played_at, rating, personal_score,
            score_updated_at, favorite)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(item_id) DO UPDATE SET
            play_count = excluded.play_count,
            skip_count = excluded.skip_count,
            total_play_time_sec = excluded.total_play_time_sec,
            avg_play_percentage = excluded.avg_play_percentage,
            last_played_at = excluded.last_played_at,
            first_played_at = excluded.first_played_at,
            rating = excluded.rating,
            personal_score = excluded.personal_score,
            score_updated_at = excluded.score_updated_at,
            favorite = excluded.favorite",
        params![
            stats.item_id,
            stats.play_count,
            stats.skip_count,
            stats.total_play_time_sec,
            stats.avg_play_percentage,
            to_millis(stats.last_played_at),
            to_millis(stats.first_played_at),
            stats.rating,
            stats.personal_score,
            to_millis(stats.score_updated_at),
            stats.favorite,
        ],
    )
}

fn query_statistics(
    conn: &Connection,
    sql_tail: &str,
    limit: usize,
) -> rusqlite::Result<Vec<TrackStatistics>> {
    let sql = format!("SELECT {STATISTICS_COLUMNS} FROM track_statistics {sql_tail} LIMIT ?1");
    let mut stmt = conn.prepare(&sql)?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map([limit], row_to_statistics)?;
    rows.collect()
}

#[async_trait]
impl LocalLibrary for Database {
    async fn query_library(
        &self,
        text: &str,
        filters: &LibraryFilters,
    ) -> Result<Vec<LocalTrackFields>> {
        let tokens: Vec<String> = normalize_text(text)
            .split(' ')
            .filter(|t| !t.is_empty())
            .map(|t| format!("%{}%", escape_like(t)))
            .collect();
        let exact = normalize_text(text);
        let filters = filters.clone();

        self.run(move |conn| {
            let mut sql = String::from(
                "SELECT id, title, artist, album, duration_sec, path, genre FROM tracks WHERE 1 = 1",
            );
            let mut values: Vec<String> = Vec::new();

            for token in tokens {
                values.push(token);
                let n = values.len();
                sql.push_str(&format!(
                    " AND (title LIKE ?{n} ESCAPE '\\' OR artist LIKE ?{n} ESCAPE '\\' OR album LIKE ?{n} ESCAPE '\\')"
                ));
            }
            if let Some(artist) = filters.artist {
                values.push(artist);
                sql.push_str(&format!(" AND artist = ?{} COLLATE NOCASE", values.len()));
            }
            if let Some(album) = filters.album {
                values.push(album);
                sql.push_str(&format!(" AND album = ?{} COLLATE NOCASE", values.len()));
            }

            values.push(exact);
            let exact_idx = values.len();
            sql.push_str(&format!(
                " ORDER BY CASE WHEN lower(title) = ?{exact_idx} THEN 0 \
                   WHEN lower(artist) = ?{exact_idx} THEN 1 ELSE 2 END, artist, album, title"
            ));

            let limit = filters.limit.unwrap_or(DEFAULT_LIBRARY_LIMIT);
            values.push(limit.to_string());
            sql.push_str(&format!(" LIMIT CAST(?{} AS INTEGER)", values.len()));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(values.iter()), row_to_track)?;
            let tracks = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            trace!("Library query matched {} tracks", tracks.len());
            Ok(tracks)
        })
        .await
    }

    async fn get_item(&self, id: &str) -> Result<Option<LocalTrackFields>> {
        let id = id.to_string();
        self.run(move |conn| {
            let track = conn
                .query_row(
                    "SELECT id, title, artist, album, duration_sec, path, genre FROM tracks WHERE id = ?1",
                    [&id],
                    row_to_track,
                )
                .optional()?;
            Ok(track)
        })
        .await
    }

    async fn remove_item(&self, id: &str) -> Result<bool> {
        self.remove_track(id).await
    }
}

#[async_trait]
impl StatisticsStore for Database {
    async fn load_statistics(&self, item_id: &str) -> Result<Option<TrackStatistics>> {
        let item_id = item_id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {STATISTICS_COLUMNS} FROM track_statistics WHERE item_id = ?1");
            Ok(conn.query_row(&sql, [&item_id], row_to_statistics).optional()?)
        })
        .await
    }

    async fn save_statistics(&self, stats: TrackStatistics) -> Result<()> {
        self.run(move |conn| {
            write_statistics(conn, &stats)?;
            Ok(())
        })
        .await
    }

    async fn save_statistics_batch(&self, stats: Vec<TrackStatistics>) -> Result<()> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for row in &stats {
                write_statistics(&tx, row)?;
            }
            tx.commit()?;
            debug!("Saved {} statistics rows", stats.len());
            Ok(())
        })
        .await
    }

    async fn all_statistics(&self) -> Result<Vec<TrackStatistics>> {
        self.run(|conn| Ok(query_statistics(conn, "ORDER BY item_id", usize::MAX)?))
            .await
    }

    async fn scores(&self, item_ids: Vec<String>) -> Result<HashMap<String, f64>> {
        if item_ids.is_empty() {
            return Ok(HashMap::new());
        }
        self.run(move |conn| {
            let placeholders = (1..=item_ids.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT item_id, personal_score FROM track_statistics WHERE item_id IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(item_ids.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
            })?;
            Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
        })
        .await
    }

    async fn top_items(&self, limit: usize) -> Result<Vec<TrackStatistics>> {
        self.run(move |conn| {
            Ok(query_statistics(
                conn,
                "ORDER BY personal_score DESC, last_played_at DESC, item_id",
                limit,
            )?)
        })
        .await
    }

    async fn recently_played(&self, limit: usize) -> Result<Vec<TrackStatistics>> {
        self.run(move |conn| {
            Ok(query_statistics(
                conn,
                "WHERE last_played_at IS NOT NULL ORDER BY last_played_at DESC, item_id",
                limit,
            )?)
        })
        .await
    }

    async fn delete_statistics(&self, item_id: &str) -> Result<bool> {
        let item_id = item_id.to_string();
        self.run(move |conn| {
            Ok(conn.execute("DELETE FROM track_statistics WHERE item_id = ?1", [&item_id])? > 0)
        })
        .await
    }

    async fn append_interactions(&self, interactions: Vec<SearchInteraction>) -> Result<()> {
        if interactions.is_empty() {
            return Ok(());
        }
        self.run(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO search_interactions (query, normalized_query, result_id,
                        result_source, interaction_type, at, position, session_id)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for interaction in &interactions {
                    stmt.execute(params![
                        interaction.query,
                        normalize_text(&interaction.query),
                        interaction.result_id,
                        interaction.result_source.as_str(),
                        interaction.interaction_type.as_str(),
                        interaction.at.timestamp_millis(),
                        interaction.position,
                        interaction.session_id,
                    ])?;
                }
            }
            tx.commit()?;
            trace!("Appended {} interactions", interactions.len());
            Ok(())
        })
        .await
    }

    async fn matching_queries(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let pattern = format!("{}%", escape_like(&normalize_text(prefix)));
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT normalized_query, COUNT(*) AS uses, MAX(at) AS latest
                 FROM search_interactions
                 WHERE normalized_query LIKE ?1 ESCAPE '\\'
                 GROUP BY normalized_query
                 ORDER BY uses DESC, latest DESC
                 LIMIT ?2",
            )?;
            let limit = i64::try_from(limit).unwrap_or(i64::MAX);
            let rows = stmt.query_map(params![pattern, limit], |row| row.get::<_, String>(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn clear_interactions(&self) -> Result<usize> {
        self.run(|conn| Ok(conn.execute("DELETE FROM search_interactions", [])?))
            .await
    }
}
