//! # Tunesift - Personalized Music Search
//!
//! Command-line front end for [`tunesift::core::SearchCore`]. Searches the
//! local library together with a federated search endpoint, falls back to
//! cached or local results when the endpoint is down, and learns from plays,
//! ratings and favorites.
//!
//! ## Usage
//!
//! ```bash
//! tunesift library add 42 --title "Karma Police" --artist Radiohead
//! tunesift search "karma police"
//! tunesift play 42 --seconds 250 --percent 95 --query "karma police"
//! tunesift top
//! ```

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;

use tunesift::affinity::PlayEvent;
use tunesift::cli::{self, CacheAction, Command, HistoryAction, LibraryAction};
use tunesift::completion;
use tunesift::config::{AppMode, CoreConfig, DataPaths};
use tunesift::core::{SearchCore, SearchCoreContext};
use tunesift::db::Database;
use tunesift::model::{LocalTrackFields, PlayContext, TrackStatistics, UnifiedResult};
use tunesift::offline::{SearchSession, ServedFrom, SessionStatus};
use tunesift::unifier::SearchOptions;

/// Main entry point for the Tunesift application.
///
/// Logging is controlled via `RUST_LOG`:
/// - `RUST_LOG=debug tunesift search radiohead` - Enable debug logging
/// - `RUST_LOG=tunesift::offline=trace tunesift status` - Module-specific logging
#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let args = cli::Args::parse();

    // Completion scripts need neither the database nor the network
    if let Command::Completion { shell } = &args.command {
        let mut cmd = cli::Args::command();
        completion::write_completion_script(*shell, &mut cmd, &mut io::stdout())
            .context("Failed to write completion script")?;
        return Ok(());
    }

    let paths = DataPaths::resolve(args.data_dir.as_deref())?;
    let mut config = CoreConfig::load(&paths.config_file)?;
    config.apply_env_overrides()?;
    if let Some(url) = &args.remote_url {
        config.remote_url = url.trim_end_matches('/').to_string();
    }
    if args.offline {
        config.mode = AppMode::Offline;
    }
    let config = config.validated();
    debug!("Using data directory {}", paths.data_dir.display());

    let db = Arc::new(
        Database::open(&paths.db_path)
            .with_context(|| format!("Failed to open database at {}", paths.db_path.display()))?,
    );
    let context = SearchCoreContext::with_database(Arc::clone(&db), config, Some(paths.cache_snapshot.clone()))
        .context("Failed to set up search")?;
    let core = SearchCore::start(context);

    let outcome = run(&core, &db, args.command).await;
    core.shutdown().await.context("Failed to shut down cleanly")?;
    outcome
}

async fn run(core: &SearchCore, db: &Database, command: Command) -> Result<()> {
    match command {
        Command::Search {
            query,
            engines,
            categories,
            limit,
            weight,
            json,
        } => {
            let options = SearchOptions {
                engines: (!engines.is_empty()).then_some(engines),
                categories: (!categories.is_empty()).then_some(categories),
                weight_override: weight,
                ..SearchOptions::default()
            };
            let mut session = core
                .perform_search(&query, &options)
                .await
                .with_context(|| format!("Search for `{query}` failed"))?;
            session.results.truncate(limit);
            if json {
                println!("{}", serde_json::to_string_pretty(&session)?);
            } else {
                print_session(&session);
            }
        }
        Command::Suggest { partial, limit } => {
            for suggestion in core.get_suggestions(&partial, limit).await? {
                println!("{suggestion}");
            }
        }
        Command::CompleteQueries { partial } => {
            // Completion must never print errors into the user's prompt
            match core.get_suggestions(&partial, 20).await {
                Ok(queries) => completion::print_query_completions(&queries, &mut io::stdout())?,
                Err(e) => debug!("No completions: {e}"),
            }
        }
        Command::Status => {
            let status = core.refresh_connectivity().await;
            println!("Mode: {}", status.mode);
            if status.forced_offline {
                println!("Offline mode requested; remote endpoint is not contacted");
            }
            if let Some(error) = status.last_error {
                println!("Last error: {error}");
            }
        }
        Command::Cache { action } => match action {
            CacheAction::Stats => {
                let stats = core.get_cache_statistics();
                let cache = &stats.cache;
                println!("Entries:   {}", cache.item_count);
                println!(
                    "Memory:    {} / {} bytes ({:.1}%, {:?} pressure)",
                    cache.total_size, cache.max_memory, cache.memory_usage_pct, cache.pressure_level
                );
                println!("Hit rate:  {:.2}% ({} hits, {} misses)", cache.hit_rate, cache.hits, cache.misses);
                println!("Evictions: {} ({} expired)", cache.evictions, cache.expirations);
                if !stats.popular_queries.is_empty() {
                    println!("Popular queries:");
                    for popular in &stats.popular_queries {
                        println!("  {:>4}  {}", popular.count, popular.query);
                    }
                }
            }
            CacheAction::Clear => {
                let removed = core.clear_cache();
                println!("Removed {removed} cached searches");
            }
        },
        Command::Play {
            item,
            seconds,
            percent,
            skipped,
            query,
        } => {
            let event = PlayEvent {
                duration_played_sec: seconds,
                play_percentage: percent,
                skipped: skipped.then_some(true),
                context: PlayContext {
                    query,
                    ..PlayContext::default()
                },
            };
            match core.record_play(&item, event).await {
                Ok(stats) => print_statistics(&stats),
                // A failed statistics write never blocks listening
                Err(e) => warn!("Could not record play of {item}: {e}"),
            }
        }
        Command::Rate { item, rating } => {
            let stats = core.record_rating(&item, rating).await?;
            print_statistics(&stats);
        }
        Command::Favorite { item } => {
            if core.toggle_favorite(&item).await? {
                println!("{item} is now a favorite");
            } else {
                println!("{item} is no longer a favorite");
            }
        }
        Command::Recent { limit } => {
            for stats in core.get_recently_played(limit).await? {
                print_statistics(&stats);
            }
        }
        Command::Top { limit } => {
            for stats in core.get_top_items(limit).await? {
                print_statistics(&stats);
            }
        }
        Command::Library { action } => match action {
            LibraryAction::Add {
                id,
                title,
                artist,
                album,
                duration,
                path,
                genre,
            } => {
                db.upsert_track(LocalTrackFields {
                    id: id.clone(),
                    title,
                    artist,
                    album,
                    duration_sec: duration,
                    path,
                    genre,
                })
                .await
                .with_context(|| format!("Failed to add {id} to the library"))?;
                info!("Library now holds {} items", db.track_count().await?);
                println!("Added {id}");
            }
            LibraryAction::Remove { id } => {
                if core.remove_item(&id).await? {
                    println!("Removed {id}");
                } else {
                    println!("{id} is not in the library");
                }
            }
        },
        Command::History { action } => match action {
            HistoryAction::Clear => {
                let removed = core.clear_history().await?;
                println!("Removed {removed} history entries");
            }
        },
        Command::Prefs(overrides) => {
            let current = core.preferences().await;
            if overrides.is_empty() {
                print!("{}", toml::to_string_pretty(&current)?);
            } else {
                let updated = overrides.apply(current);
                let rescored = core.update_preferences(updated.clone()).await?;
                print!("{}", toml::to_string_pretty(&updated)?);
                println!("Rescored {rescored} items");
            }
        }
        Command::Completion { .. } => {}
    }
    Ok(())
}

fn print_session(session: &SearchSession) {
    match (session.status, session.served_from) {
        (SessionStatus::UnavailableOffline, _) => {
            println!("Offline and nothing cached for this query; showing local results only");
        }
        (_, ServedFrom::Cache) => {
            let age = session
                .cached_at
                .map(|at| format!(" from {}", at.format("%Y-%m-%d %H:%M")))
                .unwrap_or_default();
            println!("Remote search {} - showing cached results{age}", session.mode);
        }
        (SessionStatus::RemoteFailed, _) => {
            println!("Remote search failed - showing local results only");
        }
        _ => {}
    }
    if let Some(error) = &session.error {
        debug!("Search reported: {error}");
    }
    if session.results.is_empty() {
        println!("No results");
        return;
    }
    for (i, result) in session.results.iter().enumerate() {
        print_result(i + 1, result);
    }
}

fn print_result(position: usize, result: &UnifiedResult) {
    let album = result.album().map(|a| format!(" [{a}]")).unwrap_or_default();
    let score = result
        .personal_score()
        .filter(|s| *s > 0.0)
        .map(|s| format!("  ♥ {s:.2}"))
        .unwrap_or_default();
    println!(
        "{position:>3}. {:<6} {} - {}{album}{score}",
        result.source(),
        result.artist(),
        result.title()
    );
    match (result.local_item_id(), result.external_url()) {
        (Some(id), _) => println!("       id: {id}"),
        (None, Some(url)) => println!("       {url}"),
        (None, None) => {}
    }
}

fn print_statistics(stats: &TrackStatistics) {
    let rating = stats.rating.map(|r| "★".repeat(usize::from(r))).unwrap_or_default();
    let favorite = if stats.favorite { " ♥" } else { "" };
    let last = stats
        .last_played_at
        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "{:<24} score {:>6.3}  plays {:>4}  skips {:>4}  avg {:>5.1}%  last {last} {rating}{favorite}",
        stats.item_id, stats.personal_score, stats.play_count, stats.skip_count, stats.avg_play_percentage
    );
}
