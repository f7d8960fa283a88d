//! Write-coalescing queue for the search interaction log.
//!
//! Interactions are enqueued without blocking and written in batches by a
//! background task. A batch goes out once the debounce window after its first
//! entry elapses, once it reaches [`MAX_BATCH`] entries, on an explicit
//! [`InteractionWriteQueue::flush`], or when the task is cancelled.

use log::{debug, error, trace, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::model::SearchInteraction;
use crate::sources::StatisticsStore;

/// Entries buffered in the channel before `enqueue` starts dropping
const QUEUE_CAPACITY: usize = 4096;
/// Largest batch written in one transaction
pub const MAX_BATCH: usize = 256;

enum Command {
    Record(SearchInteraction),
    Flush(oneshot::Sender<Result<()>>),
}

/// Sending half of the queue; cheap to clone
#[derive(Clone, Debug)]
pub struct InteractionWriteQueue {
    tx: mpsc::Sender<Command>,
}

impl InteractionWriteQueue {
    /// Start the writer task. It runs until `cancel` fires, writing whatever
    /// is still pending before it exits.
    pub fn spawn(
        store: Arc<dyn StatisticsStore>,
        debounce: Duration,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(run_writer(store, rx, debounce, cancel));
        (Self { tx }, handle)
    }

    /// Queue one interaction. Never blocks; returns `false` when the entry
    /// was dropped because the queue is full or closed.
    pub fn enqueue(&self, interaction: SearchInteraction) -> bool {
        match self.tx.try_send(Command::Record(interaction)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Interaction queue full, dropping entry");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Interaction queue closed, dropping entry");
                false
            }
        }
    }

    /// Write everything queued so far and wait for the store to confirm
    pub async fn flush(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Flush(ack))
            .await
            .map_err(|_| CoreError::LocalStore("interaction queue closed".to_string()))?;
        done.await
            .map_err(|_| CoreError::LocalStore("interaction writer stopped".to_string()))?
    }
}

async fn write_batch(store: &dyn StatisticsStore, pending: &mut Vec<SearchInteraction>) -> Result<()> {
    if pending.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(pending);
    let count = batch.len();
    match store.append_interactions(batch).await {
        Ok(()) => {
            trace!("Wrote {count} interactions");
            Ok(())
        }
        Err(e) => {
            error!("Failed to write {count} interactions: {e}");
            Err(e)
        }
    }
}

async fn run_writer(
    store: Arc<dyn StatisticsStore>,
    mut rx: mpsc::Receiver<Command>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    let mut pending: Vec<SearchInteraction> = Vec::new();
    let mut flush_at: Option<Instant> = None;

    loop {
        let deadline = flush_at.unwrap_or_else(Instant::now);
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            command = rx.recv() => match command {
                Some(Command::Record(interaction)) => {
                    pending.push(interaction);
                    if pending.len() >= MAX_BATCH {
                        let _ = write_batch(store.as_ref(), &mut pending).await;
                        flush_at = None;
                    } else if flush_at.is_none() {
                        flush_at = Some(Instant::now() + debounce);
                    }
                }
                Some(Command::Flush(ack)) => {
                    let result = write_batch(store.as_ref(), &mut pending).await;
                    flush_at = None;
                    let _ = ack.send(result);
                }
                None => break,
            },
            () = tokio::time::sleep_until(deadline), if flush_at.is_some() => {
                let _ = write_batch(store.as_ref(), &mut pending).await;
                flush_at = None;
            }
        }
    }

    // Drain whatever was queued before shutdown; flushes are answered once
    // the final write is done
    rx.close();
    let mut acks = Vec::new();
    while let Ok(command) = rx.try_recv() {
        match command {
            Command::Record(interaction) => pending.push(interaction),
            Command::Flush(ack) => acks.push(ack),
        }
    }
    let remaining = pending.len();
    let written = write_batch(store.as_ref(), &mut pending).await;
    for ack in acks {
        let _ = ack.send(match &written {
            Ok(()) => Ok(()),
            Err(e) => Err(CoreError::LocalStore(e.to_string())),
        });
    }
    if written.is_ok() {
        debug!("Interaction writer stopped ({remaining} entries written on exit)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::model::{InteractionType, ResultSource, TrackStatistics};
    use chrono::Utc;
    use std::collections::HashMap;

    fn click(query: &str) -> SearchInteraction {
        SearchInteraction {
            query: query.to_string(),
            result_id: "1".to_string(),
            result_source: ResultSource::Remote,
            interaction_type: InteractionType::Click,
            at: Utc::now(),
            position: None,
            session_id: None,
        }
    }

    #[tokio::test]
    async fn test_flush_writes_pending_entries() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cancel = CancellationToken::new();
        let (queue, handle) =
            InteractionWriteQueue::spawn(db.clone(), Duration::from_secs(3600), cancel.clone());

        assert!(queue.enqueue(click("radiohead")));
        assert!(queue.enqueue(click("radiohead")));
        assert!(db.matching_queries("radio", 10).await.unwrap().is_empty(),
            "nothing written before the debounce window");

        queue.flush().await.unwrap();
        assert_eq!(db.matching_queries("radio", 10).await.unwrap(), vec!["radiohead"]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_writes_remaining_entries() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cancel = CancellationToken::new();
        let (queue, handle) =
            InteractionWriteQueue::spawn(db.clone(), Duration::from_secs(3600), cancel.clone());

        queue.enqueue(click("portishead"));
        // Let the writer pick the entry up before shutting down
        tokio::task::yield_now().await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(db.matching_queries("port", 10).await.unwrap(), vec!["portishead"]);
        assert!(!queue.enqueue(click("late")), "closed queue rejects new entries");
    }

    #[tokio::test]
    async fn test_flush_during_shutdown_waits_for_write() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cancel = CancellationToken::new();
        let (queue, handle) =
            InteractionWriteQueue::spawn(db.clone(), Duration::from_secs(3600), cancel.clone());

        queue.enqueue(click("portishead"));
        cancel.cancel();
        queue.flush().await.unwrap();
        assert_eq!(db.matching_queries("port", 10).await.unwrap(), vec!["portishead"]);
        handle.await.unwrap();
    }

    /// Rejects every write
    struct BrokenStore;

    fn broken<T>() -> Result<T> {
        Err(CoreError::LocalStore("disk full".to_string()))
    }

    #[async_trait::async_trait]
    impl StatisticsStore for BrokenStore {
        async fn load_statistics(&self, _: &str) -> Result<Option<TrackStatistics>> {
            broken()
        }
        async fn save_statistics(&self, _: TrackStatistics) -> Result<()> {
            broken()
        }
        async fn save_statistics_batch(&self, _: Vec<TrackStatistics>) -> Result<()> {
            broken()
        }
        async fn all_statistics(&self) -> Result<Vec<TrackStatistics>> {
            broken()
        }
        async fn scores(&self, _: Vec<String>) -> Result<HashMap<String, f64>> {
            broken()
        }
        async fn top_items(&self, _: usize) -> Result<Vec<TrackStatistics>> {
            broken()
        }
        async fn recently_played(&self, _: usize) -> Result<Vec<TrackStatistics>> {
            broken()
        }
        async fn delete_statistics(&self, _: &str) -> Result<bool> {
            broken()
        }
        async fn append_interactions(&self, _: Vec<SearchInteraction>) -> Result<()> {
            broken()
        }
        async fn matching_queries(&self, _: &str, _: usize) -> Result<Vec<String>> {
            broken()
        }
        async fn clear_interactions(&self) -> Result<usize> {
            broken()
        }
    }

    #[tokio::test]
    async fn test_failed_final_write_reaches_flush() {
        let cancel = CancellationToken::new();
        let (queue, handle) =
            InteractionWriteQueue::spawn(Arc::new(BrokenStore), Duration::from_secs(3600), cancel.clone());

        queue.enqueue(click("portishead"));
        cancel.cancel();
        let err = queue.flush().await.unwrap_err();
        assert!(matches!(err, CoreError::LocalStore(_)));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_debounce_window_triggers_write() {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let cancel = CancellationToken::new();
        let (queue, handle) =
            InteractionWriteQueue::spawn(db.clone(), Duration::from_millis(20), cancel.clone());

        queue.enqueue(click("massive attack"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(db.matching_queries("mass", 10).await.unwrap(), vec!["massive attack"]);

        cancel.cancel();
        handle.await.unwrap();
    }
}
