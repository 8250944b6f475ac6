use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::metrics_consts::{BATCH_COMMITTER_FLUSHES, BATCH_COMMITTER_PENDING_RECORDS};
use crate::offsets::{CommitError, OffsetBatch, OffsetRecord};

pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Folds records into a batch and commits it every `batch_size` records or
/// every `interval`, whichever comes first.
pub struct BatchCommitter {
    batch_size: usize,
    interval: Duration,
}

struct Pending {
    batch: OffsetBatch,
    records: usize,
    // Set after a failed commit; only the interval retries until one succeeds
    backing_off: bool,
}

impl Pending {
    fn new() -> Self {
        Self {
            batch: OffsetBatch::empty(),
            records: 0,
            backing_off: false,
        }
    }

    fn push(&mut self, record: &OffsetRecord) {
        let batch = std::mem::take(&mut self.batch);
        self.batch = batch.add(record);
        self.records += 1;
        metrics::gauge!(BATCH_COMMITTER_PENDING_RECORDS).set(self.records as f64);
    }

    /// Commit the pending batch. On success start over; on a retryable
    /// failure keep it so newer progress can be merged in before the next try.
    async fn flush(&mut self, trigger: &'static str) -> Result<(), CommitError> {
        metrics::counter!(BATCH_COMMITTER_FLUSHES, "trigger" => trigger).increment(1);

        match self.batch.commit().await {
            Ok(()) => {
                *self = Pending::new();
                metrics::gauge!(BATCH_COMMITTER_PENDING_RECORDS).set(0.0);
                Ok(())
            }
            Err(e @ CommitError::MixedSessions(_)) => Err(e),
            Err(e) => {
                warn!(
                    trigger = trigger,
                    partitions = self.batch.len(),
                    "Offset commit failed, retrying on next interval: {e}"
                );
                self.backing_off = true;
                Ok(())
            }
        }
    }
}

impl BatchCommitter {
    /// A zero `interval` falls back to [`DEFAULT_COMMIT_INTERVAL`]
    pub fn new(batch_size: usize, interval: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            interval: if interval.is_zero() {
                DEFAULT_COMMIT_INTERVAL
            } else {
                interval
            },
        }
    }

    /// Commit records from `records` until shutdown or until every sender is gone,
    /// then commit whatever is still pending.
    ///
    /// Only a batch that can never be committed (records from several sessions)
    /// stops the loop early.
    pub async fn run(
        self,
        mut records: mpsc::Receiver<OffsetRecord>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), CommitError> {
        info!(
            batch_size = self.batch_size,
            interval_ms = self.interval.as_millis() as u64,
            "Starting batch offset committer"
        );

        let mut pending = Pending::new();
        let mut commit_interval = tokio::time::interval(self.interval);
        commit_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        commit_interval.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received, committing pending offsets");
                    // Fold in everything already handed to us
                    records.close();
                    while let Some(record) = records.recv().await {
                        pending.push(&record);
                    }
                    break;
                }

                record = records.recv() => {
                    let Some(record) = record else {
                        info!("All record senders dropped, committing pending offsets");
                        break;
                    };
                    pending.push(&record);
                    if pending.records >= self.batch_size && !pending.backing_off {
                        pending.flush("size").await?;
                    }
                }

                _ = commit_interval.tick() => {
                    if !pending.batch.is_empty() {
                        pending.flush("interval").await?;
                    }
                }
            }
        }

        if pending.batch.is_empty() {
            return Ok(());
        }
        metrics::counter!(BATCH_COMMITTER_FLUSHES, "trigger" => "shutdown").increment(1);
        if let Err(e) = pending.batch.commit().await {
            error!("Failed to commit final offsets: {e}");
            return Err(e);
        }
        info!(partitions = pending.batch.len(), "Final offsets committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::RecordingCommitter;
    use crate::types::{Partition, Position};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use tokio::time::Instant;

    async fn wait_for_commits(committer: &Arc<RecordingCommitter>, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while committer.commits().len() < count {
            assert!(Instant::now() < deadline, "timed out waiting for commits");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn spawn_committer(
        batch_size: usize,
        interval: Duration,
    ) -> (
        mpsc::Sender<OffsetRecord>,
        oneshot::Sender<()>,
        tokio::task::JoinHandle<Result<(), CommitError>>,
    ) {
        let (records_tx, records_rx) = mpsc::channel(100);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(BatchCommitter::new(batch_size, interval).run(records_rx, shutdown_rx));
        (records_tx, shutdown_tx, handle)
    }

    #[tokio::test]
    async fn test_commits_when_batch_is_full() {
        let committer = RecordingCommitter::new("group");
        let (records_tx, _shutdown_tx, handle) = spawn_committer(3, Duration::from_secs(3600));

        for (partition, offset) in [(0, 1), (1, 4), (0, 2)] {
            records_tx
                .send(committer.record("events", partition, offset))
                .await
                .unwrap();
        }
        wait_for_commits(&committer, 1).await;

        drop(records_tx);
        handle.await.unwrap().unwrap();

        assert_eq!(
            committer.commits(),
            vec![HashMap::from([
                (Partition::new("events", 0), Position::new(2)),
                (Partition::new("events", 1), Position::new(4)),
            ])]
        );
    }

    #[tokio::test]
    async fn test_commits_on_interval() {
        let committer = RecordingCommitter::new("group");
        let (records_tx, _shutdown_tx, handle) = spawn_committer(100, Duration::from_millis(50));

        records_tx
            .send(committer.record("events", 0, 10))
            .await
            .unwrap();
        wait_for_commits(&committer, 1).await;

        drop(records_tx);
        handle.await.unwrap().unwrap();
        assert_eq!(committer.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_final_commit_on_shutdown() {
        let committer = RecordingCommitter::new("group");
        let (records_tx, shutdown_tx, handle) = spawn_committer(100, Duration::from_secs(3600));

        records_tx
            .send(committer.record("events", 0, 3))
            .await
            .unwrap();
        records_tx
            .send(committer.record("events", 2, 8))
            .await
            .unwrap();
        // Let the committer drain the channel before signalling shutdown
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert!(committer.commits().is_empty());

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(
            committer.commits(),
            vec![HashMap::from([
                (Partition::new("events", 0), Position::new(3)),
                (Partition::new("events", 2), Position::new(8)),
            ])]
        );
    }

    #[tokio::test]
    async fn test_failed_commit_is_retried_with_newer_progress() {
        let committer = RecordingCommitter::new("group");
        committer.failures_left.store(1, Ordering::SeqCst);
        let (records_tx, _shutdown_tx, handle) = spawn_committer(1, Duration::from_millis(300));

        records_tx
            .send(committer.record("events", 0, 1))
            .await
            .unwrap();
        wait_for_commits(&committer, 1).await;
        records_tx
            .send(committer.record("events", 1, 7))
            .await
            .unwrap();
        records_tx
            .send(committer.record("events", 1, 8))
            .await
            .unwrap();
        // A full batch does not retry right away after a failure
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(committer.commits().len(), 1);

        wait_for_commits(&committer, 2).await;

        drop(records_tx);
        handle.await.unwrap().unwrap();

        let commits = committer.commits();
        assert_eq!(commits.len(), 2);
        assert_eq!(
            commits[0],
            HashMap::from([(Partition::new("events", 0), Position::new(1))])
        );
        assert_eq!(
            commits[1],
            HashMap::from([
                (Partition::new("events", 0), Position::new(1)),
                (Partition::new("events", 1), Position::new(8)),
            ])
        );
    }

    #[tokio::test]
    async fn test_records_queued_before_shutdown_are_committed() {
        let committer = RecordingCommitter::new("group");
        let (records_tx, records_rx) = mpsc::channel(100);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        // Everything is queued before the committer ever runs
        records_tx
            .send(committer.record("events", 0, 4))
            .await
            .unwrap();
        records_tx
            .send(committer.record("events", 0, 5))
            .await
            .unwrap();
        shutdown_tx.send(()).unwrap();

        BatchCommitter::new(100, Duration::from_secs(3600))
            .run(records_rx, shutdown_rx)
            .await
            .unwrap();

        assert_eq!(
            committer.commits(),
            vec![HashMap::from([(Partition::new("events", 0), Position::new(5))])]
        );
    }

    #[tokio::test]
    async fn test_zero_interval_uses_default() {
        let committer = RecordingCommitter::new("group");
        let batch_committer = BatchCommitter::new(10, Duration::ZERO);
        assert_eq!(batch_committer.interval, DEFAULT_COMMIT_INTERVAL);

        let (records_tx, records_rx) = mpsc::channel(10);
        let (_shutdown_tx, shutdown_rx) = oneshot::channel();
        records_tx
            .send(committer.record("events", 3, 1))
            .await
            .unwrap();
        drop(records_tx);

        batch_committer.run(records_rx, shutdown_rx).await.unwrap();
        assert_eq!(committer.commits().len(), 1);
    }

    #[tokio::test]
    async fn test_mixed_sessions_stop_the_committer() {
        let first = RecordingCommitter::new("group");
        let second = RecordingCommitter::new("group");
        let (records_tx, _shutdown_tx, handle) = spawn_committer(2, Duration::from_secs(3600));

        records_tx.send(first.record("events", 0, 1)).await.unwrap();
        records_tx.send(second.record("events", 1, 1)).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CommitError::MixedSessions(_))));
        assert!(first.commits().is_empty());
        assert!(second.commits().is_empty());
    }
}
