//! Committable consumer progress.
//!
//! An [`OffsetRecord`] is the progress made by consuming one message. Records
//! fold into an [`OffsetBatch`] as they move through downstream stages, and the
//! batch is committed once, through the commit executor of the consumer session
//! the records came from. Folding is pure data; only `commit` talks to Kafka.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use thiserror::Error;
use tracing::{debug, warn};

use crate::metrics_consts::{
    OFFSET_COMMITS, OFFSET_COMMITTED_PARTITIONS, OFFSET_COMMIT_DURATION_MS,
};
use crate::types::{Partition, Position, SessionId};

#[derive(Debug, Error)]
pub enum CommitError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer handle unavailable: {0}")]
    Handle(String),
    #[error("Offsets span multiple consumer sessions: {0:?}")]
    MixedSessions(Vec<SessionId>),
    #[error("Commit rejected: {0}")]
    Rejected(String),
}

/// Performs the actual offset commit for one consumer session.
#[async_trait]
pub trait CommitOffsets: Send + Sync {
    /// The session whose consumer this executor commits through
    fn session(&self) -> &SessionId;

    async fn commit(&self, offsets: HashMap<Partition, Position>) -> Result<(), CommitError>;
}

async fn commit_through(
    committer: &dyn CommitOffsets,
    offsets: HashMap<Partition, Position>,
) -> Result<(), CommitError> {
    let partitions = offsets.len();
    let start = Instant::now();
    let result = committer.commit(offsets).await;
    metrics::histogram!(OFFSET_COMMIT_DURATION_MS).record(start.elapsed().as_millis() as f64);

    match &result {
        Ok(()) => {
            metrics::counter!(OFFSET_COMMITS, "outcome" => "success").increment(1);
            metrics::counter!(OFFSET_COMMITTED_PARTITIONS).increment(partitions as u64);
            debug!(
                session = %committer.session(),
                partitions = partitions,
                "Committed offsets"
            );
        }
        Err(e) => {
            metrics::counter!(OFFSET_COMMITS, "outcome" => "failure").increment(1);
            warn!(
                session = %committer.session(),
                partitions = partitions,
                "Failed to commit offsets: {e}"
            );
        }
    }
    result
}

/// Progress for a single partition, committable on its own or as part of a batch
#[derive(Clone)]
pub struct OffsetRecord {
    partition: Partition,
    position: Position,
    committer: Arc<dyn CommitOffsets>,
}

impl OffsetRecord {
    pub fn new(partition: Partition, position: Position, committer: Arc<dyn CommitOffsets>) -> Self {
        Self {
            partition,
            position,
            committer,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn session(&self) -> &SessionId {
        self.committer.session()
    }

    pub fn as_mapping(&self) -> HashMap<Partition, Position> {
        HashMap::from([(self.partition.clone(), self.position.clone())])
    }

    pub fn as_batch(&self) -> OffsetBatch {
        OffsetBatch::from_parts(self.as_mapping(), self.committer.clone())
    }

    pub async fn commit(&self) -> Result<(), CommitError> {
        commit_through(self.committer.as_ref(), self.as_mapping()).await
    }
}

impl fmt::Debug for OffsetRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetRecord")
            .field("partition", &self.partition)
            .field("position", &self.position)
            .field("session", self.committer.session())
            .finish()
    }
}

/// Progress for any number of partitions, committed together.
///
/// Merging is last-writer-wins per partition: callers merge in progress order,
/// oldest first. A batch that picked up records from more than one consumer
/// session refuses to commit rather than committing everything through one
/// arbitrary session's consumer.
#[derive(Clone, Default)]
pub struct OffsetBatch {
    offsets: HashMap<Partition, Position>,
    committer: Option<Arc<dyn CommitOffsets>>,
    sessions: BTreeSet<SessionId>,
}

impl OffsetBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_parts(
        offsets: HashMap<Partition, Position>,
        committer: Arc<dyn CommitOffsets>,
    ) -> Self {
        let sessions = BTreeSet::from([committer.session().clone()]);
        Self {
            offsets,
            committer: Some(committer),
            sessions,
        }
    }

    /// Combine with newer progress; `other` wins for partitions present in both
    pub fn merge(mut self, other: OffsetBatch) -> OffsetBatch {
        self.offsets.extend(other.offsets);
        if other.committer.is_some() {
            self.committer = other.committer;
        }
        self.sessions.extend(other.sessions);
        self
    }

    pub fn add(self, record: &OffsetRecord) -> OffsetBatch {
        self.merge(record.as_batch())
    }

    pub fn offsets(&self) -> &HashMap<Partition, Position> {
        &self.offsets
    }

    pub fn get(&self, partition: &Partition) -> Option<&Position> {
        self.offsets.get(partition)
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionId> {
        self.sessions.iter()
    }

    /// Commit every partition in the batch.
    ///
    /// The batch is left untouched, so a failed commit can simply be retried,
    /// or merged with newer progress first.
    pub async fn commit(&self) -> Result<(), CommitError> {
        if self.offsets.is_empty() {
            return Ok(());
        }
        if self.sessions.len() > 1 {
            let sessions: Vec<SessionId> = self.sessions.iter().cloned().collect();
            warn!(sessions = ?sessions, "Refusing to commit offsets spanning multiple sessions");
            metrics::counter!(OFFSET_COMMITS, "outcome" => "mixed_sessions").increment(1);
            return Err(CommitError::MixedSessions(sessions));
        }
        let Some(committer) = &self.committer else {
            return Ok(());
        };
        commit_through(committer.as_ref(), self.offsets.clone()).await
    }
}

impl fmt::Debug for OffsetBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetBatch")
            .field("offsets", &self.offsets)
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl Extend<OffsetRecord> for OffsetBatch {
    fn extend<I: IntoIterator<Item = OffsetRecord>>(&mut self, records: I) {
        for OffsetRecord {
            partition,
            position,
            committer,
        } in records
        {
            self.offsets.insert(partition, position);
            self.sessions.insert(committer.session().clone());
            self.committer = Some(committer);
        }
    }
}

impl FromIterator<OffsetRecord> for OffsetBatch {
    fn from_iter<I: IntoIterator<Item = OffsetRecord>>(records: I) -> Self {
        let mut batch = OffsetBatch::empty();
        batch.extend(records);
        batch
    }
}
