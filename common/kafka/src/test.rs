use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rdkafka::mocking::MockCluster;
use rdkafka::producer::{DefaultProducerContext, FutureProducer};
use rdkafka::ClientConfig;

use crate::config::ConsumerSettings;
use crate::offsets::{CommitError, CommitOffsets, OffsetRecord};
use crate::types::{Partition, Position, SessionId};

pub fn create_mock_kafka() -> (
    MockCluster<'static, DefaultProducerContext>,
    FutureProducer,
) {
    let cluster = MockCluster::new(1).expect("failed to create mock brokers");

    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", cluster.bootstrap_servers())
        .set("linger.ms", "0")
        .set("message.timeout.ms", "5000")
        .create()
        .expect("failed to create mocked kafka producer");

    (cluster, producer)
}

/// Consumer settings pointed at a mock cluster, tuned for fast group joins
pub fn mock_consumer_settings(
    cluster: &MockCluster<'static, DefaultProducerContext>,
    group_id: &str,
) -> ConsumerSettings {
    ConsumerSettings::new(&cluster.bootstrap_servers(), group_id)
        .with_offset_reset("earliest")
        .set("session.timeout.ms", "6000")
        .set("heartbeat.interval.ms", "500")
        .set("metadata.max.age.ms", "60000")
}

/// Commit executor that remembers every mapping it was asked to commit.
///
/// Set `failures_left` to make the next N commits fail.
pub struct RecordingCommitter {
    session: SessionId,
    commits: Mutex<Vec<HashMap<Partition, Position>>>,
    pub failures_left: AtomicUsize,
}

impl RecordingCommitter {
    pub fn new(group_id: &str) -> Arc<Self> {
        Arc::new(Self {
            session: SessionId::next(group_id),
            commits: Mutex::new(Vec::new()),
            failures_left: AtomicUsize::new(0),
        })
    }

    pub fn commits(&self) -> Vec<HashMap<Partition, Position>> {
        self.commits.lock().unwrap().clone()
    }

    pub fn record(self: &Arc<Self>, topic: &str, partition: i32, offset: i64) -> OffsetRecord {
        OffsetRecord::new(
            Partition::new(topic, partition),
            Position::new(offset),
            self.clone(),
        )
    }
}

#[async_trait]
impl CommitOffsets for RecordingCommitter {
    fn session(&self) -> &SessionId {
        &self.session
    }

    async fn commit(&self, offsets: HashMap<Partition, Position>) -> Result<(), CommitError> {
        self.commits.lock().unwrap().push(offsets);
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CommitError::Rejected("broker unavailable".to_string()));
        }
        Ok(())
    }
}
