use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use rdkafka::topic_partition_list::TopicPartitionListElem;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// How far consumption has progressed in one partition.
///
/// `offset` follows the Kafka commit convention: it is the next offset to
/// consume, i.e. the last processed offset + 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    offset: i64,
    metadata: Option<String>,
}

impl Position {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: None,
        }
    }

    pub fn with_metadata(offset: i64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: Some(metadata.into()),
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }
}

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Identity of one logical consumer session.
///
/// Commit executors sharing a `SessionId` commit through the same consumer,
/// so batches built from their records may be committed together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    group_id: String,
    session: u64,
}

impl SessionId {
    /// Allocate a fresh, process-unique session for the given consumer group
    pub fn next(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            session: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn session(&self) -> u64 {
        self.session
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.group_id, self.session)
    }
}
