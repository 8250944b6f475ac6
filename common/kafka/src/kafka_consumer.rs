use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::{
    consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, DefaultConsumerContext},
    error::KafkaError,
    message::OwnedMessage,
    Message, Offset, TopicPartitionList,
};
use tracing::{debug, info};

use crate::config::ConsumerSettings;
use crate::exclusive_handle::{
    BlockingHandle, ExclusiveHandle, ExclusiveHandleSettings, HandleError,
};
use crate::offsets::{CommitError, CommitOffsets, OffsetRecord};
use crate::types::{Partition, Position, SessionId};

// Upper bound for a single poll while draining events during close
const CLOSE_DRAIN_POLL: Duration = Duration::from_millis(100);

impl<C: ConsumerContext + 'static> BlockingHandle for BaseConsumer<C> {
    type Error = KafkaError;

    fn close(self, timeout: Duration) -> Result<(), KafkaError> {
        self.unsubscribe();

        // Serve the revocation triggered by leaving the group before the
        // consumer is dropped, which is what actually destroys it.
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.poll(remaining.min(CLOSE_DRAIN_POLL)) {
                None => break,
                Some(Err(e)) => return Err(e),
                Some(Ok(_)) => continue,
            }
        }
        Ok(())
    }
}

impl From<HandleError<KafkaError>> for CommitError {
    fn from(e: HandleError<KafkaError>) -> Self {
        match e {
            HandleError::Setup(e) | HandleError::Operation(e) | HandleError::Close(e) => {
                CommitError::Kafka(e)
            }
            other => CommitError::Handle(other.to_string()),
        }
    }
}

fn to_partition_list(
    offsets: &HashMap<Partition, Position>,
) -> Result<TopicPartitionList, KafkaError> {
    let mut list = TopicPartitionList::with_capacity(offsets.len());
    for (partition, position) in offsets {
        let mut elem = list.add_partition(partition.topic(), partition.partition_number());
        elem.set_offset(Offset::Offset(position.offset()))?;
        if let Some(metadata) = position.metadata() {
            elem.set_metadata(metadata);
        }
    }
    Ok(list)
}

/// Commits offsets through a shared, guarded consumer.
pub struct KafkaCommitter<C: ConsumerContext + 'static = DefaultConsumerContext> {
    consumer: ExclusiveHandle<BaseConsumer<C>>,
    session: SessionId,
}

#[async_trait]
impl<C: ConsumerContext + 'static> CommitOffsets for KafkaCommitter<C> {
    fn session(&self) -> &SessionId {
        &self.session
    }

    async fn commit(&self, offsets: HashMap<Partition, Position>) -> Result<(), CommitError> {
        let list = to_partition_list(&offsets)?;
        // Sync commit, so a successful return means the broker has the offsets
        self.consumer
            .with_handle(move |consumer| consumer.commit(&list, CommitMode::Sync))
            .await?;
        Ok(())
    }
}

/// One consumer session: a guarded `BaseConsumer` plus the commit executor
/// shared by every record it hands out.
pub struct KafkaSession<C: ConsumerContext + 'static = DefaultConsumerContext> {
    consumer: ExclusiveHandle<BaseConsumer<C>>,
    committer: Arc<KafkaCommitter<C>>,
}

impl KafkaSession<DefaultConsumerContext> {
    pub async fn connect(settings: &ConsumerSettings) -> Result<Self, HandleError<KafkaError>> {
        Self::connect_with_context(settings, DefaultConsumerContext).await
    }
}

impl<C: ConsumerContext + 'static> KafkaSession<C> {
    /// Create the consumer on the blocking pool and subscribe it to the
    /// configured topics, if any.
    pub async fn connect_with_context(
        settings: &ConsumerSettings,
        context: C,
    ) -> Result<Self, HandleError<KafkaError>> {
        let client_config = settings.client_config().clone();
        let topics = settings.topics().to_vec();

        let factory = move || -> Result<BaseConsumer<C>, KafkaError> {
            debug!("rdkafka configuration: {:?}", client_config);
            let consumer: BaseConsumer<C> = client_config.create_with_context(context)?;
            if !topics.is_empty() {
                let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
                consumer.subscribe(&topics)?;
            }
            Ok(consumer)
        };

        let mut handle_settings =
            ExclusiveHandleSettings::new(factory).with_close_timeout(settings.close_timeout());
        if let Some(runtime) = settings.blocking_runtime() {
            handle_settings = handle_settings.with_blocking_runtime(runtime.clone());
        }
        let consumer = ExclusiveHandle::new(handle_settings).await?;

        let session = Self::from_handle(consumer, settings.group_id());
        info!(
            session = %session.session(),
            topics = ?settings.topics(),
            "Kafka consumer session started"
        );
        Ok(session)
    }

    pub fn from_handle(consumer: ExclusiveHandle<BaseConsumer<C>>, group_id: &str) -> Self {
        let committer = Arc::new(KafkaCommitter {
            consumer: consumer.clone(),
            session: SessionId::next(group_id),
        });
        Self {
            consumer,
            committer,
        }
    }

    pub fn session(&self) -> &SessionId {
        &self.committer.session
    }

    pub fn committer(&self) -> Arc<KafkaCommitter<C>> {
        self.committer.clone()
    }

    pub fn handle(&self) -> &ExclusiveHandle<BaseConsumer<C>> {
        &self.consumer
    }

    /// The committable progress made by consuming `message`
    pub fn record_for<M: Message>(&self, message: &M) -> OffsetRecord {
        OffsetRecord::new(
            Partition::new(message.topic(), message.partition()),
            Position::new(message.offset() + 1),
            self.committer.clone(),
        )
    }

    /// Poll the consumer once, waiting at most `timeout` for a message.
    pub async fn poll(
        &self,
        timeout: Duration,
    ) -> Result<Option<(OwnedMessage, OffsetRecord)>, HandleError<KafkaError>> {
        let message = self
            .consumer
            .with_handle(move |consumer| {
                consumer
                    .poll(timeout)
                    .transpose()
                    .map(|message| message.map(|m| m.detach()))
            })
            .await?;

        Ok(message.map(|message| {
            let record = self.record_for(&message);
            (message, record)
        }))
    }

    /// Fetch the positions the group has committed for `partitions`.
    ///
    /// Partitions without a committed offset are left out.
    pub async fn committed(
        &self,
        partitions: Vec<Partition>,
        timeout: Duration,
    ) -> Result<HashMap<Partition, Position>, HandleError<KafkaError>> {
        self.consumer
            .with_handle(move |consumer| {
                let mut list = TopicPartitionList::with_capacity(partitions.len());
                for partition in &partitions {
                    list.add_partition(partition.topic(), partition.partition_number());
                }

                let committed = consumer.committed_offsets(list, timeout)?;
                let mut positions = HashMap::new();
                for elem in committed.elements() {
                    let Offset::Offset(offset) = elem.offset() else {
                        continue;
                    };
                    let position = match elem.metadata() {
                        "" => Position::new(offset),
                        metadata => Position::with_metadata(offset, metadata),
                    };
                    positions.insert(Partition::from(elem), position);
                }
                Ok(positions)
            })
            .await
    }

    pub async fn close(&self) -> Result<(), HandleError<KafkaError>> {
        info!(session = %self.session(), "Closing Kafka consumer session");
        self.consumer.close().await
    }
}
