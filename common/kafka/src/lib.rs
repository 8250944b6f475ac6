pub mod batch_committer;
pub mod config;
pub mod exclusive_handle;
pub mod kafka_consumer;
pub mod metrics_consts;
pub mod offsets;
pub mod test;
pub mod types;

pub use batch_committer::BatchCommitter;
pub use exclusive_handle::{BlockingHandle, ExclusiveHandle, ExclusiveHandleSettings, HandleError};
pub use kafka_consumer::{KafkaCommitter, KafkaSession};
pub use offsets::{CommitError, CommitOffsets, OffsetBatch, OffsetRecord};
pub use types::{Partition, Position, SessionId};
