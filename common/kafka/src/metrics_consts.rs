// ==== Exclusive handle metrics ====
/// Histogram for time spent waiting on the handle permit
pub const HANDLE_PERMIT_WAIT_MS: &str = "kafka_handle_permit_wait_ms";

/// Histogram for time spent running an action against the handle
pub const HANDLE_ACTION_DURATION_MS: &str = "kafka_handle_action_duration_ms";

/// Counter for actions that returned an error or panicked
pub const HANDLE_ACTION_FAILURES: &str = "kafka_handle_action_failures_total";

/// Counter for handle teardowns, labelled by outcome
pub const HANDLE_CLOSED: &str = "kafka_handle_closed_total";

// ==== Offset commit metrics ====
/// Counter for offset commit attempts, labelled by outcome
pub const OFFSET_COMMITS: &str = "kafka_offset_commits_total";

/// Counter for partitions included in successful commits
pub const OFFSET_COMMITTED_PARTITIONS: &str = "kafka_offset_committed_partitions_total";

/// Histogram for offset commit latency
pub const OFFSET_COMMIT_DURATION_MS: &str = "kafka_offset_commit_duration_ms";

/// Counter for batch committer flushes, labelled by trigger
pub const BATCH_COMMITTER_FLUSHES: &str = "kafka_batch_committer_flushes_total";

/// Gauge for records folded into the pending batch
pub const BATCH_COMMITTER_PENDING_RECORDS: &str = "kafka_batch_committer_pending_records";
