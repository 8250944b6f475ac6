use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use common_kafka::config::ConsumerSettings;
use common_kafka::{BatchCommitter, HandleError, KafkaSession};
use rdkafka::Message;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;

/// Consumes a topic and commits the group's progress in batches.
pub struct OffsetCommitterService {
    settings: ConsumerSettings,
    poll_timeout: Duration,
    batch_size: usize,
    commit_interval: Duration,
    record_buffer_size: usize,
}

impl OffsetCommitterService {
    pub fn new(config: &Config) -> Self {
        Self::with_settings(
            ConsumerSettings::from_config(&config.kafka, &config.consumer),
            config,
        )
    }

    pub fn with_settings(settings: ConsumerSettings, config: &Config) -> Self {
        Self {
            settings,
            poll_timeout: config.consumer.poll_timeout(),
            batch_size: config.commit_batch_size,
            commit_interval: config.commit_interval(),
            record_buffer_size: config.record_buffer_size.max(1),
        }
    }

    /// Run until `shutdown` flips to true (or its sender goes away), then
    /// commit whatever progress is pending and close the consumer.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let session = KafkaSession::connect(&self.settings)
            .await
            .context("Failed to create Kafka consumer")?;

        let (records_tx, records_rx) = mpsc::channel(self.record_buffer_size);
        // Stopping is signalled by dropping the record sender, so the
        // committer sees every forwarded record before its final commit.
        let (_commit_shutdown_tx, commit_shutdown_rx) = oneshot::channel();
        let committer = tokio::spawn(
            BatchCommitter::new(self.batch_size, self.commit_interval)
                .run(records_rx, commit_shutdown_rx),
        );

        let consumed = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("Shutdown sender dropped, stopping consumer");
                        break Ok(());
                    }
                }

                polled = session.poll(self.poll_timeout) => match polled {
                    Ok(Some((message, record))) => {
                        debug!(
                            topic = message.topic(),
                            partition = message.partition(),
                            offset = message.offset(),
                            "Consumed message"
                        );
                        if records_tx.send(record).await.is_err() {
                            break Err(anyhow!("Batch committer stopped unexpectedly"));
                        }
                    }
                    Ok(None) => {}
                    // Transient broker errors are reported through poll and
                    // retried by librdkafka itself
                    Err(HandleError::Operation(e)) => {
                        warn!("Kafka consumer error: {e}");
                    }
                    Err(e) => break Err(e).context("Kafka consumer failed"),
                }
            }
        };

        drop(records_tx);
        let committed = match committer.await {
            Ok(result) => result.context("Failed to commit offsets"),
            Err(e) => Err(e).context("Batch committer task failed"),
        };

        if let Err(e) = session.close().await {
            error!("Failed to close Kafka consumer: {e}");
        }

        consumed?;
        committed?;
        info!("Offset committer stopped");
        Ok(())
    }
}
