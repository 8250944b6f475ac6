use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;
use tokio::runtime::Handle as RuntimeHandle;

use crate::exclusive_handle::DEFAULT_CLOSE_TIMEOUT;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,
    pub kafka_consumer_topic: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    // How long teardown may take to leave the group and release the consumer
    #[envconfig(default = "20000")]
    pub kafka_consumer_close_timeout_ms: u64,

    #[envconfig(default = "1000")]
    pub kafka_consumer_poll_timeout_ms: u64,
}

impl ConsumerConfig {
    /// Because the consumer config is so application specific, we
    /// can't set good defaults in the derive macro, so we expose a way
    /// for users to set them here before init'ing their main config struct
    pub fn set_defaults(consumer_group: &str, consumer_topic: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
        if std::env::var("KAFKA_CONSUMER_TOPIC").is_err() {
            std::env::set_var("KAFKA_CONSUMER_TOPIC", consumer_topic);
        };
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_close_timeout_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.kafka_consumer_poll_timeout_ms)
    }
}

/// rdkafka settings for a consumer whose offsets are only ever committed explicitly.
#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    client_config: ClientConfig,
    group_id: String,
    topics: Vec<String>,
    close_timeout: Duration,
    blocking_runtime: Option<RuntimeHandle>,
}

impl ConsumerSettings {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            // Offsets are committed through OffsetBatch, never behind our back
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false");

        Self {
            client_config,
            group_id: group_id.to_string(),
            topics: Vec::new(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            blocking_runtime: None,
        }
    }

    pub fn from_config(common_config: &KafkaConfig, consumer_config: &ConsumerConfig) -> Self {
        Self::new(
            &common_config.kafka_hosts,
            &consumer_config.kafka_consumer_group,
        )
        .with_topic(&consumer_config.kafka_consumer_topic)
        .with_tls(common_config.kafka_tls)
        .with_offset_reset(&consumer_config.kafka_consumer_offset_reset)
        .with_close_timeout(consumer_config.close_timeout())
    }

    /// Subscribe to `topic` once the consumer is created
    pub fn with_topic(mut self, topic: &str) -> Self {
        self.topics.push(topic.to_string());
        self
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.client_config.set("auto.offset.reset", policy);
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Run consumer calls on this runtime's blocking pool
    pub fn with_blocking_runtime(mut self, runtime: RuntimeHandle) -> Self {
        self.blocking_runtime = Some(runtime);
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.client_config.set(key, value);
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    pub fn blocking_runtime(&self) -> Option<&RuntimeHandle> {
        self.blocking_runtime.as_ref()
    }

    pub fn client_config(&self) -> &ClientConfig {
        &self.client_config
    }
}
