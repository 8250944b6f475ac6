use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    // Commit as soon as this many records are pending
    #[envconfig(default = "1000")]
    pub commit_batch_size: usize,

    // ...or at least this often
    #[envconfig(default = "5000")]
    pub commit_interval_ms: u64,

    #[envconfig(default = "1024")]
    pub record_buffer_size: usize,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        ConsumerConfig::set_defaults("offset-committer", "events");
        Self::init_from_env()
    }

    pub fn commit_interval(&self) -> Duration {
        Duration::from_millis(self.commit_interval_ms)
    }
}
