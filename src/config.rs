//! Process-wide configuration for the server and worker

use crate::broker::BrokerConfig;
use crate::client::ClientConfig;
use crate::error::{TaskError, TaskResult};
use crate::server::ServerConfig;
use crate::worker::WorkerConfig;

/// Everything one process needs to run the producer API and the worker pool
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub worker: WorkerConfig,
}

impl AppConfig {
    /// Defaults with the broker address, listen address and concurrency filled in
    pub fn new(broker_addr: &str, http_addr: &str, concurrency: usize) -> Self {
        let mut config = Self {
            broker: BrokerConfig::from_addr(broker_addr),
            ..Self::default()
        };
        config.server.addr = http_addr.to_string();
        config.worker.concurrency = concurrency;
        config
    }

    /// Use the given queues for the worker; the first also becomes the client's default
    pub fn with_queues(mut self, queues: Vec<String>) -> Self {
        if let Some(first) = queues.first() {
            self.client.default_queue = first.clone();
        }
        self.worker.queues = queues;
        self
    }

    pub fn validate(&self) -> TaskResult<()> {
        if self.server.addr.trim().is_empty() {
            return Err(TaskError::config("HTTP listen address cannot be empty"));
        }
        if self.client.default_queue.trim().is_empty() {
            return Err(TaskError::config("default queue cannot be empty"));
        }
        if !self.worker.queues.contains(&self.client.default_queue) {
            return Err(TaskError::config(format!(
                "worker does not consume the default queue {}",
                self.client.default_queue
            )));
        }
        self.worker.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::new("localhost:6379", "0.0.0.0:3000", 10);
        assert!(config.validate().is_ok());
        assert_eq!(config.broker.redis_url, "redis://localhost:6379");
        assert_eq!(config.worker.concurrency, 10);
        assert_eq!(config.client.default_queue, "default");
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let config = AppConfig::new("localhost:6379", "0.0.0.0:3000", 0);
        assert!(matches!(config.validate(), Err(TaskError::Config { .. })));
    }

    #[test]
    fn test_custom_queues() {
        let config =
            AppConfig::default().with_queues(vec!["critical".to_string(), "low".to_string()]);
        assert_eq!(config.client.default_queue, "critical");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_queue_must_be_consumed() {
        let mut config = AppConfig::default();
        config.client.default_queue = "elsewhere".to_string();
        assert!(config.validate().is_err());
    }
}
