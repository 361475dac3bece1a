//! Stream client facade
//!
//! Validates configuration, connects the selected backend once and hands
//! out producers and consumers that share it.

use std::sync::Arc;

use tracing::info;

use crate::backend::{self, StreamBackend};
use crate::config::Config;
use crate::consumer::{Consumer, ConsumerOptions};
use crate::error::Result;
use crate::producer::{Producer, ProducerRegistry};

/// Entry point for publishing and consuming.
pub struct StreamClient {
    config: Config,
    backend: Arc<dyn StreamBackend>,
    producers: ProducerRegistry,
}

impl StreamClient {
    /// Validate `config` and connect the backend it names.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        let backend = backend::connect(config.connection()?).await?;
        Ok(Self::with_backend(config, backend))
    }

    /// Build a client around an already connected backend.
    pub fn with_backend(config: Config, backend: Arc<dyn StreamBackend>) -> Self {
        let producers = ProducerRegistry::from_config(Arc::clone(&backend), &config.streams);
        if !producers.is_empty() {
            info!(
                count = producers.len(),
                driver = backend.name(),
                "registered custom stream producers"
            );
        }
        Self {
            config,
            backend,
            producers,
        }
    }

    /// The configuration this client was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared backend handle.
    pub fn backend(&self) -> Arc<dyn StreamBackend> {
        Arc::clone(&self.backend)
    }

    /// Producer for the default stream.
    pub fn producer(&self) -> Producer {
        self.producer_for(&self.config.streams.stream)
    }

    /// Producer for an arbitrary stream, using the configured trimming policy.
    pub fn producer_for(&self, stream: &str) -> Producer {
        Producer::from_config(Arc::clone(&self.backend), stream, &self.config.streams)
    }

    /// Producer for a named custom stream (`stream_<name>`).
    pub fn custom_producer(&self, name: &str) -> Option<&Producer> {
        self.producers.get(name)
    }

    /// All custom stream producers.
    pub fn producers(&self) -> &ProducerRegistry {
        &self.producers
    }

    /// Consumer with the configured identifiers and tuning.
    pub fn consumer(&self) -> Consumer {
        self.consumer_with(ConsumerOptions::from_config(&self.config.streams))
    }

    /// Consumer with explicit options.
    pub fn consumer_with(&self, options: ConsumerOptions) -> Consumer {
        Consumer::new(Arc::clone(&self.backend), options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryBackend;
    use crate::error::StreamError;

    #[tokio::test]
    async fn test_connect_validates_first() {
        let config = Config::parse_str("[streams]\nbatch_size = 0\n").unwrap();
        assert!(matches!(
            StreamClient::connect(config).await,
            Err(StreamError::Configuration(_))
        ));
    }

    #[test]
    fn test_producers_follow_config() {
        let config = Config::parse_str(
            "[streams]\nstream = \"orders\"\nmax_length = 50\nuse_exact_maxlen = true\nstream_audit = \"audit\"\n",
        )
        .unwrap();
        let client = StreamClient::with_backend(config, Arc::new(MemoryBackend::new()));

        let producer = client.producer();
        assert_eq!(producer.stream(), "orders");
        assert_eq!(producer.max_len(), Some(crate::types::MaxLen::exact(50)));
        assert_eq!(client.custom_producer("audit").unwrap().stream(), "audit");
        assert_eq!(client.producers().len(), 1);
        assert_eq!(client.consumer().options().stream, "orders");
    }
}
