use async_trait::async_trait;
use common_crypto::CryptoMaterial;
use std::path::Path;
use std::time::Duration;

use crate::model::{AuditError, AuditResult};

/// Broker settings shared by every session. Built once; tenants only add
/// their own TLS material on top.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    pub message_timeout: Duration,
    pub flush_timeout: Duration,
    /// Every session build fetches cluster metadata once, bounded by this, to
    /// prove the broker is reachable and the TLS handshake succeeds.
    pub connect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let message_timeout = Duration::from_secs(5);
        Self {
            bootstrap_servers: "localhost:9092".into(),
            client_id: "KafkaServing".into(),
            message_timeout,
            flush_timeout: Duration::from_secs(5),
            connect_timeout: message_timeout,
        }
    }
}

/// Opens an authenticated publishing session for one tenant.
#[async_trait]
pub trait SessionBuilder: Send + Sync {
    async fn build(&self, tenant: &str, material: &CryptoMaterial) -> AuditResult<Box<dyn PublishSession>>;
}

/// A short-lived producer bound to one tenant's material.
#[async_trait]
pub trait PublishSession: Send {
    /// Hand a value to the client without waiting for the broker.
    fn publish(&mut self, topic: &str, key: &str, payload: &[u8]) -> AuditResult<()>;

    /// Flush outstanding sends (bounded) and tear the session down.
    async fn close(&mut self);
}

/// Fail fast when any of the material files cannot be opened.
pub async fn ensure_material_readable(material: &CryptoMaterial) -> AuditResult<()> {
    for path in [
        material.key_path(),
        material.certificate_path(),
        material.trust_store_path(),
    ] {
        check_readable(path).await?;
    }
    Ok(())
}

async fn check_readable(path: &Path) -> AuditResult<()> {
    match tokio::fs::File::open(path).await {
        Ok(_) => Ok(()),
        Err(err) => Err(AuditError::SessionBuild(format!(
            "unreadable material {}: {err}",
            path.display()
        ))),
    }
}

#[cfg(any(feature = "kafka", feature = "kafka-producer"))]
pub use kafka::{KafkaPublishSession, KafkaSessionBuilder};

#[cfg(any(feature = "kafka", feature = "kafka-producer"))]
mod kafka {
    use super::*;
    use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
    use rdkafka::ClientConfig;
    use tracing::{debug, warn};

    /// Builds mutual-TLS rdkafka producers. Plaintext is never configured.
    #[derive(Debug, Clone)]
    pub struct KafkaSessionBuilder {
        config: SessionConfig,
    }

    impl KafkaSessionBuilder {
        pub fn new(config: SessionConfig) -> Self {
            Self { config }
        }

        /// A fresh client config per build; `self.config` is never mutated.
        pub fn client_config(&self, material: &CryptoMaterial) -> ClientConfig {
            let mut client = ClientConfig::new();
            client
                .set("bootstrap.servers", &self.config.bootstrap_servers)
                .set("client.id", &self.config.client_id)
                .set("message.timeout.ms", self.config.message_timeout.as_millis().to_string())
                .set("security.protocol", "ssl")
                .set("ssl.key.location", material.key_path().to_string_lossy().into_owned())
                .set("ssl.key.password", material.passphrase())
                .set(
                    "ssl.certificate.location",
                    material.certificate_path().to_string_lossy().into_owned(),
                )
                .set("ssl.ca.location", material.trust_store_path().to_string_lossy().into_owned());
            client
        }
    }

    #[async_trait]
    impl SessionBuilder for KafkaSessionBuilder {
        async fn build(&self, tenant: &str, material: &CryptoMaterial) -> AuditResult<Box<dyn PublishSession>> {
            ensure_material_readable(material).await?;
            let producer: FutureProducer = self
                .client_config(material)
                .create()
                .map_err(|e| AuditError::SessionBuild(e.to_string()))?;
            // create() is lazy; without this a dead broker only surfaces at publish.
            let client = producer.clone();
            let timeout = self.config.connect_timeout;
            tokio::task::spawn_blocking(move || client.client().fetch_metadata(None, timeout).map(|_| ()))
                .await
                .map_err(|e| AuditError::SessionBuild(e.to_string()))?
                .map_err(|e| AuditError::SessionBuild(format!("broker unreachable: {e}")))?;
            debug!(tenant, client_id = %self.config.client_id, "publish session ready");
            Ok(Box::new(KafkaPublishSession {
                producer: Some(producer),
                flush_timeout: self.config.flush_timeout,
                tenant: tenant.to_string(),
            }))
        }
    }

    pub struct KafkaPublishSession {
        producer: Option<FutureProducer>,
        flush_timeout: Duration,
        tenant: String,
    }

    #[async_trait]
    impl PublishSession for KafkaPublishSession {
        fn publish(&mut self, topic: &str, key: &str, payload: &[u8]) -> AuditResult<()> {
            let producer = self
                .producer
                .as_ref()
                .ok_or_else(|| AuditError::Publish("session already closed".into()))?;
            let record = FutureRecord::to(topic).key(key).payload(payload);
            let delivery = producer
                .send_result(record)
                .map_err(|(e, _)| AuditError::Publish(e.to_string()))?;
            let topic = topic.to_string();
            let tenant = self.tenant.clone();
            // Delivery reports are observed, never awaited by the caller.
            tokio::spawn(async move {
                match delivery.await {
                    Ok(Ok(_)) => {}
                    Ok(Err((err, _))) => warn!(tenant = %tenant, topic = %topic, error = %err, "inference log delivery failed"),
                    Err(_) => warn!(tenant = %tenant, topic = %topic, "inference log delivery report dropped"),
                }
            });
            Ok(())
        }

        async fn close(&mut self) {
            let Some(producer) = self.producer.take() else { return };
            let timeout = self.flush_timeout;
            // librdkafka flush and destroy both block.
            let flushed = tokio::task::spawn_blocking(move || {
                let result = producer.flush(timeout);
                drop(producer);
                result
            })
            .await;
            match flushed {
                Ok(Ok(())) => debug!(tenant = %self.tenant, "publish session closed"),
                Ok(Err(err)) => warn!(tenant = %self.tenant, error = %err, "flush before close failed"),
                Err(err) => warn!(tenant = %self.tenant, error = %err, "flush task failed"),
            }
        }
    }
}
