use anyhow::{Context, Result};
use common_audit::{DispatchConfig, SessionConfig};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub principal: String,
    pub cert_tmp_dir: PathBuf,
    pub material_root: PathBuf,
    pub master_key_b64: String,
    pub session: SessionConfig,
    pub dispatch: DispatchConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let master_key_b64 = env::var("MATERIAL_MASTER_KEY").context("MATERIAL_MASTER_KEY must be set")?;
        let session_defaults = SessionConfig::default();
        let dispatch_defaults = DispatchConfig::default();

        let message_timeout = millis_var("KAFKA_MESSAGE_TIMEOUT_MS").unwrap_or(session_defaults.message_timeout);
        let session = SessionConfig {
            bootstrap_servers: env::var("KAFKA_BOOTSTRAP").unwrap_or(session_defaults.bootstrap_servers),
            client_id: env::var("KAFKA_CLIENT_ID").unwrap_or(session_defaults.client_id),
            message_timeout,
            flush_timeout: millis_var("KAFKA_FLUSH_TIMEOUT_MS").unwrap_or(session_defaults.flush_timeout),
            connect_timeout: millis_var("KAFKA_CONNECT_TIMEOUT_MS").unwrap_or(message_timeout),
        };
        let dispatch = DispatchConfig {
            queue_capacity: env::var("AUDIT_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(dispatch_defaults.queue_capacity)
                .max(1),
            max_in_flight: env::var("AUDIT_MAX_IN_FLIGHT")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(dispatch_defaults.max_in_flight)
                .max(1),
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8095),
            principal: env::var("SERVING_PRINCIPAL").unwrap_or_else(|_| "srvmanager".to_string()),
            cert_tmp_dir: env::var("CERT_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| env::temp_dir().join("inference-log-certs")),
            material_root: env::var("MATERIAL_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/srv/inference-log/material")),
            master_key_b64,
            session,
            dispatch,
        })
    }
}

fn millis_var(name: &str) -> Option<Duration> {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
