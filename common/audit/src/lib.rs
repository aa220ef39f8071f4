//! Inference audit logging: records every request/response pair a serving
//! handles onto the tenant's topic without blocking or failing the serving path.

pub mod codec;
pub mod logger;
pub mod model;
pub mod producer;

pub use codec::{CodecError, RecordCodec, RecordEncoder, INFERENCE_LOG_SCHEMA};
pub use logger::{AuditLogger, Dispatch, DispatchConfig, InferenceLogPipeline, LogOutcome};
pub use model::{AuditError, AuditResult, InferenceAuditRecord, InferenceEvent, LogStage, TenantPublishTarget};
pub use producer::{ensure_material_readable, PublishSession, SessionBuilder, SessionConfig};
#[cfg(any(feature = "kafka", feature = "kafka-producer"))]
pub use producer::{KafkaPublishSession, KafkaSessionBuilder};
