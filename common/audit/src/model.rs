use common_crypto::MaterialError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::CodecError;

/// What the serving path knows about one inference when it asks for it to be logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceEvent {
    pub model_id: i32,
    pub model_name: String,
    pub model_version: i32,
    pub response_http_code: i32,
    pub inference_request: String,
    pub inference_response: String,
}

/// One logged inference, as published. Never mutated after [`InferenceAuditRecord::stamp`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceAuditRecord {
    pub model_id: i32,
    pub model_name: String,
    pub model_version: i32,
    pub request_timestamp_millis: i64,
    pub response_http_code: i32,
    pub inference_request: String,
    pub inference_response: String,
}

impl InferenceAuditRecord {
    pub fn stamp(event: InferenceEvent, request_timestamp_millis: i64) -> Self {
        Self {
            model_id: event.model_id,
            model_name: event.model_name,
            model_version: event.model_version,
            request_timestamp_millis,
            response_http_code: event.response_http_code,
            inference_request: event.inference_request,
            inference_response: event.inference_response,
        }
    }

    /// Partition key for the record.
    pub fn key(&self) -> String {
        self.model_id.to_string()
    }
}

/// Where a tenant's records go. No topic means the serving does not log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantPublishTarget {
    pub tenant_id: String,
    pub topic_name: Option<String>,
}

impl TenantPublishTarget {
    pub fn new(tenant_id: impl Into<String>, topic_name: Option<String>) -> Self {
        Self { tenant_id: tenant_id.into(), topic_name }
    }
}

/// The step of a log attempt that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    Queue,
    Material,
    Session,
    Encode,
    Publish,
}

impl LogStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStage::Queue => "queue",
            LogStage::Material => "material",
            LogStage::Session => "session",
            LogStage::Encode => "encode",
            LogStage::Publish => "publish",
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("material acquisition failed: {0}")]
    MaterialAcquisition(#[from] MaterialError),
    #[error("session build failed: {0}")]
    SessionBuild(String),
    #[error("encode error: {0}")]
    Encode(#[from] CodecError),
    #[error("publish error: {0}")]
    Publish(String),
}

impl AuditError {
    pub fn stage(&self) -> LogStage {
        match self {
            AuditError::MaterialAcquisition(_) => LogStage::Material,
            AuditError::SessionBuild(_) => LogStage::Session,
            AuditError::Encode(_) => LogStage::Encode,
            AuditError::Publish(_) => LogStage::Publish,
        }
    }
}

pub type AuditResult<T> = Result<T, AuditError>;
