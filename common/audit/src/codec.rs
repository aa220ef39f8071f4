//! Avro codec for inference log records.
//!
//! Values are written with Avro single-object encoding: the two marker bytes
//! `C3 01`, the 8-byte little-endian CRC-64-AVRO fingerprint of the schema,
//! then the binary datum. A consumer holding the same schema can check the
//! fingerprint and decode without talking to the writer.

use apache_avro::rabin::Rabin;
use apache_avro::types::{Record, Value};
use apache_avro::{GenericSingleObjectReader, GenericSingleObjectWriter, Schema};
use std::collections::HashMap;
use thiserror::Error;

use crate::model::InferenceAuditRecord;

pub const INFERENCE_LOG_SCHEMA: &str = r#"{
  "type": "record",
  "name": "KafkaInferenceLog",
  "namespace": "io.hops.hopsworks.common.serving.inference.logger",
  "fields": [
    {"name": "modelId", "type": "int"},
    {"name": "modelName", "type": "string"},
    {"name": "modelVersion", "type": "int"},
    {"name": "requestTimestamp", "type": "long"},
    {"name": "responseHttpCode", "type": "int"},
    {"name": "inferenceRequest", "type": "string"},
    {"name": "inferenceResponse", "type": "string"}
  ]
}"#;

// Fingerprint bytes after the two-byte marker; only read to name a foreign schema.
const FINGERPRINT_RANGE: std::ops::Range<usize> = 2..10;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("schema error: {0}")]
    Schema(String),
    #[error("avro error: {0}")]
    Avro(#[from] apache_avro::Error),
    #[error("unknown schema fingerprint {found} (expected {expected})")]
    UnknownSchema { expected: String, found: String },
    #[error("unexpected record shape: {0}")]
    Shape(String),
}

/// Turns records into publishable bytes.
pub trait RecordEncoder: Send + Sync {
    fn encode(&self, record: &InferenceAuditRecord) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, Clone)]
pub struct RecordCodec {
    schema: Schema,
    fingerprint: [u8; 8],
}

impl RecordCodec {
    pub fn new() -> Result<Self, CodecError> {
        let schema = Schema::parse_str(INFERENCE_LOG_SCHEMA)?;
        let fingerprint: [u8; 8] = schema
            .fingerprint::<Rabin>()
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| CodecError::Schema("rabin fingerprint is not 8 bytes".into()))?;
        Ok(Self { schema, fingerprint })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_fingerprint(&self) -> [u8; 8] {
        self.fingerprint
    }

    pub fn schema_fingerprint_hex(&self) -> String {
        hex::encode(self.fingerprint)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<InferenceAuditRecord, CodecError> {
        let reader = GenericSingleObjectReader::new(self.schema.clone())?;
        let value = reader.read_value(&mut &bytes[..]).map_err(|err| {
            match bytes.get(FINGERPRINT_RANGE) {
                Some(found) if found != self.fingerprint => CodecError::UnknownSchema {
                    expected: self.schema_fingerprint_hex(),
                    found: hex::encode(found),
                },
                _ => CodecError::Avro(err),
            }
        })?;
        let Value::Record(fields) = value else {
            return Err(CodecError::Shape("datum is not a record".into()));
        };
        let mut fields: HashMap<String, Value> = fields.into_iter().collect();
        Ok(InferenceAuditRecord {
            model_id: take_int(&mut fields, "modelId")?,
            model_name: take_string(&mut fields, "modelName")?,
            model_version: take_int(&mut fields, "modelVersion")?,
            request_timestamp_millis: take_long(&mut fields, "requestTimestamp")?,
            response_http_code: take_int(&mut fields, "responseHttpCode")?,
            inference_request: take_string(&mut fields, "inferenceRequest")?,
            inference_response: take_string(&mut fields, "inferenceResponse")?,
        })
    }
}

impl RecordEncoder for RecordCodec {
    fn encode(&self, record: &InferenceAuditRecord) -> Result<Vec<u8>, CodecError> {
        let mut avro = Record::new(&self.schema)
            .ok_or_else(|| CodecError::Schema("inference log schema is not a record".into()))?;
        avro.put("modelId", record.model_id);
        avro.put("modelName", record.model_name.clone());
        avro.put("modelVersion", record.model_version);
        avro.put("requestTimestamp", record.request_timestamp_millis);
        avro.put("responseHttpCode", record.response_http_code);
        avro.put("inferenceRequest", record.inference_request.clone());
        avro.put("inferenceResponse", record.inference_response.clone());
        let capacity = 64 + record.inference_request.len() + record.inference_response.len();
        let mut writer = GenericSingleObjectWriter::new_with_capacity(&self.schema, capacity)?;
        let mut out = Vec::with_capacity(capacity);
        writer.write_value(avro.into(), &mut out)?;
        Ok(out)
    }
}

fn take_int(fields: &mut HashMap<String, Value>, name: &str) -> Result<i32, CodecError> {
    match fields.remove(name) {
        Some(Value::Int(v)) => Ok(v),
        other => Err(CodecError::Shape(format!("{name}: expected int, got {other:?}"))),
    }
}

fn take_long(fields: &mut HashMap<String, Value>, name: &str) -> Result<i64, CodecError> {
    match fields.remove(name) {
        Some(Value::Long(v)) => Ok(v),
        other => Err(CodecError::Shape(format!("{name}: expected long, got {other:?}"))),
    }
}

fn take_string(fields: &mut HashMap<String, Value>, name: &str) -> Result<String, CodecError> {
    match fields.remove(name) {
        Some(Value::String(v)) => Ok(v),
        other => Err(CodecError::Shape(format!("{name}: expected string, got {other:?}"))),
    }
}
