use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the envelope helpers.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("ciphertext missing nonce")]
    MissingNonce,
    #[error("encryption failure")]
    EncryptFailure,
    #[error("decryption failure")]
    DecryptFailure,
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),
}

/// Errors raised while issuing or materializing tenant material.
#[derive(Debug, Error)]
pub enum MaterialError {
    #[error("no material issued for {principal}@{tenant}")]
    NotIssued { principal: String, tenant: String },
    #[error("material source failure: {0}")]
    Source(String),
    #[error("unseal failed: {0}")]
    Crypto(#[from] CryptoError),
    #[error("passphrase is not valid utf-8")]
    Passphrase,
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MaterialError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MaterialError::Io { path: path.into(), source }
    }
}
