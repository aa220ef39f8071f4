use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use zeroize::Zeroizing;

use crate::envelope::MasterKey;
use crate::error::{CryptoError, MaterialError};

pub(crate) const KEY_FILE: &str = "key.pem";
pub(crate) const CERT_FILE: &str = "cert.pem";
pub(crate) const CA_FILE: &str = "ca.pem";

/// Materialized transport-security credentials for one (principal, tenant) pair.
///
/// Owned by the materializer; callers only see the file locations and the
/// passphrase, and must stop using them once their lease is released.
#[derive(Clone)]
pub struct CryptoMaterial {
    key_path: PathBuf,
    certificate_path: PathBuf,
    trust_store_path: PathBuf,
    passphrase: Arc<Zeroizing<String>>,
}

impl CryptoMaterial {
    pub fn new(
        key_path: PathBuf,
        certificate_path: PathBuf,
        trust_store_path: PathBuf,
        passphrase: Zeroizing<String>,
    ) -> Self {
        Self {
            key_path,
            certificate_path,
            trust_store_path,
            passphrase: Arc::new(passphrase),
        }
    }

    pub(crate) fn in_dir(dir: &Path, passphrase: Zeroizing<String>) -> Self {
        Self::new(dir.join(KEY_FILE), dir.join(CERT_FILE), dir.join(CA_FILE), passphrase)
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }

    pub fn trust_store_path(&self) -> &Path {
        &self.trust_store_path
    }

    pub fn passphrase(&self) -> &str {
        self.passphrase.as_str()
    }
}

impl std::fmt::Debug for CryptoMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoMaterial")
            .field("key_path", &self.key_path)
            .field("certificate_path", &self.certificate_path)
            .field("trust_store_path", &self.trust_store_path)
            .field("passphrase", &"***redacted***")
            .finish()
    }
}

/// Issued material as it is stored: each part sealed under the [`MasterKey`].
#[derive(Clone)]
pub struct SealedMaterial {
    pub private_key: Vec<u8>,
    pub certificate_chain: Vec<u8>,
    pub trust_anchor: Vec<u8>,
    pub passphrase: Vec<u8>,
}

impl SealedMaterial {
    pub fn seal(
        master: &MasterKey,
        private_key_pem: &[u8],
        certificate_chain_pem: &[u8],
        trust_anchor_pem: &[u8],
        passphrase: &str,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            private_key: master.seal(private_key_pem)?,
            certificate_chain: master.seal(certificate_chain_pem)?,
            trust_anchor: master.seal(trust_anchor_pem)?,
            passphrase: master.seal(passphrase.as_bytes())?,
        })
    }
}

impl std::fmt::Debug for SealedMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedMaterial").finish_non_exhaustive()
    }
}

/// The certificate-issuance service, seen from this side.
#[async_trait]
pub trait MaterialSource: Send + Sync {
    async fn fetch(&self, principal: &str, tenant: &str) -> Result<SealedMaterial, MaterialError>;
}

/// Material held in memory, keyed by (principal, tenant).
#[derive(Default)]
pub struct InMemoryMaterialSource {
    issued: RwLock<HashMap<(String, String), SealedMaterial>>,
}

impl InMemoryMaterialSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, principal: &str, tenant: &str, material: SealedMaterial) {
        if let Ok(mut issued) = self.issued.write() {
            issued.insert((principal.to_string(), tenant.to_string()), material);
        }
    }

    pub fn revoke(&self, principal: &str, tenant: &str) {
        if let Ok(mut issued) = self.issued.write() {
            issued.remove(&(principal.to_string(), tenant.to_string()));
        }
    }
}

#[async_trait]
impl MaterialSource for InMemoryMaterialSource {
    async fn fetch(&self, principal: &str, tenant: &str) -> Result<SealedMaterial, MaterialError> {
        let issued = self
            .issued
            .read()
            .map_err(|_| MaterialError::Source("issued material lock poisoned".into()))?;
        issued
            .get(&(principal.to_string(), tenant.to_string()))
            .cloned()
            .ok_or_else(|| MaterialError::NotIssued {
                principal: principal.to_string(),
                tenant: tenant.to_string(),
            })
    }
}

/// Sealed material laid out on disk as
/// `<root>/<tenant>/<principal>/{key,cert,ca,passphrase}.sealed`.
#[derive(Debug, Clone)]
pub struct DirectoryMaterialSource {
    root: PathBuf,
}

impl DirectoryMaterialSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_part(dir: &Path, name: &str) -> Result<Vec<u8>, MaterialError> {
        let path = dir.join(format!("{name}.sealed"));
        tokio::fs::read(&path)
            .await
            .map_err(|err| MaterialError::io(path, err))
    }
}

#[async_trait]
impl MaterialSource for DirectoryMaterialSource {
    async fn fetch(&self, principal: &str, tenant: &str) -> Result<SealedMaterial, MaterialError> {
        if !is_plain_segment(principal) || !is_plain_segment(tenant) {
            return Err(MaterialError::Source(format!(
                "refusing path-like identifiers {principal:?}/{tenant:?}"
            )));
        }
        let dir = self.root.join(tenant).join(principal);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(MaterialError::NotIssued {
                principal: principal.to_string(),
                tenant: tenant.to_string(),
            });
        }
        Ok(SealedMaterial {
            private_key: Self::read_part(&dir, "key").await?,
            certificate_chain: Self::read_part(&dir, "cert").await?,
            trust_anchor: Self::read_part(&dir, "ca").await?,
            passphrase: Self::read_part(&dir, "passphrase").await?,
        })
    }
}

fn is_plain_segment(value: &str) -> bool {
    !value.is_empty() && value != "." && value != ".." && !value.contains(['/', '\\', '\0'])
}
