use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};
use zeroize::Zeroizing;

use crate::envelope::MasterKey;
use crate::error::MaterialError;
use crate::material::{CryptoMaterial, MaterialSource, SealedMaterial, CA_FILE, CERT_FILE, KEY_FILE};

/// Reference-counted access to per-(principal, tenant) material.
///
/// Every successful `acquire` must be paired with exactly one `release`;
/// [`MaterialLease`] does the pairing for you.
#[async_trait]
pub trait MaterialProvider: Send + Sync {
    async fn acquire(&self, principal: &str, tenant: &str) -> Result<CryptoMaterial, MaterialError>;

    fn release(&self, principal: &str, tenant: &str);

    /// Outstanding leases for the pair.
    fn lease_count(&self, principal: &str, tenant: &str) -> usize;
}

/// Scoped hold on materialized credentials, released exactly once on drop.
pub struct MaterialLease {
    provider: Arc<dyn MaterialProvider>,
    principal: String,
    tenant: String,
    material: CryptoMaterial,
}

impl MaterialLease {
    pub fn material(&self) -> &CryptoMaterial {
        &self.material
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }
}

impl Drop for MaterialLease {
    fn drop(&mut self) {
        self.provider.release(&self.principal, &self.tenant);
    }
}

impl std::fmt::Debug for MaterialLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaterialLease")
            .field("principal", &self.principal)
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

/// Acquire material and wrap it in a guard that releases it on every exit path.
pub async fn acquire_lease(
    provider: Arc<dyn MaterialProvider>,
    principal: &str,
    tenant: &str,
) -> Result<MaterialLease, MaterialError> {
    let material = provider.acquire(principal, tenant).await?;
    Ok(MaterialLease {
        provider,
        principal: principal.to_string(),
        tenant: tenant.to_string(),
        material,
    })
}

type LeaseKey = (String, String);

struct Entry {
    count: usize,
    dir: PathBuf,
    material: CryptoMaterial,
}

/// Writes unsealed material under a private directory on first acquire and
/// removes it when the last lease is released.
pub struct CertificateMaterializer {
    source: Arc<dyn MaterialSource>,
    master_key: MasterKey,
    tmp_dir: PathBuf,
    entries: Mutex<HashMap<LeaseKey, Entry>>,
    // Serializes first-time materialization per key; dropped once idle.
    gates: Mutex<HashMap<LeaseKey, Arc<tokio::sync::Mutex<()>>>>,
    released: AtomicU64,
}

/// Drops the pair's gate once no acquirer holds it, including on cancellation.
struct GateRetirer<'a> {
    materializer: &'a CertificateMaterializer,
    key: &'a LeaseKey,
}

impl Drop for GateRetirer<'_> {
    fn drop(&mut self) {
        let mut gates = self.materializer.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if gates.get(self.key).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(self.key);
        }
    }
}

impl CertificateMaterializer {
    pub fn new(source: Arc<dyn MaterialSource>, master_key: MasterKey, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            master_key,
            tmp_dir: tmp_dir.into(),
            entries: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            released: AtomicU64::new(0),
        }
    }

    /// Directory the pair's material is written to while leased.
    pub fn material_dir(&self, principal: &str, tenant: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(tenant.as_bytes());
        hasher.update([0u8]);
        hasher.update(principal.as_bytes());
        let digest = hasher.finalize();
        self.tmp_dir.join(hex::encode(&digest[..16]))
    }

    fn gate(&self, key: &LeaseKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        gates.entry(key.clone()).or_default().clone()
    }

    /// Moves a released directory out of the way so a new first acquire
    /// writes into a fresh path. Falls back to removing in place.
    fn tombstone(&self, dir: &Path) -> Option<PathBuf> {
        let n = self.released.fetch_add(1, Ordering::Relaxed);
        let tomb = dir.with_extension(format!("released-{n}"));
        match std::fs::rename(dir, &tomb) {
            Ok(()) => Some(tomb),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "could not move released credentials; removing in place");
                remove_dir(dir);
                None
            }
        }
    }

    fn try_share(&self, key: &LeaseKey) -> Option<CryptoMaterial> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get_mut(key).map(|entry| {
            entry.count += 1;
            entry.material.clone()
        })
    }

    async fn materialize(&self, dir: &Path, sealed: &SealedMaterial) -> Result<CryptoMaterial, MaterialError> {
        let passphrase = self.master_key.unseal(&sealed.passphrase)?;
        let passphrase = std::str::from_utf8(passphrase.as_slice())
            .map(|value| Zeroizing::new(value.to_string()))
            .map_err(|_| MaterialError::Passphrase)?;
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| MaterialError::io(dir, err))?;
        restrict(dir, 0o700).await?;
        for (name, blob) in [
            (KEY_FILE, &sealed.private_key),
            (CERT_FILE, &sealed.certificate_chain),
            (CA_FILE, &sealed.trust_anchor),
        ] {
            let plaintext = self.master_key.unseal(blob)?;
            let path = dir.join(name);
            tokio::fs::write(&path, plaintext.as_slice())
                .await
                .map_err(|err| MaterialError::io(&path, err))?;
            restrict(&path, 0o600).await?;
        }
        Ok(CryptoMaterial::in_dir(dir, passphrase))
    }
}

#[async_trait]
impl MaterialProvider for CertificateMaterializer {
    async fn acquire(&self, principal: &str, tenant: &str) -> Result<CryptoMaterial, MaterialError> {
        let key = (principal.to_string(), tenant.to_string());
        if let Some(material) = self.try_share(&key) {
            return Ok(material);
        }
        let _retire = GateRetirer { materializer: self, key: &key };
        let gate = self.gate(&key);
        let _issuing = gate.lock().await;
        // Another caller may have finished materializing while we waited.
        if let Some(material) = self.try_share(&key) {
            return Ok(material);
        }
        let sealed = self.source.fetch(principal, tenant).await?;
        let dir = self.material_dir(principal, tenant);
        let material = match self.materialize(&dir, &sealed).await {
            Ok(material) => material,
            Err(err) => {
                remove_dir(&dir);
                return Err(err);
            }
        };
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(
            key.clone(),
            Entry {
                count: 1,
                dir: dir.clone(),
                material: material.clone(),
            },
        );
        debug!(principal, tenant, dir = %dir.display(), "materialized tenant credentials");
        Ok(material)
    }

    fn release(&self, principal: &str, tenant: &str) {
        let key = (principal.to_string(), tenant.to_string());
        let tomb = {
            let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let Some(entry) = entries.get_mut(&key) else {
                warn!(principal, tenant, "release without an outstanding lease");
                return;
            };
            entry.count -= 1;
            if entry.count > 0 {
                return;
            }
            let Some(entry) = entries.remove(&key) else { return };
            // Moved aside under the lock so the next first acquire starts from an empty path.
            self.tombstone(&entry.dir)
        };
        if let Some(tomb) = tomb {
            remove_dir(&tomb);
        }
        debug!(principal, tenant, "removed tenant credentials");
    }

    fn lease_count(&self, principal: &str, tenant: &str) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(&(principal.to_string(), tenant.to_string()))
            .map(|entry| entry.count)
            .unwrap_or(0)
    }
}

fn remove_dir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => error!(dir = %dir.display(), error = %err, "failed to remove tenant credentials"),
    }
}

#[cfg(unix)]
async fn restrict(path: &Path, mode: u32) -> Result<(), MaterialError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|err| MaterialError::io(path, err))
}

#[cfg(not(unix))]
async fn restrict(_path: &Path, _mode: u32) -> Result<(), MaterialError> {
    Ok(())
}
