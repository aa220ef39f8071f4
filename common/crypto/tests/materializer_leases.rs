use async_trait::async_trait;
use common_crypto::{
    acquire_lease, generate_key, CertificateMaterializer, DirectoryMaterialSource, InMemoryMaterialSource,
    MasterKey, MaterialError, MaterialProvider, MaterialSource, SealedMaterial,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const PRINCIPAL: &str = "srvmanager";

fn master() -> MasterKey {
    MasterKey::from_bytes(generate_key()).expect("master key")
}

fn sealed(master: &MasterKey) -> SealedMaterial {
    SealedMaterial::seal(master, b"KEY-PEM", b"CERT-PEM", b"CA-PEM", "s3cret").expect("seal")
}

/// Counts fetches and stalls briefly so concurrent first acquires overlap.
struct SlowSource {
    inner: InMemoryMaterialSource,
    fetches: AtomicUsize,
}

#[async_trait]
impl MaterialSource for SlowSource {
    async fn fetch(&self, principal: &str, tenant: &str) -> Result<SealedMaterial, MaterialError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.fetch(principal, tenant).await
    }
}

#[tokio::test]
async fn first_acquire_writes_material_and_last_release_removes_it() {
    let tmp = tempfile::tempdir().expect("tmp");
    let key = master();
    let source = InMemoryMaterialSource::new();
    source.insert(PRINCIPAL, "acme", sealed(&key));
    let materializer = CertificateMaterializer::new(Arc::new(source), key, tmp.path());

    let first = materializer.acquire(PRINCIPAL, "acme").await.expect("acquire");
    assert_eq!(tokio::fs::read(first.key_path()).await.unwrap(), b"KEY-PEM");
    assert_eq!(tokio::fs::read(first.certificate_path()).await.unwrap(), b"CERT-PEM");
    assert_eq!(tokio::fs::read(first.trust_store_path()).await.unwrap(), b"CA-PEM");
    assert_eq!(first.passphrase(), "s3cret");

    let second = materializer.acquire(PRINCIPAL, "acme").await.expect("acquire again");
    assert_eq!(second.key_path(), first.key_path());
    assert_eq!(materializer.lease_count(PRINCIPAL, "acme"), 2);

    materializer.release(PRINCIPAL, "acme");
    assert_eq!(materializer.lease_count(PRINCIPAL, "acme"), 1);
    assert!(first.key_path().exists(), "material must survive while leased");

    materializer.release(PRINCIPAL, "acme");
    assert_eq!(materializer.lease_count(PRINCIPAL, "acme"), 0);
    assert!(!materializer.material_dir(PRINCIPAL, "acme").exists());
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0, "no released copies left behind");
}

#[tokio::test]
async fn material_is_rewritten_after_full_release() {
    let tmp = tempfile::tempdir().expect("tmp");
    let key = master();
    let source = InMemoryMaterialSource::new();
    source.insert(PRINCIPAL, "acme", sealed(&key));
    let materializer = CertificateMaterializer::new(Arc::new(source), key, tmp.path());

    for _ in 0..3 {
        let material = materializer.acquire(PRINCIPAL, "acme").await.expect("acquire");
        assert_eq!(tokio::fs::read(material.certificate_path()).await.unwrap(), b"CERT-PEM");
        materializer.release(PRINCIPAL, "acme");
        assert!(!material.certificate_path().exists());
    }
    assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn material_files_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;
    let tmp = tempfile::tempdir().expect("tmp");
    let key = master();
    let source = InMemoryMaterialSource::new();
    source.insert(PRINCIPAL, "acme", sealed(&key));
    let materializer = CertificateMaterializer::new(Arc::new(source), key, tmp.path());
    let material = materializer.acquire(PRINCIPAL, "acme").await.expect("acquire");
    let mode = std::fs::metadata(material.key_path()).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    materializer.release(PRINCIPAL, "acme");
}

#[tokio::test]
async fn unissued_tenant_fails_without_leaking_a_lease() {
    let tmp = tempfile::tempdir().expect("tmp");
    let materializer =
        CertificateMaterializer::new(Arc::new(InMemoryMaterialSource::new()), master(), tmp.path());
    let err = materializer.acquire(PRINCIPAL, "ghost").await.unwrap_err();
    assert!(matches!(err, MaterialError::NotIssued { .. }));
    assert_eq!(materializer.lease_count(PRINCIPAL, "ghost"), 0);
}

#[tokio::test]
async fn material_sealed_under_another_key_is_rejected_and_cleaned_up() {
    let tmp = tempfile::tempdir().expect("tmp");
    let source = InMemoryMaterialSource::new();
    source.insert(PRINCIPAL, "acme", sealed(&master()));
    let materializer = CertificateMaterializer::new(Arc::new(source), master(), tmp.path());
    let err = materializer.acquire(PRINCIPAL, "acme").await.unwrap_err();
    assert!(matches!(err, MaterialError::Crypto(_)));
    assert_eq!(materializer.lease_count(PRINCIPAL, "acme"), 0);
    assert!(!materializer.material_dir(PRINCIPAL, "acme").exists());
}

#[tokio::test]
async fn release_without_lease_is_a_noop() {
    let tmp = tempfile::tempdir().expect("tmp");
    let materializer =
        CertificateMaterializer::new(Arc::new(InMemoryMaterialSource::new()), master(), tmp.path());
    materializer.release(PRINCIPAL, "acme");
    assert_eq!(materializer.lease_count(PRINCIPAL, "acme"), 0);
}

#[tokio::test]
async fn lease_guard_releases_on_drop() {
    let tmp = tempfile::tempdir().expect("tmp");
    let key = master();
    let source = InMemoryMaterialSource::new();
    source.insert(PRINCIPAL, "acme", sealed(&key));
    let provider: Arc<dyn MaterialProvider> =
        Arc::new(CertificateMaterializer::new(Arc::new(source), key, tmp.path()));
    {
        let lease = acquire_lease(provider.clone(), PRINCIPAL, "acme").await.expect("lease");
        assert_eq!(lease.tenant(), "acme");
        assert!(lease.material().certificate_path().exists());
        assert_eq!(provider.lease_count(PRINCIPAL, "acme"), 1);
    }
    assert_eq!(provider.lease_count(PRINCIPAL, "acme"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquires_materialize_once_and_balance_to_zero() {
    let tmp = tempfile::tempdir().expect("tmp");
    let key = master();
    let inner = InMemoryMaterialSource::new();
    inner.insert(PRINCIPAL, "acme", sealed(&key));
    let source = Arc::new(SlowSource { inner, fetches: AtomicUsize::new(0) });
    let materializer = Arc::new(CertificateMaterializer::new(source.clone(), key, tmp.path()));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let materializer = materializer.clone();
        handles.push(tokio::spawn(async move {
            materializer.acquire(PRINCIPAL, "acme").await.expect("acquire")
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }
    assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    assert_eq!(materializer.lease_count(PRINCIPAL, "acme"), 16);

    let mut releases = Vec::new();
    for _ in 0..16 {
        let materializer = materializer.clone();
        releases.push(tokio::spawn(async move { materializer.release(PRINCIPAL, "acme") }));
    }
    for handle in releases {
        handle.await.expect("join");
    }
    assert_eq!(materializer.lease_count(PRINCIPAL, "acme"), 0);
    assert!(!materializer.material_dir(PRINCIPAL, "acme").exists());
}

#[tokio::test]
async fn directory_source_reads_sealed_parts() {
    let root = tempfile::tempdir().expect("root");
    let key = master();
    let parts = sealed(&key);
    let dir = root.path().join("acme").join(PRINCIPAL);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("key.sealed"), &parts.private_key).unwrap();
    std::fs::write(dir.join("cert.sealed"), &parts.certificate_chain).unwrap();
    std::fs::write(dir.join("ca.sealed"), &parts.trust_anchor).unwrap();
    std::fs::write(dir.join("passphrase.sealed"), &parts.passphrase).unwrap();

    let source = DirectoryMaterialSource::new(root.path());
    let fetched = source.fetch(PRINCIPAL, "acme").await.expect("fetch");
    assert_eq!(key.unseal(&fetched.certificate_chain).unwrap().as_slice(), b"CERT-PEM");

    assert!(matches!(
        source.fetch(PRINCIPAL, "other").await,
        Err(MaterialError::NotIssued { .. })
    ));
    assert!(matches!(
        source.fetch(PRINCIPAL, "../acme").await,
        Err(MaterialError::Source(_))
    ));
}
