#![allow(dead_code)]

use async_trait::async_trait;
use common_audit::{
    ensure_material_readable, AuditError, AuditResult, CodecError, InferenceAuditRecord, InferenceEvent,
    PublishSession, RecordEncoder, SessionBuilder,
};
use common_crypto::{
    generate_key, CertificateMaterializer, CryptoMaterial, InMemoryMaterialSource, MasterKey, MaterialError,
    MaterialProvider, SealedMaterial,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const PRINCIPAL: &str = "service-principal";
pub const TENANT: &str = "acme";
pub const TOPIC: &str = "acme-inference-log";

pub type Journal = Arc<Mutex<Vec<&'static str>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<&'static str> {
    journal.lock().unwrap().clone()
}

pub fn event() -> InferenceEvent {
    InferenceEvent {
        model_id: 7,
        model_name: "fraud-detector".into(),
        model_version: 3,
        response_http_code: 200,
        inference_request: r#"{"instances":[[0.1,0.2]]}"#.into(),
        inference_response: r#"{"predictions":[0.97]}"#.into(),
    }
}

/// A real materializer over an in-memory issuance service with material for [`TENANT`].
pub fn materializer(tmp: &std::path::Path) -> Arc<CertificateMaterializer> {
    let master = MasterKey::from_bytes(generate_key()).expect("master");
    let source = InMemoryMaterialSource::new();
    let sealed = SealedMaterial::seal(&master, b"KEY", b"CERT", b"CA", "pw").expect("seal");
    source.insert(PRINCIPAL, TENANT, sealed);
    Arc::new(CertificateMaterializer::new(Arc::new(source), master, tmp))
}

/// Wraps a provider and journals acquire/release calls.
pub struct JournalingProvider {
    pub inner: Arc<CertificateMaterializer>,
    pub journal: Journal,
}

#[async_trait]
impl MaterialProvider for JournalingProvider {
    async fn acquire(&self, principal: &str, tenant: &str) -> Result<CryptoMaterial, MaterialError> {
        let material = self.inner.acquire(principal, tenant).await?;
        self.journal.lock().unwrap().push("acquire");
        Ok(material)
    }

    fn release(&self, principal: &str, tenant: &str) {
        self.journal.lock().unwrap().push("release");
        self.inner.release(principal, tenant);
    }

    fn lease_count(&self, principal: &str, tenant: &str) -> usize {
        self.inner.lease_count(principal, tenant)
    }
}

#[derive(Debug, Clone)]
pub struct Published {
    pub tenant: String,
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct FakeSessions {
    pub journal: Journal,
    pub fail_build: bool,
    pub fail_publish: bool,
    /// Delete the leased certificate before checking the material.
    pub remove_certificate: bool,
    pub panic_on_build: bool,
    pub builds: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
    pub published: Arc<Mutex<Vec<Published>>>,
}

impl FakeSessions {
    pub fn new(journal: Journal) -> Self {
        Self { journal, ..Default::default() }
    }

    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionBuilder for FakeSessions {
    async fn build(&self, tenant: &str, material: &CryptoMaterial) -> AuditResult<Box<dyn PublishSession>> {
        self.journal.lock().unwrap().push("build");
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_build {
            panic!("session builder crashed");
        }
        if self.remove_certificate {
            std::fs::remove_file(material.certificate_path()).expect("remove certificate");
        }
        ensure_material_readable(material).await?;
        if self.fail_build {
            return Err(AuditError::SessionBuild("injected: connection refused".into()));
        }
        Ok(Box::new(FakeSession {
            tenant: tenant.to_string(),
            journal: self.journal.clone(),
            fail_publish: self.fail_publish,
            closes: self.closes.clone(),
            published: self.published.clone(),
        }))
    }
}

pub struct FakeSession {
    tenant: String,
    journal: Journal,
    fail_publish: bool,
    closes: Arc<AtomicUsize>,
    published: Arc<Mutex<Vec<Published>>>,
}

#[async_trait]
impl PublishSession for FakeSession {
    fn publish(&mut self, topic: &str, key: &str, payload: &[u8]) -> AuditResult<()> {
        self.journal.lock().unwrap().push("publish");
        if self.fail_publish {
            return Err(AuditError::Publish("injected: send rejected".into()));
        }
        self.published.lock().unwrap().push(Published {
            tenant: self.tenant.clone(),
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn close(&mut self) {
        self.journal.lock().unwrap().push("close");
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FailingEncoder;

impl RecordEncoder for FailingEncoder {
    fn encode(&self, _record: &InferenceAuditRecord) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::Schema("injected".into()))
    }
}
