use anyhow::Context;
use common_audit::{AuditLogger, InferenceLogPipeline, KafkaSessionBuilder, RecordCodec};
use common_crypto::{CertificateMaterializer, DirectoryMaterialSource, MasterKey};
use common_observability::AuditMetrics;
use inference_log_service::{build_router, AppState, ServiceConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServiceConfig::from_env()?;
    let master_key = MasterKey::from_base64(&config.master_key_b64).context("MATERIAL_MASTER_KEY is not a valid key")?;
    tokio::fs::create_dir_all(&config.cert_tmp_dir)
        .await
        .with_context(|| format!("cannot create {}", config.cert_tmp_dir.display()))?;

    let materializer = Arc::new(CertificateMaterializer::new(
        Arc::new(DirectoryMaterialSource::new(&config.material_root)),
        master_key,
        &config.cert_tmp_dir,
    ));
    let codec = RecordCodec::new().context("inference log schema")?;
    info!(fingerprint = %codec.schema_fingerprint_hex(), "inference log schema loaded");
    let metrics = AuditMetrics::new().context("metrics registry")?;
    let pipeline = InferenceLogPipeline::new(
        config.principal.clone(),
        materializer,
        Arc::new(KafkaSessionBuilder::new(config.session.clone())),
        Arc::new(codec),
        metrics.clone(),
    );
    let (logger, worker) = AuditLogger::spawn(pipeline, config.dispatch.clone());

    let app = build_router(AppState { logger, metrics });
    let ip: std::net::IpAddr = config.host.parse()?;
    let addr = SocketAddr::from((ip, config.port));
    info!(%addr, brokers = %config.session.bootstrap_servers, "starting inference-log-service");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // The router (and with it the last logger handle) is gone; drain in-flight attempts.
    info!("draining inference log worker");
    worker.await.context("inference log worker")?;
    Ok(())
}
