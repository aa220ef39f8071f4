use chrono::Utc;
use common_crypto::{acquire_lease, MaterialProvider};
use common_observability::AuditMetrics;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

use crate::codec::RecordEncoder;
use crate::model::{AuditResult, InferenceAuditRecord, InferenceEvent, LogStage, TenantPublishTarget};
use crate::producer::{PublishSession, SessionBuilder};

/// How a single log attempt ended. Reported for observability only; the
/// serving path never sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Skipped,
    Published,
    Dropped(LogStage),
}

/// Acquire material, open a session, encode, publish, close, release.
pub struct InferenceLogPipeline {
    principal: String,
    materials: Arc<dyn MaterialProvider>,
    sessions: Arc<dyn SessionBuilder>,
    encoder: Arc<dyn RecordEncoder>,
    metrics: AuditMetrics,
}

impl InferenceLogPipeline {
    pub fn new(
        principal: impl Into<String>,
        materials: Arc<dyn MaterialProvider>,
        sessions: Arc<dyn SessionBuilder>,
        encoder: Arc<dyn RecordEncoder>,
        metrics: AuditMetrics,
    ) -> Self {
        Self {
            principal: principal.into(),
            materials,
            sessions,
            encoder,
            metrics,
        }
    }

    pub fn metrics(&self) -> &AuditMetrics {
        &self.metrics
    }

    pub async fn process(&self, target: &TenantPublishTarget, event: InferenceEvent) -> LogOutcome {
        let Some(topic) = target.topic_name.as_deref() else {
            self.metrics.skipped.inc();
            return LogOutcome::Skipped;
        };
        match self.publish(&target.tenant_id, topic, event).await {
            Ok(()) => {
                self.metrics.published.inc();
                LogOutcome::Published
            }
            Err(err) => {
                let stage = err.stage();
                self.metrics.dropped.with_label_values(&[stage.as_str()]).inc();
                warn!(
                    tenant = %target.tenant_id,
                    topic,
                    stage = stage.as_str(),
                    error = %err,
                    "inference log record dropped"
                );
                LogOutcome::Dropped(stage)
            }
        }
    }

    async fn publish(&self, tenant: &str, topic: &str, event: InferenceEvent) -> AuditResult<()> {
        // Dropping the lease releases the material, on error paths and unwinds alike.
        let lease = acquire_lease(self.materials.clone(), &self.principal, tenant).await?;
        let mut session = self.sessions.build(tenant, lease.material()).await?;
        let sent = self.encode_and_send(session.as_mut(), topic, event);
        session.close().await;
        drop(session);
        drop(lease);
        sent
    }

    fn encode_and_send(&self, session: &mut dyn PublishSession, topic: &str, event: InferenceEvent) -> AuditResult<()> {
        let record = InferenceAuditRecord::stamp(event, Utc::now().timestamp_millis());
        let payload = self.encoder.encode(&record)?;
        session.publish(topic, &record.key(), &payload)
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub queue_capacity: usize,
    pub max_in_flight: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { queue_capacity: 1024, max_in_flight: 32 }
    }
}

/// Result of handing a record to the background publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Skipped,
    Queued,
    Dropped,
}

struct LogJob {
    target: TenantPublishTarget,
    event: InferenceEvent,
}

/// Cheap, cloneable handle the serving path logs through.
///
/// `log` never blocks and never fails: records are queued for a background
/// worker, and dropped with a warning if the queue is full. The worker exits
/// after every handle is dropped and in-flight attempts have finished.
#[derive(Clone)]
pub struct AuditLogger {
    tx: mpsc::Sender<LogJob>,
    metrics: AuditMetrics,
}

impl AuditLogger {
    pub fn spawn(pipeline: InferenceLogPipeline, config: DispatchConfig) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let metrics = pipeline.metrics().clone();
        let handle = tokio::spawn(run_dispatch_loop(Arc::new(pipeline), rx, config.max_in_flight.max(1)));
        (Self { tx, metrics }, handle)
    }

    pub fn log(&self, target: TenantPublishTarget, event: InferenceEvent) -> Dispatch {
        if target.topic_name.is_none() {
            self.metrics.skipped.inc();
            return Dispatch::Skipped;
        }
        match self.tx.try_send(LogJob { target, event }) {
            Ok(()) => {
                self.metrics.enqueued.inc();
                Dispatch::Queued
            }
            Err(TrySendError::Full(job)) => {
                self.drop_job(&job, "inference log queue full");
                Dispatch::Dropped
            }
            Err(TrySendError::Closed(job)) => {
                self.drop_job(&job, "inference log worker stopped");
                Dispatch::Dropped
            }
        }
    }

    fn drop_job(&self, job: &LogJob, reason: &'static str) {
        self.metrics.dropped.with_label_values(&[LogStage::Queue.as_str()]).inc();
        warn!(
            tenant = %job.target.tenant_id,
            model = %job.event.model_name,
            "{reason}; record dropped"
        );
    }
}

async fn run_dispatch_loop(pipeline: Arc<InferenceLogPipeline>, mut rx: mpsc::Receiver<LogJob>, max_in_flight: usize) {
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => report_join(joined),
            job = rx.recv() => {
                let Some(job) = job else { break };
                let Ok(permit) = permits.clone().acquire_owned().await else { break };
                let pipeline = pipeline.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    let _attempt = InFlight::enter(pipeline.metrics());
                    let outcome = pipeline.process(&job.target, job.event).await;
                    debug!(tenant = %job.target.tenant_id, ?outcome, "inference log attempt finished");
                });
            }
        }
    }
    while let Some(joined) = in_flight.join_next().await {
        report_join(joined);
    }
    debug!("inference log worker shutting down");
}

/// Holds one unit of the in-flight gauge; given back on drop, unwinding included.
struct InFlight<'a>(&'a AuditMetrics);

impl<'a> InFlight<'a> {
    fn enter(metrics: &'a AuditMetrics) -> Self {
        metrics.in_flight.inc();
        Self(metrics)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.dec();
    }
}

fn report_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "inference log attempt aborted");
    }
}
