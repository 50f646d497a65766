//! Durable background job queue over Redis lists. New jobs land in
//! `{name}:pending`; workers move them to `{name}:active` while running,
//! retries wait in the `{name}:delayed` sorted set and exhausted jobs are
//! kept in `{name}:dead`. Delivery is at-least-once.

pub mod jobs;

pub use jobs::{Job, JobContext, JobEnvelope};

use crate::config::QueueConfig;
use crate::error::AppError;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Seam the HTTP layer and boot path talk to. The Redis implementation is
/// the only production one; tests substitute recording fakes.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn initialize(&self) -> Result<(), AppError>;
    async fn health_check(&self) -> bool;
    async fn add_job(&self, job: Job, delay_ms: Option<u64>) -> Result<(), AppError>;
    async fn shutdown(&self);
}

#[derive(Clone)]
struct QueueKeys {
    pending: String,
    active: String,
    delayed: String,
    dead: String,
}

impl QueueKeys {
    fn new(name: &str) -> Self {
        Self {
            pending: format!("{name}:pending"),
            active: format!("{name}:active"),
            delayed: format!("{name}:delayed"),
            dead: format!("{name}:dead"),
        }
    }
}

struct QueueState {
    manager: ConnectionManager,
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct RedisJobQueue {
    config: QueueConfig,
    keys: QueueKeys,
    context: Arc<JobContext>,
    state: Mutex<Option<QueueState>>,
}

impl RedisJobQueue {
    pub fn new(config: QueueConfig, context: JobContext) -> Self {
        let keys = QueueKeys::new(&config.name);
        Self {
            config,
            keys,
            context: Arc::new(context),
            state: Mutex::new(None),
        }
    }

    /// Connects to the broker, recovers jobs a previous process left in the
    /// active list, and starts the workers plus the delayed-job promoter.
    /// Idempotent; concurrent callers serialize on the state lock. A failed
    /// attempt leaves no cached state behind.
    pub async fn initialize(&self) -> Result<(), AppError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            warn!("job queue is already initialized");
            return Ok(());
        }
        info!("initializing job queue {}", self.config.name);

        let client = Client::open(self.config.redis_url.as_str()).map_err(queue_error)?;
        let manager = ConnectionManager::new(client).await.map_err(queue_error)?;

        recover_active(&self.keys, &mut manager.clone()).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        for worker_id in 0..self.config.worker_concurrency.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&self.context),
                self.keys.clone(),
                self.config.job_backoff_ms,
                manager.clone(),
                stop_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(promoter_loop(
            self.keys.clone(),
            manager.clone(),
            stop_rx,
        )));

        let verified = ping(&mut manager.clone()).await;
        if !verified {
            let _ = stop_tx.send(true);
            for task in tasks {
                task.abort();
            }
            return Err(AppError::queue(
                "Queue initialization verification failed",
            ));
        }

        *state = Some(QueueState {
            manager,
            stop: stop_tx,
            tasks,
        });
        info!(
            "job queue initialized with {} workers",
            self.config.worker_concurrency.max(1)
        );
        Ok(())
    }

    /// False when uninitialized or the broker fails the liveness probe.
    pub async fn health_check(&self) -> bool {
        let state = self.state.lock().await;
        let Some(queue_state) = state.as_ref() else {
            warn!("queue health check failed: not initialized");
            return false;
        };
        let mut manager = queue_state.manager.clone();
        drop(state);
        let healthy = ping(&mut manager).await;
        if !healthy {
            error!("queue health check failed: broker did not answer ping");
        }
        healthy
    }

    /// Enqueues one job, reconnecting first when the queue looks unhealthy.
    /// Retries up to the configured budget with linear backoff; exhaustion
    /// returns the last error to the caller.
    pub async fn add_job(&self, job: Job, delay_ms: Option<u64>) -> Result<(), AppError> {
        info!("adding job to queue: {}", job.kind());
        let max_retries = self.config.enqueue_retries.max(1);
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.try_enqueue(&job, delay_ms).await {
                Ok(()) => return Ok(()),
                Err(err) if attempts >= max_retries => return Err(err),
                Err(err) => {
                    error!(
                        "failed to add job (attempt {attempts}/{max_retries}): {}",
                        err.message()
                    );
                    let backoff = self.config.enqueue_backoff_ms.saturating_mul(attempts as u64);
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
    }

    async fn try_enqueue(&self, job: &Job, delay_ms: Option<u64>) -> Result<(), AppError> {
        if !self.health_check().await {
            warn!("job queue not healthy, attempting reconnection");
            self.reconnect().await?;
        }

        let mut manager = {
            let state = self.state.lock().await;
            let Some(queue_state) = state.as_ref() else {
                return Err(AppError::queue("Job queue is not initialized"));
            };
            queue_state.manager.clone()
        };

        let envelope = JobEnvelope::new(job, self.config.job_attempts);
        let payload = serde_json::to_string(&envelope).map_err(queue_error)?;
        match delay_ms {
            Some(delay) if delay > 0 => {
                let run_at = Utc::now().timestamp_millis() + delay as i64;
                let _: i64 = redis::cmd("ZADD")
                    .arg(&self.keys.delayed)
                    .arg(run_at)
                    .arg(&payload)
                    .query_async::<_, i64>(&mut manager)
                    .await
                    .map_err(queue_error)?;
            }
            _ => {
                let _: i64 = redis::cmd("LPUSH")
                    .arg(&self.keys.pending)
                    .arg(&payload)
                    .query_async::<_, i64>(&mut manager)
                    .await
                    .map_err(queue_error)?;
            }
        }
        debug!("enqueued job {} ({})", envelope.id, envelope.kind);
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), AppError> {
        info!("attempting to reconnect job queue");
        self.shutdown().await;
        self.initialize().await
    }

    /// Stops workers and drops the broker connection. Idempotent.
    pub async fn shutdown(&self) {
        let taken = {
            let mut state = self.state.lock().await;
            state.take()
        };
        let Some(queue_state) = taken else {
            return;
        };
        let _ = queue_state.stop.send(true);
        for task in queue_state.tasks {
            let _ = task.await;
        }
        info!("job queue shut down");
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn initialize(&self) -> Result<(), AppError> {
        RedisJobQueue::initialize(self).await
    }

    async fn health_check(&self) -> bool {
        RedisJobQueue::health_check(self).await
    }

    async fn add_job(&self, job: Job, delay_ms: Option<u64>) -> Result<(), AppError> {
        RedisJobQueue::add_job(self, job, delay_ms).await
    }

    async fn shutdown(&self) {
        RedisJobQueue::shutdown(self).await
    }
}

fn queue_error(err: impl std::fmt::Display) -> AppError {
    AppError::queue(format!("Job queue error: {err}"))
}

async fn ping(manager: &mut ConnectionManager) -> bool {
    matches!(
        redis::cmd("PING")
            .query_async::<_, String>(manager)
            .await,
        Ok(reply) if reply == "PONG"
    )
}

/// Moves jobs stranded in the active list by an earlier process back to the
/// front of the pending queue.
async fn recover_active(keys: &QueueKeys, manager: &mut ConnectionManager) -> Result<(), AppError> {
    let stranded: Vec<String> = redis::cmd("LRANGE")
        .arg(&keys.active)
        .arg(0)
        .arg(-1)
        .query_async::<_, Vec<String>>(manager)
        .await
        .map_err(queue_error)?;
    if stranded.is_empty() {
        return Ok(());
    }
    warn!("recovering {} stranded jobs", stranded.len());
    for payload in &stranded {
        let _: i64 = redis::cmd("RPUSH")
            .arg(&keys.pending)
            .arg(payload)
            .query_async::<_, i64>(manager)
            .await
            .map_err(queue_error)?;
    }
    let _: i64 = redis::cmd("DEL")
        .arg(&keys.active)
        .query_async::<_, i64>(manager)
        .await
        .map_err(queue_error)?;
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    context: Arc<JobContext>,
    keys: QueueKeys,
    backoff_ms: u64,
    mut manager: ConnectionManager,
    stop: watch::Receiver<bool>,
) {
    debug!("queue worker {worker_id} started");
    loop {
        if *stop.borrow() {
            break;
        }
        let moved = redis::cmd("BLMOVE")
            .arg(&keys.pending)
            .arg(&keys.active)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(1.0_f64)
            .query_async::<_, Option<String>>(&mut manager)
            .await;
        match moved {
            Ok(Some(payload)) => {
                process_payload(&context, &keys, backoff_ms, &mut manager, payload).await;
            }
            Ok(None) => {}
            Err(err) => {
                error!("queue worker {worker_id} poll failed: {err}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!("queue worker {worker_id} stopped");
}

async fn process_payload(
    context: &JobContext,
    keys: &QueueKeys,
    backoff_ms: u64,
    manager: &mut ConnectionManager,
    payload: String,
) {
    let envelope: JobEnvelope = match serde_json::from_str(&payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            error!("dropping unparseable job payload: {err}");
            finish_active(keys, manager, &payload).await;
            push_dead(keys, manager, &payload).await;
            return;
        }
    };

    info!("processing job {} of kind {}", envelope.id, envelope.kind);
    let outcome = match Job::from_envelope(&envelope) {
        Ok(job) => context.dispatch(&job).await,
        Err(err) => Err(err),
    };

    match outcome {
        Ok(()) => {
            debug!("job {} progress: 100%", envelope.id);
            info!("job {} completed successfully", envelope.id);
            finish_active(keys, manager, &payload).await;
        }
        Err(err @ AppError::UnhandledJobKind(_)) => {
            error!("job {} failed: {err}", envelope.id);
            finish_active(keys, manager, &payload).await;
            push_dead(keys, manager, &payload).await;
        }
        Err(err) if envelope.attempt >= envelope.max_attempts => {
            error!(
                "job {} failed after {} attempts: {}",
                envelope.id,
                envelope.attempt,
                err.message()
            );
            finish_active(keys, manager, &payload).await;
            push_dead(keys, manager, &payload).await;
        }
        Err(err) => {
            let mut retry = envelope.clone();
            retry.attempt += 1;
            let factor = 2u64.saturating_pow(envelope.attempt.saturating_sub(1));
            let delay = backoff_ms.saturating_mul(factor);
            warn!(
                "job {} failed (attempt {}/{}), retrying in {delay}ms: {}",
                envelope.id,
                envelope.attempt,
                envelope.max_attempts,
                err.message()
            );
            let run_at = Utc::now().timestamp_millis() + delay as i64;
            match serde_json::to_string(&retry) {
                Ok(retry_payload) => {
                    let added = redis::cmd("ZADD")
                        .arg(&keys.delayed)
                        .arg(run_at)
                        .arg(&retry_payload)
                        .query_async::<_, i64>(manager)
                        .await;
                    if let Err(err) = added {
                        error!("failed to schedule retry for job {}: {err}", envelope.id);
                    }
                }
                Err(err) => error!("failed to serialize retry for job {}: {err}", envelope.id),
            }
            finish_active(keys, manager, &payload).await;
        }
    }
}

async fn finish_active(keys: &QueueKeys, manager: &mut ConnectionManager, payload: &str) {
    let removed = redis::cmd("LREM")
        .arg(&keys.active)
        .arg(1)
        .arg(payload)
        .query_async::<_, i64>(manager)
        .await;
    if let Err(err) = removed {
        error!("failed to clear active job entry: {err}");
    }
}

async fn push_dead(keys: &QueueKeys, manager: &mut ConnectionManager, payload: &str) {
    let pushed = redis::cmd("LPUSH")
        .arg(&keys.dead)
        .arg(payload)
        .query_async::<_, i64>(manager)
        .await;
    if let Err(err) = pushed {
        error!("failed to dead-letter job payload: {err}");
    }
}

/// Promotes delayed jobs whose due time has passed back onto the pending
/// list. Runs until shutdown.
async fn promoter_loop(keys: QueueKeys, mut manager: ConnectionManager, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                promote_due(&keys, &mut manager).await;
            }
        }
    }
    debug!("queue promoter stopped");
}

async fn promote_due(keys: &QueueKeys, manager: &mut ConnectionManager) {
    let now = Utc::now().timestamp_millis();
    let due = redis::cmd("ZRANGEBYSCORE")
        .arg(&keys.delayed)
        .arg("-inf")
        .arg(now)
        .arg("LIMIT")
        .arg(0)
        .arg(16)
        .query_async::<_, Vec<String>>(manager)
        .await;
    let due = match due {
        Ok(due) => due,
        Err(err) => {
            error!("failed to read delayed jobs: {err}");
            return;
        }
    };
    for payload in due {
        let pushed = redis::cmd("LPUSH")
            .arg(&keys.pending)
            .arg(&payload)
            .query_async::<_, i64>(manager)
            .await;
        if let Err(err) = pushed {
            error!("failed to promote delayed job: {err}");
            continue;
        }
        let removed = redis::cmd("ZREM")
            .arg(&keys.delayed)
            .arg(&payload)
            .query_async::<_, i64>(manager)
            .await;
        if let Err(err) = removed {
            error!("failed to drop promoted job from delayed set: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserDbConfig;
    use crate::storage::SqliteStorage;
    use crate::userdb::{ConnectionPool, QueryExecutor};

    #[test]
    fn keys_derive_from_queue_name() {
        let keys = QueueKeys::new("dbchat-jobs");
        assert_eq!(keys.pending, "dbchat-jobs:pending");
        assert_eq!(keys.active, "dbchat-jobs:active");
        assert_eq!(keys.delayed, "dbchat-jobs:delayed");
        assert_eq!(keys.dead, "dbchat-jobs:dead");
    }

    #[tokio::test]
    async fn health_check_is_false_before_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("queue_health.db");
        let storage = Arc::new(SqliteStorage::new(db_path.to_string_lossy().to_string()));
        let pool = Arc::new(ConnectionPool::new(&UserDbConfig::default()));
        let runner = Arc::new(QueryExecutor::new(pool));
        let queue = RedisJobQueue::new(QueueConfig::default(), JobContext { storage, runner });
        assert!(!queue.health_check().await);
    }
}
