use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::{
    db::{run_blocking, BlockingDbError},
    jobs::{finish_job, reserve_job, JobOutcome, JobQueueError},
    models::Job,
    state::AppState,
};

pub mod challenge;
pub mod verify;

/// Attempts allowed for a job whose browser could not be opened.
pub const MAX_LAUNCH_ATTEMPTS: i32 = 3;

#[derive(Debug)]
pub enum JobExecution {
    Success,
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

impl JobExecution {
    fn into_outcome(self) -> JobOutcome {
        match self {
            JobExecution::Success => JobOutcome::Succeeded,
            JobExecution::Retry { delay, error } => JobOutcome::RetryAfter { delay, error },
            JobExecution::Failed { error } => JobOutcome::Failed { error },
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;
    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution;
}

#[derive(Debug, thiserror::Error)]
enum TickError {
    #[error(transparent)]
    Queue(#[from] JobQueueError),
    #[error(transparent)]
    Blocking(#[from] BlockingDbError),
}

/// Polls the queue and runs one job at a time. A portal run is never
/// interrupted: shutdown is only observed between jobs.
pub struct Worker {
    state: Arc<AppState>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        state: Arc<AppState>,
        handlers: Vec<Arc<dyn JobHandler>>,
        poll_interval: Duration,
    ) -> Self {
        let handlers = handlers
            .into_iter()
            .map(|handler| (handler.job_type(), handler))
            .collect();
        Self {
            state,
            handlers,
            poll_interval,
        }
    }

    /// Runs until `shutdown` resolves, finishing the job in hand first.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut job_types: Vec<&'static str> = self.handlers.keys().copied().collect();
        job_types.sort_unstable();
        info!(job_types = ?job_types, "worker started");
        tokio::pin!(shutdown);

        loop {
            let idle = match self.tick(&job_types).await {
                Ok(worked) => !worked,
                Err(err) => {
                    error!(error = %err, "worker tick failed");
                    true
                }
            };
            let pause = if idle { self.poll_interval } else { Duration::ZERO };
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = sleep(pause) => {}
            }
        }
        info!("worker stopped");
    }

    async fn tick(&self, job_types: &[&'static str]) -> Result<bool, TickError> {
        if job_types.is_empty() {
            return Ok(false);
        }
        let types = job_types.to_vec();
        let reserved = run_blocking(&self.state.pool, move |conn| {
            Ok::<_, TickError>(reserve_job(conn, &types)?)
        })
        .await?;
        let Some(job) = reserved else {
            return Ok(false);
        };

        let job_id = job.id;
        let job_type = job.job_type.clone();
        let outcome = match self.handlers.get(job_type.as_str()) {
            Some(handler) => {
                let started = Instant::now();
                info!(%job_id, %job_type, attempt = job.attempts, "job started");
                let execution = handler.handle(self.state.clone(), job).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match &execution {
                    JobExecution::Success => info!(%job_id, %job_type, elapsed_ms, "job succeeded"),
                    JobExecution::Retry { delay, error } => {
                        warn!(%job_id, %job_type, elapsed_ms, delay_secs = delay.as_secs(), %error, "job will retry")
                    }
                    JobExecution::Failed { error } => {
                        error!(%job_id, %job_type, elapsed_ms, %error, "job failed")
                    }
                }
                execution.into_outcome()
            }
            None => {
                error!(%job_id, %job_type, "no handler registered for job type");
                JobOutcome::Failed {
                    error: format!("no handler registered for `{job_type}`"),
                }
            }
        };

        run_blocking(&self.state.pool, move |conn| {
            Ok::<_, TickError>(finish_job(conn, job_id, outcome)?)
        })
        .await?;
        Ok(true)
    }
}

pub fn default_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![
        Arc::new(challenge::RunChallengeJob::new()),
        Arc::new(verify::VerifyTicketJob::new()),
    ]
}
