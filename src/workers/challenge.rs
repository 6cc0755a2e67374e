use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    automation::{
        challenges::{find_challenge, finish_challenge},
        context::{load_ticket, AutomationContext, TicketBundle},
        dispatcher::execute_recipe,
        engine::RunOutcome,
        issuers::{issuer_key, resolve_issuer, ChallengeReason, Intent},
        metadata::ChallengeMetadata,
        recipes::{executable_recipe, find_by_issuer},
        AutomationError, Recipe, RunReport,
    },
    jobs::JOB_RUN_CHALLENGE,
    models::{Challenge, IssuerAutomation, Job},
    state::AppState,
    status::{ChallengeStatus, ChallengeType},
};

use super::{JobExecution, JobHandler, MAX_LAUNCH_ATTEMPTS};

#[derive(Debug, Deserialize)]
struct RunChallengePayload {
    challenge_id: Uuid,
}

/// Submits a queued automated challenge with the built-in script or the
/// issuer's verified recipe.
pub struct RunChallengeJob;

impl RunChallengeJob {
    pub fn new() -> Self {
        Self
    }
}

struct RunContext {
    challenge: Challenge,
    bundle: TicketBundle,
    automation: Option<IssuerAutomation>,
}

#[async_trait]
impl JobHandler for RunChallengeJob {
    fn job_type(&self) -> &'static str {
        JOB_RUN_CHALLENGE
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let payload: RunChallengePayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid run-challenge payload: {err}"),
                }
            }
        };
        let challenge_id = payload.challenge_id;

        let state_clone = state.clone();
        let loaded = match task::spawn_blocking(move || load_run_context(&state_clone, challenge_id))
            .await
        {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(err)) => {
                warn!(job_id = %job.id, error = %err, "run-challenge job will retry");
                return JobExecution::Retry {
                    delay: Duration::from_secs(30),
                    error: err,
                };
            }
            Err(join_err) => {
                error!(job_id = %job.id, error = %join_err, "run-challenge task panicked");
                return JobExecution::Retry {
                    delay: Duration::from_secs(60),
                    error: format!("worker panicked: {join_err}"),
                };
            }
        };

        let Some(run) = loaded else {
            return JobExecution::Failed {
                error: format!("challenge {challenge_id} not found"),
            };
        };

        if run.challenge.status != ChallengeStatus::Pending.as_str() {
            info!(%challenge_id, status = %run.challenge.status, "challenge already finished");
            return JobExecution::Success;
        }
        match ChallengeMetadata::from_value(&run.challenge.metadata) {
            Some(ChallengeMetadata::Queued { job_id }) if job_id == job.id => {}
            other => {
                warn!(%challenge_id, job_id = %job.id, metadata = ?other, "challenge is not waiting on this job");
                return JobExecution::Success;
            }
        }

        let reason = match run.challenge.reason.parse::<ChallengeReason>() {
            Ok(reason) => reason,
            Err(err) => return fail_challenge(&state, challenge_id, err.to_string(), None).await,
        };

        let recipe = match select_recipe(&state, &run, reason) {
            Ok(recipe) => recipe,
            Err(err) => return fail_challenge(&state, challenge_id, err, None).await,
        };

        let context = AutomationContext::from_bundle(&run.bundle, Some(&run.challenge), Vec::new());
        info!(
            %challenge_id,
            pcn_number = %run.bundle.ticket.pcn_number,
            steps = recipe.steps.len(),
            "running challenge"
        );

        match execute_recipe(&state, &run.bundle, &recipe, &context, Some(reason)).await {
            Ok(report) => record_report(&state, challenge_id, report).await,
            Err(err) if err.is_transient() && job.attempts < MAX_LAUNCH_ATTEMPTS => {
                warn!(%challenge_id, attempts = job.attempts, error = %err, "browser unavailable; will retry");
                JobExecution::Retry {
                    delay: Duration::from_secs(60),
                    error: err.to_string(),
                }
            }
            Err(err) => fail_challenge(&state, challenge_id, err.to_string(), None).await,
        }
    }
}

fn load_run_context(state: &AppState, challenge_id: Uuid) -> Result<Option<RunContext>, String> {
    let mut conn = state.db().map_err(|err| format!("{err:?}"))?;
    let Some(challenge) = find_challenge(&mut conn, challenge_id).map_err(|err| format!("{err:?}"))?
    else {
        return Ok(None);
    };
    if challenge.challenge_type != ChallengeType::AutoChallenge.as_str() {
        return Err(format!("challenge {challenge_id} is not an automated challenge"));
    }
    let Some(bundle) = load_ticket(&mut conn, challenge.ticket_id).map_err(|err| format!("{err:?}"))?
    else {
        return Ok(None);
    };
    let automation = find_by_issuer(&mut conn, &issuer_key(&bundle.ticket.issuer))
        .map_err(|err| format!("{err:?}"))?;
    Ok(Some(RunContext {
        challenge,
        bundle,
        automation,
    }))
}

fn select_recipe(
    state: &AppState,
    run: &RunContext,
    reason: ChallengeReason,
) -> Result<Recipe, String> {
    let issuer = &run.bundle.ticket.issuer;
    if let Some(definition) = resolve_issuer(issuer).filter(|d| d.has_built_in_support()) {
        return definition
            .recipe(Intent::Challenge, Some(reason), &state.script_options())
            .ok_or_else(|| {
                AutomationError::MissingScript {
                    issuer: issuer.clone(),
                    intent: Intent::Challenge,
                }
                .to_string()
            });
    }
    let automation = run
        .automation
        .as_ref()
        .ok_or_else(|| format!("no automation recorded for issuer `{issuer}`"))?;
    executable_recipe(automation).map_err(|err| err.to_string())
}

async fn record_report(state: &AppState, challenge_id: Uuid, report: RunReport) -> JobExecution {
    let (status, metadata, execution) = match &report.outcome {
        RunOutcome::Completed => (
            ChallengeStatus::Success,
            ChallengeMetadata::Completed {
                completed_steps: report.completed_steps(),
                evidence: report.evidence.iter().map(|e| e.key.clone()).collect(),
                generated_text: report.generated_text.clone(),
                confirmation_reference: report.captured.get("confirmation_reference").cloned(),
            },
            JobExecution::Success,
        ),
        RunOutcome::Failed {
            position,
            kind,
            error,
            ..
        } => (
            ChallengeStatus::Error,
            ChallengeMetadata::Failed {
                error: error.clone(),
                failed_step: Some(format!("{position} ({kind})")),
                completed_steps: report.completed_steps(),
            },
            // The portal may hold partial input; a blind rerun could submit twice.
            JobExecution::Failed {
                error: format!("step {position} ({kind}) failed: {error}"),
            },
        ),
    };
    if let Err(err) = store_outcome(state, challenge_id, status, metadata).await {
        return JobExecution::Retry {
            delay: Duration::from_secs(30),
            error: err,
        };
    }
    info!(%challenge_id, %status, "challenge run recorded");
    execution
}

async fn fail_challenge(
    state: &AppState,
    challenge_id: Uuid,
    error: String,
    failed_step: Option<String>,
) -> JobExecution {
    let metadata = ChallengeMetadata::Failed {
        error: error.clone(),
        failed_step,
        completed_steps: 0,
    };
    if let Err(err) = store_outcome(state, challenge_id, ChallengeStatus::Error, metadata).await {
        error!(%challenge_id, error = %err, "failed to record challenge failure");
    }
    JobExecution::Failed { error }
}

async fn store_outcome(
    state: &AppState,
    challenge_id: Uuid,
    status: ChallengeStatus,
    metadata: ChallengeMetadata,
) -> Result<bool, String> {
    let pool = state.pool.clone();
    task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| format!("{err:?}"))?;
        finish_challenge(&mut conn, challenge_id, status, &metadata).map_err(|err| format!("{err:?}"))
    })
    .await
    .map_err(|err| format!("worker panicked: {err}"))?
}
