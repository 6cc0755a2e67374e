//! Entry point for "challenge this ticket automatically".
//!
//! Built-in issuers go straight to the local job queue. Everything else goes
//! through the issuer's learned recipe, which may not exist yet.

use diesel::Connection;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::challenges::{
    fail_awaiting_recipe, find_pending_auto_challenge, finish_challenge, insert_auto_challenge,
    update_pending_metadata,
};
use super::context::{load_ticket, AutomationContext, TicketBundle};
use super::evidence::existing_evidence_urls;
use super::issuers::{issuer_key, resolve_issuer, ChallengeReason};
use super::metadata::ChallengeMetadata;
use super::recipes::{
    executable_recipe, find_by_issuer, insert_learning, lock_by_issuer, record_learn_job,
    status_of, transition, RecipeStoreError, TransitionUpdate,
};
use super::remote::{LearnJobRequest, RemoteJobError, RunJobRequest};
use crate::config::RecipeExecution;
use crate::db::{run_blocking, BlockingDbError};
use crate::jobs::{enqueue_job, JobQueueError, JOB_RUN_CHALLENGE};
use crate::models::{Challenge, IssuerAutomation};
use crate::state::AppState;
use crate::status::{AutomationStatus, ChallengeStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoChallengeStatus {
    Submitted,
    Learning,
    PendingReview,
    NeedsHumanHelp,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AutoChallengeResult {
    pub success: bool,
    pub status: AutoChallengeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AutoChallengeResult {
    fn ok(status: AutoChallengeStatus, message: impl Into<String>) -> Self {
        Self {
            success: true,
            status,
            message: message.into(),
            challenge_id: None,
            error: None,
        }
    }

    fn failed(message: impl Into<String>, error: Option<String>) -> Self {
        Self {
            success: false,
            status: AutoChallengeStatus::Failed,
            message: message.into(),
            challenge_id: None,
            error,
        }
    }

    fn with_challenge(mut self, id: Uuid) -> Self {
        self.challenge_id = Some(id);
        self
    }
}

/// What to do for a ticket, decided from issuer support and the stored
/// automation state alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    RunBuiltIn,
    StartLearning,
    Wait(AutoChallengeStatus),
    RunRecipe,
    Refuse,
}

pub fn decide(built_in: bool, automation: Option<AutomationStatus>) -> Decision {
    if built_in {
        return Decision::RunBuiltIn;
    }
    match automation {
        None => Decision::StartLearning,
        Some(AutomationStatus::Learning) => Decision::Wait(AutoChallengeStatus::Learning),
        Some(AutomationStatus::PendingReview) => Decision::Wait(AutoChallengeStatus::PendingReview),
        Some(AutomationStatus::NeedsHumanHelp) => {
            Decision::Wait(AutoChallengeStatus::NeedsHumanHelp)
        }
        Some(AutomationStatus::Verified) => Decision::RunRecipe,
        Some(AutomationStatus::Failed) => Decision::Refuse,
    }
}

fn wait_message(status: AutoChallengeStatus) -> &'static str {
    match status {
        AutoChallengeStatus::Learning => {
            "We're learning this issuer's challenge portal. Your challenge will be submitted once that finishes."
        }
        AutoChallengeStatus::PendingReview => {
            "Automation for this issuer is being reviewed by our team before it is used."
        }
        AutoChallengeStatus::NeedsHumanHelp => {
            "This issuer's portal needs attention from our team. We'll step in and follow up."
        }
        AutoChallengeStatus::Submitted | AutoChallengeStatus::Failed => "",
    }
}

#[derive(Debug, Error)]
pub enum AutoChallengeError {
    #[error("ticket {0} not found")]
    TicketNotFound(Uuid),
    #[error(transparent)]
    Store(#[from] RecipeStoreError),
    #[error(transparent)]
    Queue(#[from] JobQueueError),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Blocking(#[from] BlockingDbError),
    #[error(transparent)]
    Remote(#[from] RemoteJobError),
}

/// Starts (or reports on) an automated challenge. Never returns an error:
/// every failure becomes an unsuccessful result.
pub async fn initiate_auto_challenge(
    state: &AppState,
    ticket_id: Uuid,
    reason: ChallengeReason,
    custom_reason: Option<String>,
) -> AutoChallengeResult {
    match try_initiate(state, ticket_id, reason, custom_reason).await {
        Ok(result) => result,
        Err(AutoChallengeError::TicketNotFound(_)) => {
            AutoChallengeResult::failed("Ticket not found.", None)
        }
        Err(err) => {
            error!(%ticket_id, error = %err, "auto challenge failed");
            AutoChallengeResult::failed(
                "We couldn't start the automatic challenge. Please try again later.",
                Some(err.to_string()),
            )
        }
    }
}

/// How often the stored automation is re-read when it changes between the
/// decision and the action taken on it.
const DECISION_ATTEMPTS: usize = 2;

async fn try_initiate(
    state: &AppState,
    ticket_id: Uuid,
    reason: ChallengeReason,
    custom_reason: Option<String>,
) -> Result<AutoChallengeResult, AutoChallengeError> {
    let bundle = run_blocking(&state.pool, move |conn| {
        load_ticket(conn, ticket_id)?.ok_or(AutoChallengeError::TicketNotFound(ticket_id))
    })
    .await?;

    let issuer_name = bundle.ticket.issuer.clone();
    let definition = resolve_issuer(&issuer_name);
    let built_in = definition.is_some_and(|d| d.has_built_in_support());
    let issuer_id = issuer_key(&issuer_name);

    for _ in 0..DECISION_ATTEMPTS {
        let automation = if built_in {
            None
        } else {
            let key = issuer_id.clone();
            run_blocking(&state.pool, move |conn| {
                Ok::<_, AutoChallengeError>(find_by_issuer(conn, &key)?)
            })
            .await?
        };
        let current = automation.as_ref().map(status_of).transpose()?;
        let decision = decide(built_in, current);
        info!(%ticket_id, %issuer_id, ?decision, "auto challenge decision");

        let custom_reason = custom_reason.clone();
        let acted = match decision {
            Decision::RunBuiltIn => {
                Some(queue_local_run(state, &bundle, reason, custom_reason).await?)
            }
            Decision::StartLearning => {
                let challenge_url = definition.and_then(|d| d.challenge_url).map(str::to_string);
                start_learning(state, &bundle, &issuer_id, challenge_url, reason, custom_reason)
                    .await?
            }
            Decision::Wait(AutoChallengeStatus::Learning) => {
                park_on_learning(state, &bundle, &issuer_id, reason, custom_reason).await?
            }
            Decision::Wait(status) => Some(AutoChallengeResult::ok(status, wait_message(status))),
            Decision::RunRecipe => {
                let automation =
                    automation.ok_or_else(|| RecipeStoreError::NotFound(issuer_id.clone()))?;
                Some(match state.config.recipe_execution {
                    RecipeExecution::Local => {
                        queue_local_run(state, &bundle, reason, custom_reason).await?
                    }
                    RecipeExecution::Remote => {
                        start_remote_run(state, &bundle, &automation, reason, custom_reason)
                            .await?
                    }
                })
            }
            Decision::Refuse => {
                let detail = automation
                    .and_then(|a| a.failure_reason)
                    .unwrap_or_else(|| "automation for this issuer failed".to_string());
                Some(AutoChallengeResult::failed(
                    "Automatic challenges aren't available for this issuer. Please use a challenge letter instead.",
                    Some(detail),
                ))
            }
        };
        if let Some(result) = acted {
            return Ok(result);
        }
        info!(%ticket_id, %issuer_id, "automation changed before the challenge was parked");
    }

    Ok(AutoChallengeResult::failed(
        "We couldn't start the automatic challenge. Please try again later.",
        Some("automation state changed while the request was handled".to_string()),
    ))
}

fn already_finished(challenge_id: Uuid) -> AutoChallengeResult {
    AutoChallengeResult::ok(
        AutoChallengeStatus::Submitted,
        "This automatic challenge has already finished.",
    )
    .with_challenge(challenge_id)
}

fn already_running(challenge: &Challenge) -> AutoChallengeResult {
    AutoChallengeResult::ok(
        AutoChallengeStatus::Submitted,
        "An automatic challenge for this ticket is already in progress.",
    )
    .with_challenge(challenge.id)
}

/// Creates the challenge and its `run-challenge` job in one transaction.
async fn queue_local_run(
    state: &AppState,
    bundle: &TicketBundle,
    reason: ChallengeReason,
    custom_reason: Option<String>,
) -> Result<AutoChallengeResult, AutoChallengeError> {
    let ticket_id = bundle.ticket.id;
    let outcome = run_blocking(&state.pool, move |conn| {
        conn.transaction::<_, AutoChallengeError, _>(|conn| {
            if let Some(existing) = find_pending_auto_challenge(conn, ticket_id, reason.as_str())? {
                return Ok(Err(existing));
            }
            let challenge_id = Uuid::new_v4();
            let job = enqueue_job(
                conn,
                JOB_RUN_CHALLENGE,
                serde_json::json!({ "challenge_id": challenge_id }),
                None,
            )?;
            let metadata = ChallengeMetadata::Queued { job_id: job.id };
            let challenge = insert_auto_challenge(
                conn,
                challenge_id,
                ticket_id,
                reason.as_str(),
                custom_reason,
                Some(&metadata),
            )?;
            Ok(Ok((challenge, job.id)))
        })
    })
    .await?;

    match outcome {
        Ok((challenge, job_id)) => {
            info!(challenge_id = %challenge.id, %job_id, "challenge queued for local run");
            Ok(AutoChallengeResult::ok(
                AutoChallengeStatus::Submitted,
                "Your challenge is being submitted to the issuer's portal.",
            )
            .with_challenge(challenge.id))
        }
        Err(existing) => Ok(already_running(&existing)),
    }
}

/// Creates the LEARNING automation and starts its learn job, then parks the
/// ticket's challenge on it. Returns `None` when the automation moved on
/// before the challenge could be parked.
async fn start_learning(
    state: &AppState,
    bundle: &TicketBundle,
    issuer_id: &str,
    challenge_url: Option<String>,
    reason: ChallengeReason,
    custom_reason: Option<String>,
) -> Result<Option<AutoChallengeResult>, AutoChallengeError> {
    let key = issuer_id.to_string();
    let name = bundle.ticket.issuer.clone();
    let inserted = run_blocking(&state.pool, move |conn| {
        Ok::<_, AutoChallengeError>(insert_learning(conn, &key, &name, challenge_url.as_deref())?)
    })
    .await?;

    match inserted {
        Some(automation) => {
            if let Err(err) = begin_learn_job(state, &automation).await {
                return Ok(Some(AutoChallengeResult::failed(
                    "We couldn't start learning this issuer's portal. Please use a challenge letter instead.",
                    Some(err.to_string()),
                )));
            }
        }
        // Another request created the row first and owns the learn job.
        None => info!(%issuer_id, "automation already being learned"),
    }

    park_on_learning(state, bundle, issuer_id, reason, custom_reason).await
}

/// Parks the ticket's challenge on an automation that is still LEARNING so
/// the verified recipe releases it later. An existing PENDING challenge for
/// the same ticket and reason is reused. Returns `None` when the automation
/// is missing or no longer LEARNING.
async fn park_on_learning(
    state: &AppState,
    bundle: &TicketBundle,
    issuer_id: &str,
    reason: ChallengeReason,
    custom_reason: Option<String>,
) -> Result<Option<AutoChallengeResult>, AutoChallengeError> {
    let ticket_id = bundle.ticket.id;
    let key = issuer_id.to_string();
    let parked = run_blocking(&state.pool, move |conn| {
        conn.transaction::<_, AutoChallengeError, _>(|conn| {
            let Some(automation) = lock_by_issuer(conn, &key)? else {
                return Ok(None);
            };
            if status_of(&automation)? != AutomationStatus::Learning {
                return Ok(None);
            }
            if let Some(existing) = find_pending_auto_challenge(conn, ticket_id, reason.as_str())? {
                return Ok(Some(existing));
            }
            let metadata = ChallengeMetadata::AwaitingRecipe {
                issuer_id: key.clone(),
                learn_job_id: automation.learn_job_id.clone(),
            };
            Ok(Some(insert_auto_challenge(
                conn,
                Uuid::new_v4(),
                ticket_id,
                reason.as_str(),
                custom_reason,
                Some(&metadata),
            )?))
        })
    })
    .await?;

    Ok(parked.map(|challenge| {
        info!(challenge_id = %challenge.id, %issuer_id, "challenge waiting on recipe");
        AutoChallengeResult::ok(
            AutoChallengeStatus::Learning,
            wait_message(AutoChallengeStatus::Learning),
        )
        .with_challenge(challenge.id)
    }))
}

/// Starts the remote learn job for a LEARNING automation and records its id.
/// A start failure moves the automation to FAILED.
pub async fn begin_learn_job(
    state: &AppState,
    automation: &IssuerAutomation,
) -> Result<String, AutoChallengeError> {
    let request = LearnJobRequest {
        issuer_id: automation.issuer_id.clone(),
        issuer_name: automation.issuer_name.clone(),
        challenge_url: automation.challenge_url.clone(),
        callback_url: state.config.automation_webhook_url.clone(),
    };

    match state.automation.remote.start_learn_job(&request).await {
        Ok(job_id) => {
            let automation_id = automation.id;
            let recorded = job_id.clone();
            run_blocking(&state.pool, move |conn| {
                Ok::<_, AutoChallengeError>(record_learn_job(conn, automation_id, &recorded)?)
            })
            .await?;
            Ok(job_id)
        }
        Err(err) => {
            warn!(issuer_id = %automation.issuer_id, error = %err, "failed to start learn job");
            let issuer_id = automation.issuer_id.clone();
            let reason = format!("learn job could not be started: {err}");
            let failed = run_blocking(&state.pool, move |conn| {
                conn.transaction::<_, AutoChallengeError, _>(|conn| {
                    transition(
                        conn,
                        &issuer_id,
                        AutomationStatus::Failed,
                        TransitionUpdate {
                            failure_reason: Some(reason),
                            ..Default::default()
                        },
                    )?;
                    Ok(fail_awaiting_recipe(
                        conn,
                        &issuer_id,
                        "automation for this issuer could not be learned",
                    )?)
                })
            })
            .await?;
            if failed > 0 {
                info!(issuer_id = %automation.issuer_id, failed, "failed challenges waiting on recipe");
            }
            Err(err.into())
        }
    }
}

/// Replays a VERIFIED recipe on the remote worker. The challenge row is
/// written first, already marked as a remote run, so the worker has an id
/// to report against; if the start call fails it is marked ERROR.
pub async fn start_remote_run(
    state: &AppState,
    bundle: &TicketBundle,
    automation: &IssuerAutomation,
    reason: ChallengeReason,
    custom_reason: Option<String>,
) -> Result<AutoChallengeResult, AutoChallengeError> {
    let recipe = executable_recipe(automation)?;
    let ticket_id = bundle.ticket.id;
    let inserted = run_blocking(&state.pool, move |conn| {
        conn.transaction::<_, AutoChallengeError, _>(|conn| {
            if let Some(existing) = find_pending_auto_challenge(conn, ticket_id, reason.as_str())? {
                return Ok(Err(existing));
            }
            Ok(Ok(insert_auto_challenge(
                conn,
                Uuid::new_v4(),
                ticket_id,
                reason.as_str(),
                custom_reason,
                Some(&ChallengeMetadata::RemoteRun { run_job_id: None }),
            )?))
        })
    })
    .await?;
    let challenge = match inserted {
        Ok(challenge) => challenge,
        Err(existing) => return Ok(already_running(&existing)),
    };

    let evidence_urls = existing_evidence_urls(state.storage.as_ref(), &bundle.media).await;
    let context = AutomationContext::from_bundle(bundle, Some(&challenge), evidence_urls);
    submit_remote_run(state, &challenge, automation, recipe, context).await
}

/// Calls the remote worker for an existing PENDING challenge and records the
/// run job id, or marks the challenge ERROR. The challenge is marked as a
/// remote run before the call, so a result delivered before the job id is
/// recorded still applies.
pub async fn submit_remote_run(
    state: &AppState,
    challenge: &Challenge,
    automation: &IssuerAutomation,
    recipe: super::steps::Recipe,
    context: AutomationContext,
) -> Result<AutoChallengeResult, AutoChallengeError> {
    let challenge_id = challenge.id;
    let marked = matches!(
        ChallengeMetadata::from_value(&challenge.metadata),
        Some(ChallengeMetadata::RemoteRun { run_job_id: None })
    );
    if !marked {
        let pending = run_blocking(&state.pool, move |conn| {
            Ok::<_, AutoChallengeError>(update_pending_metadata(
                conn,
                challenge_id,
                &ChallengeMetadata::RemoteRun { run_job_id: None },
            )?)
        })
        .await?;
        if !pending {
            info!(%challenge_id, "challenge finished before its remote run started");
            return Ok(already_finished(challenge_id));
        }
    }

    let request = RunJobRequest {
        issuer_id: automation.issuer_id.clone(),
        challenge_id: challenge.id,
        recipe,
        context,
        callback_url: state.config.automation_webhook_url.clone(),
    };

    match state.automation.remote.start_run_job(&request).await {
        Ok(run_job_id) => {
            info!(%challenge_id, %run_job_id, "remote run started");
            let metadata = ChallengeMetadata::RemoteRun {
                run_job_id: Some(run_job_id),
            };
            let recorded = run_blocking(&state.pool, move |conn| {
                Ok::<_, AutoChallengeError>(update_pending_metadata(conn, challenge_id, &metadata)?)
            })
            .await?;
            if !recorded {
                info!(%challenge_id, "run result arrived before the job id was recorded");
            }
            Ok(AutoChallengeResult::ok(
                AutoChallengeStatus::Submitted,
                "Your challenge is being submitted to the issuer's portal.",
            )
            .with_challenge(challenge_id))
        }
        Err(err) => {
            warn!(%challenge_id, error = %err, "failed to start run job");
            let metadata = ChallengeMetadata::failed(format!("run job could not be started: {err}"));
            run_blocking(&state.pool, move |conn| {
                Ok::<_, AutoChallengeError>(finish_challenge(
                    conn,
                    challenge_id,
                    ChallengeStatus::Error,
                    &metadata,
                )?)
            })
            .await?;
            Ok(AutoChallengeResult::failed(
                "We couldn't submit your challenge automatically. Please try again later.",
                Some(err.to_string()),
            )
            .with_challenge(challenge_id))
        }
    }
}
