//! Results posted back by the remote automation worker.
//!
//! Deliveries may repeat or arrive late. A result is applied only when it
//! names the job the row is currently waiting on and the row has not
//! already reached a terminal state; anything else is acknowledged and
//! ignored.

use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::challenges::{fail_awaiting_recipe, finish_challenge, lock_challenge};
use super::metadata::ChallengeMetadata;
use super::recipes::{
    apply_transition, lock_by_issuer, status_of, RecipeStoreError, TransitionUpdate,
};
use super::steps::Recipe;
use crate::status::{AutomationStatus, ChallengeStatus};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AutomationWebhook {
    Learn {
        job_id: String,
        issuer_id: String,
        #[serde(flatten)]
        outcome: LearnOutcome,
    },
    Run {
        job_id: String,
        challenge_id: Uuid,
        #[serde(flatten)]
        outcome: RunResult,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LearnOutcome {
    Learned {
        steps: Value,
        #[serde(default)]
        challenge_url: Option<String>,
    },
    NeedsHumanHelp {
        reason: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunResult {
    Succeeded {
        #[serde(default)]
        completed_steps: usize,
        #[serde(default)]
        screenshots: Vec<String>,
        #[serde(default)]
        generated_text: Option<String>,
        #[serde(default)]
        confirmation_reference: Option<String>,
    },
    Failed {
        error: String,
        #[serde(default)]
        failed_step: Option<String>,
        #[serde(default)]
        completed_steps: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub applied: bool,
    pub detail: String,
}

impl WebhookAck {
    fn applied(detail: impl Into<String>) -> Self {
        Self {
            applied: true,
            detail: detail.into(),
        }
    }

    fn ignored(detail: impl Into<String>) -> Self {
        Self {
            applied: false,
            detail: detail.into(),
        }
    }
}

pub fn apply_webhook(
    conn: &mut PgConnection,
    webhook: AutomationWebhook,
) -> Result<WebhookAck, RecipeStoreError> {
    match webhook {
        AutomationWebhook::Learn {
            job_id,
            issuer_id,
            outcome,
        } => conn.transaction(|conn| apply_learn_result(conn, &job_id, &issuer_id, outcome)),
        AutomationWebhook::Run {
            job_id,
            challenge_id,
            outcome,
        } => conn
            .transaction(|conn| apply_run_result(conn, &job_id, challenge_id, outcome))
            .map_err(RecipeStoreError::from),
    }
}

fn apply_learn_result(
    conn: &mut PgConnection,
    job_id: &str,
    issuer_id: &str,
    outcome: LearnOutcome,
) -> Result<WebhookAck, RecipeStoreError> {
    let Some(automation) = lock_by_issuer(conn, issuer_id)? else {
        warn!(%issuer_id, %job_id, "learn result for unknown issuer");
        return Ok(WebhookAck::ignored("unknown issuer"));
    };

    let status = status_of(&automation)?;
    if status != AutomationStatus::Learning {
        info!(%issuer_id, %job_id, %status, "learn result arrived after automation moved on");
        return Ok(WebhookAck::ignored(format!("automation is {status}")));
    }
    if automation.learn_job_id.as_deref() != Some(job_id) {
        warn!(
            %issuer_id,
            %job_id,
            expected = ?automation.learn_job_id,
            "learn result for a different job"
        );
        return Ok(WebhookAck::ignored("job id does not match"));
    }

    let (to, update) = match outcome {
        LearnOutcome::Learned {
            steps,
            challenge_url,
        } => match Recipe::from_json(&steps) {
            Ok(recipe) => (
                AutomationStatus::PendingReview,
                TransitionUpdate {
                    steps: Some(recipe),
                    challenge_url,
                    ..Default::default()
                },
            ),
            Err(err) => (
                AutomationStatus::NeedsHumanHelp,
                TransitionUpdate {
                    challenge_url,
                    failure_reason: Some(format!("learned recipe rejected: {err}")),
                    ..Default::default()
                },
            ),
        },
        LearnOutcome::NeedsHumanHelp { reason } => (
            AutomationStatus::NeedsHumanHelp,
            TransitionUpdate {
                failure_reason: Some(reason),
                ..Default::default()
            },
        ),
        LearnOutcome::Failed { error } => (
            AutomationStatus::Failed,
            TransitionUpdate {
                failure_reason: Some(error),
                ..Default::default()
            },
        ),
    };

    let updated = apply_transition(conn, &automation, to, update)?;
    if to == AutomationStatus::Failed {
        let failed = fail_awaiting_recipe(
            conn,
            issuer_id,
            "automation for this issuer could not be learned",
        )?;
        info!(%issuer_id, failed, "failed challenges waiting on recipe");
    }
    info!(%issuer_id, %job_id, status = %updated.status, "learn result applied");
    Ok(WebhookAck::applied(format!("automation is {}", updated.status)))
}

fn apply_run_result(
    conn: &mut PgConnection,
    job_id: &str,
    challenge_id: Uuid,
    outcome: RunResult,
) -> QueryResult<WebhookAck> {
    let Some(challenge) = lock_challenge(conn, challenge_id)? else {
        warn!(%challenge_id, %job_id, "run result for unknown challenge");
        return Ok(WebhookAck::ignored("unknown challenge"));
    };

    if challenge.status != ChallengeStatus::Pending.as_str() {
        info!(%challenge_id, %job_id, status = %challenge.status, "duplicate run result");
        return Ok(WebhookAck::ignored(format!(
            "challenge is already {}",
            challenge.status
        )));
    }
    match ChallengeMetadata::from_value(&challenge.metadata) {
        // The worker can report before the start call's job id is recorded.
        Some(ChallengeMetadata::RemoteRun { run_job_id: None }) => {}
        Some(ChallengeMetadata::RemoteRun {
            run_job_id: Some(expected),
        }) if expected == job_id => {}
        _ => {
            warn!(%challenge_id, %job_id, "run result for a job this challenge is not waiting on");
            return Ok(WebhookAck::ignored("job id does not match"));
        }
    }

    let (status, metadata) = match outcome {
        RunResult::Succeeded {
            completed_steps,
            screenshots,
            generated_text,
            confirmation_reference,
        } => (
            ChallengeStatus::Success,
            ChallengeMetadata::Completed {
                completed_steps,
                evidence: screenshots,
                generated_text,
                confirmation_reference,
            },
        ),
        RunResult::Failed {
            error,
            failed_step,
            completed_steps,
        } => (
            ChallengeStatus::Error,
            ChallengeMetadata::Failed {
                error,
                failed_step,
                completed_steps,
            },
        ),
    };

    finish_challenge(conn, challenge_id, status, &metadata)?;
    info!(%challenge_id, %job_id, %status, "run result applied");
    Ok(WebhookAck::applied(format!("challenge is {status}")))
}
