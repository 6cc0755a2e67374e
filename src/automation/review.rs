//! Staff review of learned recipes.

use diesel::Connection;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use super::auto_challenge::{begin_learn_job, submit_remote_run, AutoChallengeError};
use super::challenges::{awaiting_recipe, fail_awaiting_recipe, update_pending_metadata};
use super::context::{load_ticket, AutomationContext};
use super::evidence::existing_evidence_urls;
use super::metadata::ChallengeMetadata;
use super::recipes::{executable_recipe, transition, RecipeStoreError, TransitionUpdate};
use super::steps::Recipe;
use crate::config::RecipeExecution;
use crate::db::run_blocking;
use crate::jobs::{enqueue_job, JOB_RUN_CHALLENGE};
use crate::models::IssuerAutomation;
use crate::state::AppState;
use crate::status::AutomationStatus;

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewRequest {
    pub status: AutomationStatus,
    #[serde(default)]
    pub steps: Option<Value>,
    #[serde(default)]
    pub challenge_url: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
}

/// Applies a reviewer's decision and the side effects that follow it:
/// re-learning starts a new learn job, verifying releases parked
/// challenges, failing ends them.
pub async fn review_automation(
    state: &AppState,
    issuer_id: &str,
    request: ReviewRequest,
) -> Result<IssuerAutomation, AutoChallengeError> {
    let steps = request
        .steps
        .as_ref()
        .map(Recipe::from_json)
        .transpose()
        .map_err(RecipeStoreError::from)?;
    let to = request.status;
    let update = TransitionUpdate {
        steps,
        challenge_url: request.challenge_url,
        failure_reason: request.failure_reason,
        learn_job_id: None,
    };

    let key = issuer_id.to_string();
    let updated = run_blocking(&state.pool, move |conn| {
        Ok::<_, AutoChallengeError>(transition(conn, &key, to, update)?)
    })
    .await?;
    info!(%issuer_id, status = %to, "automation reviewed");

    match to {
        AutomationStatus::Learning => {
            begin_learn_job(state, &updated).await?;
        }
        AutomationStatus::Verified => {
            let released = release_awaiting(state, &updated).await?;
            info!(%issuer_id, released, "released challenges waiting on recipe");
        }
        AutomationStatus::Failed => {
            let key = issuer_id.to_string();
            let failed = run_blocking(&state.pool, move |conn| {
                Ok::<_, AutoChallengeError>(fail_awaiting_recipe(
                    conn,
                    &key,
                    "automation for this issuer was withdrawn",
                )?)
            })
            .await?;
            info!(%issuer_id, failed, "failed challenges waiting on recipe");
        }
        AutomationStatus::PendingReview | AutomationStatus::NeedsHumanHelp => {}
    }

    let key = issuer_id.to_string();
    run_blocking(&state.pool, move |conn| {
        super::recipes::find_by_issuer(conn, &key)?
            .ok_or_else(|| AutoChallengeError::from(RecipeStoreError::NotFound(key.clone())))
    })
    .await
}

/// Starts every challenge parked on a newly verified automation.
async fn release_awaiting(
    state: &AppState,
    automation: &IssuerAutomation,
) -> Result<usize, AutoChallengeError> {
    let recipe = executable_recipe(automation)?;
    let key = automation.issuer_id.clone();
    let parked = run_blocking(&state.pool, move |conn| {
        Ok::<_, AutoChallengeError>(awaiting_recipe(conn, &key)?)
    })
    .await?;

    let mut released = 0;
    for challenge in parked {
        let challenge_id = challenge.id;
        match state.config.recipe_execution {
            RecipeExecution::Local => {
                run_blocking(&state.pool, move |conn| {
                    conn.transaction::<_, AutoChallengeError, _>(|conn| {
                        let job = enqueue_job(
                            conn,
                            JOB_RUN_CHALLENGE,
                            serde_json::json!({ "challenge_id": challenge_id }),
                            None,
                        )?;
                        update_pending_metadata(
                            conn,
                            challenge_id,
                            &ChallengeMetadata::Queued { job_id: job.id },
                        )?;
                        Ok(())
                    })
                })
                .await?;
            }
            RecipeExecution::Remote => {
                let ticket_id = challenge.ticket_id;
                let bundle = run_blocking(&state.pool, move |conn| {
                    load_ticket(conn, ticket_id)?.ok_or(AutoChallengeError::TicketNotFound(ticket_id))
                })
                .await;
                let bundle = match bundle {
                    Ok(bundle) => bundle,
                    Err(err) => {
                        warn!(%challenge_id, error = %err, "cannot release challenge");
                        continue;
                    }
                };
                let evidence_urls =
                    existing_evidence_urls(state.storage.as_ref(), &bundle.media).await;
                let context = AutomationContext::from_bundle(&bundle, Some(&challenge), evidence_urls);
                submit_remote_run(state, &challenge, automation, recipe.clone(), context).await?;
            }
        }
        released += 1;
    }
    Ok(released)
}
