//! Storage contract for `issuer_automations`.

use chrono::Utc;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use thiserror::Error;
use uuid::Uuid;

use super::steps::{Recipe, RecipeError};
use crate::models::{IssuerAutomation, NewIssuerAutomation};
use crate::schema::issuer_automations;
use crate::status::{AutomationStatus, UnknownStatus};

#[derive(Debug, Error)]
pub enum RecipeStoreError {
    #[error("no automation recorded for issuer `{0}`")]
    NotFound(String),
    #[error("automation cannot move from {from} to {to}")]
    InvalidTransition {
        from: AutomationStatus,
        to: AutomationStatus,
    },
    #[error("automation is {0}, only VERIFIED recipes run")]
    NotExecutable(AutomationStatus),
    #[error("stored recipe is invalid: {0}")]
    InvalidRecipe(#[from] RecipeError),
    #[error(transparent)]
    UnknownStatus(#[from] UnknownStatus),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type RecipeStoreResult<T> = Result<T, RecipeStoreError>;

pub fn status_of(automation: &IssuerAutomation) -> RecipeStoreResult<AutomationStatus> {
    Ok(automation.status.parse()?)
}

pub fn find_by_issuer(
    conn: &mut PgConnection,
    issuer_id: &str,
) -> RecipeStoreResult<Option<IssuerAutomation>> {
    Ok(issuer_automations::table
        .filter(issuer_automations::issuer_id.eq(issuer_id))
        .first(conn)
        .optional()?)
}

/// Same as [`find_by_issuer`], holding a row lock until the transaction ends.
pub fn lock_by_issuer(
    conn: &mut PgConnection,
    issuer_id: &str,
) -> RecipeStoreResult<Option<IssuerAutomation>> {
    Ok(issuer_automations::table
        .filter(issuer_automations::issuer_id.eq(issuer_id))
        .for_update()
        .first(conn)
        .optional()?)
}

pub fn list(conn: &mut PgConnection) -> RecipeStoreResult<Vec<IssuerAutomation>> {
    Ok(issuer_automations::table
        .order(issuer_automations::issuer_name.asc())
        .load(conn)?)
}

/// Creates the LEARNING row for an issuer. Returns `None` when another
/// request already created it, so exactly one caller starts the learn job.
pub fn insert_learning(
    conn: &mut PgConnection,
    issuer_id: &str,
    issuer_name: &str,
    challenge_url: Option<&str>,
) -> RecipeStoreResult<Option<IssuerAutomation>> {
    let row = NewIssuerAutomation {
        id: Uuid::new_v4(),
        issuer_id: issuer_id.to_string(),
        issuer_name: issuer_name.to_string(),
        status: AutomationStatus::Learning.as_str().to_string(),
        steps: None,
        challenge_url: challenge_url.map(str::to_string),
    };
    Ok(diesel::insert_into(issuer_automations::table)
        .values(&row)
        .on_conflict(issuer_automations::issuer_id)
        .do_nothing()
        .get_result(conn)
        .optional()?)
}

pub fn record_learn_job(
    conn: &mut PgConnection,
    automation_id: Uuid,
    job_id: &str,
) -> RecipeStoreResult<()> {
    diesel::update(issuer_automations::table.find(automation_id))
        .set((
            issuer_automations::learn_job_id.eq(Some(job_id)),
            issuer_automations::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(())
}

/// Requested change to an automation record.
#[derive(Debug, Default, Clone)]
pub struct TransitionUpdate {
    pub steps: Option<Recipe>,
    pub challenge_url: Option<String>,
    pub failure_reason: Option<String>,
    /// Replaces the stored learn job id when re-learning.
    pub learn_job_id: Option<String>,
}

/// Moves an automation along the allowed transitions, locking the row.
pub fn transition(
    conn: &mut PgConnection,
    issuer_id: &str,
    to: AutomationStatus,
    update: TransitionUpdate,
) -> RecipeStoreResult<IssuerAutomation> {
    conn.transaction(|conn| {
        let current = lock_by_issuer(conn, issuer_id)?
            .ok_or_else(|| RecipeStoreError::NotFound(issuer_id.to_string()))?;
        apply_transition(conn, &current, to, update)
    })
}

/// Same as [`transition`] for a row the caller has already locked.
pub fn apply_transition(
    conn: &mut PgConnection,
    current: &IssuerAutomation,
    to: AutomationStatus,
    update: TransitionUpdate,
) -> RecipeStoreResult<IssuerAutomation> {
    let from = status_of(current)?;
    if !from.can_transition_to(to) {
        return Err(RecipeStoreError::InvalidTransition { from, to });
    }

    let steps = match update.steps {
        Some(recipe) => {
            recipe.validate()?;
            Some(recipe.to_json())
        }
        None => current.steps.clone(),
    };
    if to == AutomationStatus::Verified {
        let stored = steps.as_ref().ok_or(RecipeError::Empty)?;
        Recipe::from_json(stored)?;
    }

    let failure_reason = match to {
        AutomationStatus::NeedsHumanHelp | AutomationStatus::Failed => update.failure_reason,
        _ => None,
    };
    let challenge_url = update.challenge_url.or_else(|| current.challenge_url.clone());
    let learn_job_id = match to {
        AutomationStatus::Learning => update.learn_job_id,
        _ => current.learn_job_id.clone(),
    };

    Ok(diesel::update(issuer_automations::table.find(current.id))
        .set((
            issuer_automations::status.eq(to.as_str()),
            issuer_automations::steps.eq(steps),
            issuer_automations::challenge_url.eq(challenge_url),
            issuer_automations::failure_reason.eq(failure_reason),
            issuer_automations::learn_job_id.eq(learn_job_id),
            issuer_automations::updated_at.eq(Utc::now().naive_utc()),
        ))
        .get_result(conn)?)
}

/// The recipe to replay, refusing anything not VERIFIED.
pub fn executable_recipe(automation: &IssuerAutomation) -> RecipeStoreResult<Recipe> {
    let status = status_of(automation)?;
    if !status.is_executable() {
        return Err(RecipeStoreError::NotExecutable(status));
    }
    let steps = automation.steps.as_ref().ok_or(RecipeError::Empty)?;
    Ok(Recipe::from_json(steps)?)
}
