use axum::{
    extract::{Path, State},
    Json,
};
use chrono::NaiveDateTime;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    automation::{
        recipes,
        review::{review_automation, ReviewRequest},
    },
    error::AppResult,
    models::IssuerAutomation,
    state::AppState,
};

#[derive(Serialize)]
pub struct AutomationResponse {
    pub id: Uuid,
    pub issuer_id: String,
    pub issuer_name: String,
    pub status: String,
    pub steps: Option<serde_json::Value>,
    pub challenge_url: Option<String>,
    pub failure_reason: Option<String>,
    pub learn_job_id: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<IssuerAutomation> for AutomationResponse {
    fn from(value: IssuerAutomation) -> Self {
        Self {
            id: value.id,
            issuer_id: value.issuer_id,
            issuer_name: value.issuer_name,
            status: value.status,
            steps: value.steps,
            challenge_url: value.challenge_url,
            failure_reason: value.failure_reason,
            learn_job_id: value.learn_job_id,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

pub async fn list_automations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> AppResult<Json<Vec<AutomationResponse>>> {
    user.require_admin()?;
    let mut conn = state.db()?;
    let rows = recipes::list(&mut conn)?;
    Ok(Json(rows.into_iter().map(AutomationResponse::from).collect()))
}

pub async fn review(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(issuer_id): Path<String>,
    Json(payload): Json<ReviewRequest>,
) -> AppResult<Json<AutomationResponse>> {
    user.require_admin()?;
    let updated = review_automation(&state, &issuer_id, payload).await?;
    tracing::info!(%issuer_id, reviewer = %user.email, status = %updated.status, "automation review applied");
    Ok(Json(AutomationResponse::from(updated)))
}
