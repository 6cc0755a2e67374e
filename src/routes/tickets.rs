use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    automation::{
        challenges::list_for_ticket,
        context::{load_ticket, TicketBundle},
        initiate_auto_challenge,
        AutoChallengeResult, ChallengeReason,
    },
    error::{AppError, AppResult},
    jobs::{count_open_jobs, enqueue_job, JOB_VERIFY_TICKET},
    models::{Challenge, Ticket},
    state::AppState,
};

#[derive(Serialize)]
pub struct ChallengeResponse {
    pub id: Uuid,
    pub challenge_type: String,
    pub reason: String,
    pub custom_reason: Option<String>,
    pub status: String,
    pub metadata: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl From<Challenge> for ChallengeResponse {
    fn from(value: Challenge) -> Self {
        Self {
            id: value.id,
            challenge_type: value.challenge_type,
            reason: value.reason,
            custom_reason: value.custom_reason,
            status: value.status,
            metadata: value.metadata,
            created_at: value.created_at,
            updated_at: value.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct TicketResponse {
    pub id: Uuid,
    pub pcn_number: String,
    pub issuer: String,
    pub issuer_type: String,
    pub contravention_code: Option<String>,
    pub initial_amount: i32,
    pub status: String,
    pub portal_status: Option<String>,
    pub issued_at: NaiveDateTime,
    pub last_verified_at: Option<NaiveDateTime>,
    pub vehicle_registration: String,
    pub challenges: Vec<ChallengeResponse>,
}

impl TicketResponse {
    fn new(ticket: Ticket, vehicle_registration: String, challenges: Vec<Challenge>) -> Self {
        Self {
            id: ticket.id,
            pcn_number: ticket.pcn_number,
            issuer: ticket.issuer,
            issuer_type: ticket.issuer_type,
            contravention_code: ticket.contravention_code,
            initial_amount: ticket.initial_amount,
            status: ticket.status,
            portal_status: ticket.portal_status,
            issued_at: ticket.issued_at,
            last_verified_at: ticket.last_verified_at,
            vehicle_registration,
            challenges: challenges.into_iter().map(ChallengeResponse::from).collect(),
        }
    }
}

#[derive(Deserialize)]
pub struct AutoChallengeRequest {
    pub reason: String,
    #[serde(default)]
    pub custom_reason: Option<String>,
}

#[derive(Serialize)]
pub struct VerifyResponse {
    pub queued: bool,
    pub job_id: Option<Uuid>,
}

/// Owner of the ticket, or an admin. Unknown tickets and tickets owned by
/// someone else both answer 404.
fn ensure_ticket_access(
    state: &AppState,
    user: &AuthenticatedUser,
    ticket_id: Uuid,
) -> AppResult<TicketBundle> {
    let mut conn = state.db()?;
    let bundle = load_ticket(&mut conn, ticket_id)?.ok_or_else(AppError::not_found)?;
    if bundle.user.id != user.user_id && !user.is_admin() {
        return Err(AppError::not_found());
    }
    Ok(bundle)
}

pub async fn get_ticket(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(ticket_id): Path<Uuid>,
) -> AppResult<Json<TicketResponse>> {
    let bundle = ensure_ticket_access(&state, &user, ticket_id)?;
    let mut conn = state.db()?;
    let challenges = list_for_ticket(&mut conn, ticket_id)?;
    Ok(Json(TicketResponse::new(
        bundle.ticket,
        bundle.vehicle.registration,
        challenges,
    )))
}

pub async fn auto_challenge(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(ticket_id): Path<Uuid>,
    Json(payload): Json<AutoChallengeRequest>,
) -> AppResult<Json<AutoChallengeResult>> {
    let reason = payload
        .reason
        .parse::<ChallengeReason>()
        .map_err(|err| AppError::bad_request(err.to_string()))?;
    ensure_ticket_access(&state, &user, ticket_id)?;

    let custom_reason = payload
        .custom_reason
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty());
    let result = initiate_auto_challenge(&state, ticket_id, reason, custom_reason).await;
    Ok(Json(result))
}

pub async fn verify_ticket(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(ticket_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<VerifyResponse>)> {
    let bundle = ensure_ticket_access(&state, &user, ticket_id)?;
    let mut conn = state.db()?;

    let open = count_open_jobs(&mut conn, JOB_VERIFY_TICKET, json!({ "ticket_id": ticket_id }))
        .map_err(AppError::internal)?;
    if open > 0 {
        return Ok((
            StatusCode::OK,
            Json(VerifyResponse {
                queued: false,
                job_id: None,
            }),
        ));
    }

    let job = enqueue_job(
        &mut conn,
        JOB_VERIFY_TICKET,
        json!({ "ticket_id": ticket_id, "pcn_number": bundle.ticket.pcn_number }),
        None,
    )
    .map_err(AppError::internal)?;
    tracing::info!(%ticket_id, job_id = %job.id, "ticket verification queued");

    Ok((
        StatusCode::ACCEPTED,
        Json(VerifyResponse {
            queued: true,
            job_id: Some(job.id),
        }),
    ))
}
