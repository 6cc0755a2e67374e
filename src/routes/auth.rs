use axum::{extract::State, Json};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    auth::{password, AuthenticatedUser},
    db::run_blocking,
    error::{AppError, AppResult},
    models::User,
    schema::users,
    state::AppState,
};

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
}

/// Exchanges email and password for a bearer token. Unknown emails and wrong
/// passwords are indistinguishable to the caller.
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let email = payload.email.trim().to_ascii_lowercase();
    let lookup = email.clone();
    // Hash verification is CPU-bound; keep it off the async workers too.
    let user = run_blocking(&state.pool, move |conn| {
        let user = users::table
            .filter(users::email.eq(&lookup))
            .first::<User>(conn)
            .optional()?;
        Ok::<_, AppError>(user.filter(|user| {
            password::verify_password(&payload.password, &user.password_hash).unwrap_or(false)
        }))
    })
    .await?;

    let Some(user) = user else {
        info!(%email, "rejected login");
        return Err(AppError::unauthorized());
    };

    let access_token = state.jwt.generate_token(user.id, &user.email, &user.role)?;
    Ok(Json(LoginResponse {
        access_token,
        token_type: "Bearer",
        expires_in: state.config.jwt_expiry_minutes * 60,
    }))
}

pub async fn me(user: AuthenticatedUser) -> Json<AuthenticatedUser> {
    Json(user)
}
