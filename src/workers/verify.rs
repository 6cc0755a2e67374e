use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use serde::Deserialize;
use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    automation::{dispatch, AutomationError, Intent},
    jobs::JOB_VERIFY_TICKET,
    models::Job,
    schema::tickets,
    state::AppState,
};

use super::{JobExecution, JobHandler, MAX_LAUNCH_ATTEMPTS};

#[derive(Debug, Deserialize)]
struct VerifyTicketPayload {
    ticket_id: Uuid,
    pcn_number: String,
}

/// Looks the ticket up on the issuer's portal and records what it says.
pub struct VerifyTicketJob;

impl VerifyTicketJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for VerifyTicketJob {
    fn job_type(&self) -> &'static str {
        JOB_VERIFY_TICKET
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let payload: VerifyTicketPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid verify-ticket payload: {err}"),
                }
            }
        };

        let report = match dispatch(&state, &payload.pcn_number, Intent::Verify, None, None).await {
            Ok(report) => report,
            Err(err) if err.is_transient() && job.attempts < MAX_LAUNCH_ATTEMPTS => {
                warn!(pcn_number = %payload.pcn_number, error = %err, "verification will retry");
                return JobExecution::Retry {
                    delay: Duration::from_secs(60),
                    error: err.to_string(),
                };
            }
            Err(AutomationError::StepFailed {
                position,
                kind,
                message,
                ..
            }) => {
                return JobExecution::Failed {
                    error: format!("step {position} ({kind}) failed: {message}"),
                }
            }
            Err(err) => {
                return JobExecution::Failed {
                    error: err.to_string(),
                }
            }
        };

        let portal_status = report.captured.get("portal_status").cloned();
        let ticket_id = payload.ticket_id;
        let pool = state.pool.clone();
        let status_for_update = portal_status.clone();
        let result = task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|err| format!("{err:?}"))?;
            let now = Utc::now().naive_utc();
            diesel::update(tickets::table.find(ticket_id))
                .set((
                    tickets::portal_status.eq(status_for_update),
                    tickets::last_verified_at.eq(Some(now)),
                    tickets::updated_at.eq(now),
                ))
                .execute(&mut conn)
                .map_err(|err| format!("{err:?}"))
        })
        .await;

        match result {
            Ok(Ok(_)) => {
                info!(%ticket_id, portal_status = ?portal_status, "ticket verified");
                JobExecution::Success
            }
            Ok(Err(err)) => JobExecution::Retry {
                delay: Duration::from_secs(30),
                error: err,
            },
            Err(join_err) => JobExecution::Retry {
                delay: Duration::from_secs(60),
                error: format!("worker panicked: {join_err}"),
            },
        }
    }
}
