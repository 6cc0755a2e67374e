//! Postgres-backed job queue shared by the API and the worker.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::dsl::sql;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Jsonb};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Job, NewJob};
use crate::schema::jobs;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

/// Submit one queued automated challenge; payload `{challenge_id}`.
pub const JOB_RUN_CHALLENGE: &str = "run-challenge";
/// Look a ticket up on its issuer portal; payload `{ticket_id, pcn_number}`.
pub const JOB_VERIFY_TICKET: &str = "verify-ticket";

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

pub type JobQueueResult<T> = Result<T, JobQueueError>;

/// How a reserved job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    RetryAfter { delay: Duration, error: String },
    Failed { error: String },
}

pub fn enqueue_job(
    conn: &mut PgConnection,
    job_type: &str,
    payload: Value,
    run_after: Option<NaiveDateTime>,
) -> JobQueueResult<Job> {
    let row = NewJob {
        id: Uuid::new_v4(),
        job_type: job_type.to_string(),
        payload,
        status: STATUS_QUEUED.to_string(),
        run_after: run_after.unwrap_or_else(|| Utc::now().naive_utc()),
    };
    Ok(diesel::insert_into(jobs::table)
        .values(&row)
        .get_result(conn)?)
}

/// Jobs of one type that are still queued or running and whose payload
/// contains `payload_filter`.
pub fn count_open_jobs(
    conn: &mut PgConnection,
    job_type: &str,
    payload_filter: Value,
) -> JobQueueResult<i64> {
    Ok(jobs::table
        .filter(jobs::job_type.eq(job_type))
        .filter(jobs::status.eq_any([STATUS_QUEUED, STATUS_PROCESSING]))
        .filter(sql::<Bool>("payload @> ").bind::<Jsonb, _>(payload_filter))
        .count()
        .get_result(conn)?)
}

/// Claims the oldest due job of the given types and bumps its attempt count.
pub fn reserve_job(conn: &mut PgConnection, job_types: &[&str]) -> JobQueueResult<Option<Job>> {
    let now = Utc::now().naive_utc();
    conn.transaction(|conn| {
        let Some(next_id) = jobs::table
            .select(jobs::id)
            .filter(jobs::status.eq(STATUS_QUEUED))
            .filter(jobs::run_after.le(now))
            .filter(jobs::job_type.eq_any(job_types))
            .order(jobs::run_after.asc())
            .for_update()
            .skip_locked()
            .first::<Uuid>(conn)
            .optional()?
        else {
            return Ok(None);
        };

        let job = diesel::update(jobs::table.find(next_id))
            .set((
                jobs::status.eq(STATUS_PROCESSING),
                jobs::attempts.eq(jobs::attempts + 1),
                jobs::updated_at.eq(now),
            ))
            .get_result::<Job>(conn)?;
        Ok(Some(job))
    })
}

/// Records the outcome of a reserved job.
pub fn finish_job(conn: &mut PgConnection, job_id: Uuid, outcome: JobOutcome) -> JobQueueResult<()> {
    let now = Utc::now();
    let target = jobs::table.find(job_id);
    match outcome {
        JobOutcome::Succeeded => diesel::update(target)
            .set((
                jobs::status.eq(STATUS_SUCCEEDED),
                jobs::last_error.eq::<Option<String>>(None),
                jobs::updated_at.eq(now.naive_utc()),
            ))
            .execute(conn)?,
        JobOutcome::RetryAfter { delay, error } => {
            let delay =
                ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(30));
            diesel::update(target)
                .set((
                    jobs::status.eq(STATUS_QUEUED),
                    jobs::run_after.eq((now + delay).naive_utc()),
                    jobs::last_error.eq(Some(error)),
                    jobs::updated_at.eq(now.naive_utc()),
                ))
                .execute(conn)?
        }
        JobOutcome::Failed { error } => diesel::update(target)
            .set((
                jobs::status.eq(STATUS_FAILED),
                jobs::last_error.eq(Some(error)),
                jobs::updated_at.eq(now.naive_utc()),
            ))
            .execute(conn)?,
    };
    Ok(())
}
