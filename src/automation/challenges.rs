//! Challenge rows written by the automation paths.
//!
//! Status only ever moves from PENDING to SUCCESS or ERROR; every terminal
//! update is guarded on the row still being PENDING.

use chrono::{NaiveDateTime, Utc};
use diesel::dsl::sql;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Jsonb};
use serde_json::json;
use uuid::Uuid;

use super::metadata::ChallengeMetadata;
use crate::models::{Challenge, NewChallenge};
use crate::schema::challenges;
use crate::status::{ChallengeStatus, ChallengeType};

pub fn insert_auto_challenge(
    conn: &mut PgConnection,
    id: Uuid,
    ticket_id: Uuid,
    reason: &str,
    custom_reason: Option<String>,
    metadata: Option<&ChallengeMetadata>,
) -> QueryResult<Challenge> {
    let row = NewChallenge {
        id,
        ticket_id,
        challenge_type: ChallengeType::AutoChallenge.as_str().to_string(),
        reason: reason.to_string(),
        custom_reason,
        status: ChallengeStatus::Pending.as_str().to_string(),
        metadata: metadata
            .map(ChallengeMetadata::to_value)
            .unwrap_or_else(|| serde_json::json!({})),
    };
    diesel::insert_into(challenges::table)
        .values(&row)
        .get_result(conn)
}

pub fn find_challenge(conn: &mut PgConnection, id: Uuid) -> QueryResult<Option<Challenge>> {
    challenges::table.find(id).first(conn).optional()
}

pub fn lock_challenge(conn: &mut PgConnection, id: Uuid) -> QueryResult<Option<Challenge>> {
    challenges::table.find(id).for_update().first(conn).optional()
}

/// A PENDING automated challenge already running for this ticket and reason.
pub fn find_pending_auto_challenge(
    conn: &mut PgConnection,
    ticket_id: Uuid,
    reason: &str,
) -> QueryResult<Option<Challenge>> {
    challenges::table
        .filter(challenges::ticket_id.eq(ticket_id))
        .filter(challenges::challenge_type.eq(ChallengeType::AutoChallenge.as_str()))
        .filter(challenges::reason.eq(reason))
        .filter(challenges::status.eq(ChallengeStatus::Pending.as_str()))
        .order(challenges::created_at.desc())
        .first(conn)
        .optional()
}

pub fn list_for_ticket(conn: &mut PgConnection, ticket_id: Uuid) -> QueryResult<Vec<Challenge>> {
    challenges::table
        .filter(challenges::ticket_id.eq(ticket_id))
        .order(challenges::created_at.desc())
        .load(conn)
}

/// Replaces metadata on a still-PENDING challenge. Returns whether a row
/// was updated.
pub fn update_pending_metadata(
    conn: &mut PgConnection,
    id: Uuid,
    metadata: &ChallengeMetadata,
) -> QueryResult<bool> {
    let updated = diesel::update(
        challenges::table
            .find(id)
            .filter(challenges::status.eq(ChallengeStatus::Pending.as_str())),
    )
    .set((
        challenges::metadata.eq(metadata.to_value()),
        challenges::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;
    Ok(updated == 1)
}

/// Moves a PENDING challenge to a terminal status. Returns `false` when the
/// challenge was already terminal.
pub fn finish_challenge(
    conn: &mut PgConnection,
    id: Uuid,
    status: ChallengeStatus,
    metadata: &ChallengeMetadata,
) -> QueryResult<bool> {
    debug_assert!(status.is_terminal());
    let updated = diesel::update(
        challenges::table
            .find(id)
            .filter(challenges::status.eq(ChallengeStatus::Pending.as_str())),
    )
    .set((
        challenges::status.eq(status.as_str()),
        challenges::metadata.eq(metadata.to_value()),
        challenges::updated_at.eq(Utc::now().naive_utc()),
    ))
    .execute(conn)?;
    Ok(updated == 1)
}

/// PENDING challenges parked until the recipe for `issuer_id` is ready,
/// oldest first.
pub fn awaiting_recipe(conn: &mut PgConnection, issuer_id: &str) -> QueryResult<Vec<Challenge>> {
    let parked = json!({ "state": "awaiting_recipe", "issuer_id": issuer_id });
    challenges::table
        .filter(challenges::status.eq(ChallengeStatus::Pending.as_str()))
        .filter(challenges::challenge_type.eq(ChallengeType::AutoChallenge.as_str()))
        .filter(sql::<Bool>("metadata @> ").bind::<Jsonb, _>(parked))
        .order(challenges::created_at.asc())
        .load(conn)
}

/// Marks PENDING challenges without any job reference, created before
/// `cutoff`, as ERROR. Returns the swept ids.
pub fn sweep_orphans(conn: &mut PgConnection, cutoff: NaiveDateTime) -> QueryResult<Vec<Uuid>> {
    conn.transaction(|conn| {
        let candidates: Vec<Challenge> = challenges::table
            .filter(challenges::status.eq(ChallengeStatus::Pending.as_str()))
            .filter(challenges::challenge_type.eq(ChallengeType::AutoChallenge.as_str()))
            .filter(challenges::created_at.lt(cutoff))
            .for_update()
            .skip_locked()
            .load(conn)?;

        let mut swept = Vec::new();
        for challenge in candidates {
            let referenced = ChallengeMetadata::from_value(&challenge.metadata)
                .is_some_and(|metadata| metadata.has_job_reference());
            if referenced {
                continue;
            }
            let metadata = ChallengeMetadata::failed(
                "automation never started; the request was interrupted before a job was recorded",
            );
            if finish_challenge(conn, challenge.id, ChallengeStatus::Error, &metadata)? {
                swept.push(challenge.id);
            }
        }
        Ok(swept)
    })
}

/// Ends every challenge parked on `issuer_id` with an ERROR.
pub fn fail_awaiting_recipe(
    conn: &mut PgConnection,
    issuer_id: &str,
    error: &str,
) -> QueryResult<usize> {
    let mut failed = 0;
    for challenge in awaiting_recipe(conn, issuer_id)? {
        if finish_challenge(
            conn,
            challenge.id,
            ChallengeStatus::Error,
            &ChallengeMetadata::failed(error),
        )? {
            failed += 1;
        }
    }
    Ok(failed)
}
