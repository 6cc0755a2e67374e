use chrono::NaiveDateTime;
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub name: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub postcode: Option<String>,
    pub phone_number: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Default, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub name: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub postcode: Option<String>,
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = vehicles)]
#[diesel(belongs_to(User))]
pub struct Vehicle {
    pub id: Uuid,
    pub user_id: Uuid,
    pub registration: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = vehicles)]
pub struct NewVehicle {
    pub id: Uuid,
    pub user_id: Uuid,
    pub registration: String,
    pub make: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = tickets)]
#[diesel(belongs_to(Vehicle))]
pub struct Ticket {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub pcn_number: String,
    pub issuer: String,
    pub issuer_type: String,
    pub contravention_code: Option<String>,
    pub initial_amount: i32,
    pub status: String,
    pub portal_status: Option<String>,
    pub issued_at: NaiveDateTime,
    pub last_verified_at: Option<NaiveDateTime>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tickets)]
pub struct NewTicket {
    pub id: Uuid,
    pub vehicle_id: Uuid,
    pub pcn_number: String,
    pub issuer: String,
    pub issuer_type: String,
    pub contravention_code: Option<String>,
    pub initial_amount: i32,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = challenges)]
#[diesel(belongs_to(Ticket))]
pub struct Challenge {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub challenge_type: String,
    pub reason: String,
    pub custom_reason: Option<String>,
    pub status: String,
    pub metadata: serde_json::Value,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = challenges)]
pub struct NewChallenge {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub challenge_type: String,
    pub reason: String,
    pub custom_reason: Option<String>,
    pub status: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = issuer_automations)]
pub struct IssuerAutomation {
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

#[derive(Debug, Insertable)]
#[diesel(table_name = issuer_automations)]
pub struct NewIssuerAutomation {
    pub id: Uuid,
    pub issuer_id: String,
    pub issuer_name: String,
    pub status: String,
    pub steps: Option<serde_json::Value>,
    pub challenge_url: Option<String>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Associations)]
#[diesel(table_name = media)]
#[diesel(belongs_to(Ticket))]
pub struct Media {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub s3_key: String,
    pub media_type: String,
    pub source: String,
    pub description: Option<String>,
    pub content_hash: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = media)]
pub struct NewMedia {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub s3_key: String,
    pub media_type: String,
    pub source: String,
    pub description: Option<String>,
    pub content_hash: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub run_after: NaiveDateTime,
    pub last_error: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: NaiveDateTime,
}
