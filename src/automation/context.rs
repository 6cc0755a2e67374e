use std::collections::HashMap;

use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Challenge, Media, Ticket, User, Vehicle};
use crate::schema::{media, tickets, users, vehicles};

/// A ticket with the vehicle, owner and media a run needs.
#[derive(Debug, Clone)]
pub struct TicketBundle {
    pub ticket: Ticket,
    pub vehicle: Vehicle,
    pub user: User,
    pub media: Vec<Media>,
}

fn load_bundle(
    conn: &mut PgConnection,
    row: Option<(Ticket, (Vehicle, User))>,
) -> QueryResult<Option<TicketBundle>> {
    let Some((ticket, (vehicle, user))) = row else {
        return Ok(None);
    };
    let media = media::table
        .filter(media::ticket_id.eq(ticket.id))
        .order(media::created_at.asc())
        .load::<Media>(conn)?;
    Ok(Some(TicketBundle {
        ticket,
        vehicle,
        user,
        media,
    }))
}

pub fn load_ticket_by_pcn(
    conn: &mut PgConnection,
    pcn_number: &str,
) -> QueryResult<Option<TicketBundle>> {
    let row = tickets::table
        .inner_join(vehicles::table.inner_join(users::table))
        .filter(tickets::pcn_number.eq(pcn_number))
        .first::<(Ticket, (Vehicle, User))>(conn)
        .optional()?;
    load_bundle(conn, row)
}

pub fn load_ticket(conn: &mut PgConnection, ticket_id: Uuid) -> QueryResult<Option<TicketBundle>> {
    let row = tickets::table
        .inner_join(vehicles::table.inner_join(users::table))
        .filter(tickets::id.eq(ticket_id))
        .first::<(Ticket, (Vehicle, User))>(conn)
        .optional()?;
    load_bundle(conn, row)
}

/// Motorist and ticket details a recipe can reference as `{{field}}`.
///
/// The same structure is posted to the remote worker for recipe runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationContext {
    pub pcn_number: String,
    pub vrm: String,
    pub issuer: String,
    pub contravention_code: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub email: String,
    pub phone_number: Option<String>,
    pub address_line1: String,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub county: Option<String>,
    pub postcode: String,
    pub challenge_reason: Option<String>,
    pub custom_reason: Option<String>,
    pub evidence_urls: Vec<String>,
}

/// Splits a profile name into first name and the remainder.
pub fn split_name(full_name: &str) -> (String, String) {
    let mut parts = full_name.split_whitespace();
    let first = parts.next().unwrap_or_default().to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, rest)
}

impl AutomationContext {
    pub fn from_bundle(
        bundle: &TicketBundle,
        challenge: Option<&Challenge>,
        evidence_urls: Vec<String>,
    ) -> Self {
        Self::build(
            &bundle.user,
            &bundle.vehicle,
            &bundle.ticket,
            challenge,
            evidence_urls,
        )
    }

    pub fn build(
        user: &User,
        vehicle: &Vehicle,
        ticket: &Ticket,
        challenge: Option<&Challenge>,
        evidence_urls: Vec<String>,
    ) -> Self {
        let full_name = user.name.clone().unwrap_or_default().trim().to_string();
        let (first_name, last_name) = split_name(&full_name);
        Self {
            pcn_number: ticket.pcn_number.clone(),
            vrm: vehicle.registration.replace(' ', "").to_ascii_uppercase(),
            issuer: ticket.issuer.clone(),
            contravention_code: ticket.contravention_code.clone(),
            first_name,
            last_name,
            full_name,
            email: user.email.clone(),
            phone_number: user.phone_number.clone(),
            address_line1: user.address_line1.clone().unwrap_or_default(),
            address_line2: user.address_line2.clone(),
            city: user.city.clone(),
            county: user.county.clone(),
            postcode: user.postcode.clone().unwrap_or_default(),
            challenge_reason: challenge.map(|c| c.reason.clone()),
            custom_reason: challenge.and_then(|c| c.custom_reason.clone()),
            evidence_urls,
        }
    }

    /// Template variables. Optional fields resolve to an empty string so a
    /// recipe never fails on a blank profile field it merely echoes.
    pub fn variables(&self) -> HashMap<String, String> {
        let optional = |value: &Option<String>| value.clone().unwrap_or_default();
        HashMap::from([
            ("pcn_number".to_string(), self.pcn_number.clone()),
            ("vrm".to_string(), self.vrm.clone()),
            ("issuer".to_string(), self.issuer.clone()),
            (
                "contravention_code".to_string(),
                optional(&self.contravention_code),
            ),
            ("first_name".to_string(), self.first_name.clone()),
            ("last_name".to_string(), self.last_name.clone()),
            ("full_name".to_string(), self.full_name.clone()),
            ("email".to_string(), self.email.clone()),
            ("phone_number".to_string(), optional(&self.phone_number)),
            ("address_line1".to_string(), self.address_line1.clone()),
            ("address_line2".to_string(), optional(&self.address_line2)),
            ("city".to_string(), optional(&self.city)),
            ("county".to_string(), optional(&self.county)),
            ("postcode".to_string(), self.postcode.clone()),
            ("custom_reason".to_string(), optional(&self.custom_reason)),
        ])
    }
}
