//! Static issuer table and built-in portal recipes.

mod horizon;
mod lewisham;

pub use horizon::HORIZON_PORTAL_URL;
pub use lewisham::{selectors as lewisham_selectors, LEWISHAM_PORTAL_URL};

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::steps::Recipe;
use crate::status::IssuerType;

/// What a built-in run should do on the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Access,
    Verify,
    Challenge,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Access => "access",
            Intent::Verify => "verify",
            Intent::Challenge => "challenge",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} `{value}`")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for Intent {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "access" => Ok(Intent::Access),
            "verify" => Ok(Intent::Verify),
            "challenge" => Ok(Intent::Challenge),
            _ => Err(UnknownValue {
                kind: "intent",
                value: value.to_string(),
            }),
        }
    }
}

/// Grounds a motorist can give for disputing a PCN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChallengeReason {
    ContraventionDidNotOccur,
    NotVehicleOwner,
    VehicleStolen,
    HireFirm,
    PenaltyExceeded,
    AlreadyPaid,
    InvalidTrafficOrder,
    ProceduralImpropriety,
    SignageUnclear,
    MitigatingCircumstances,
    Other,
}

impl ChallengeReason {
    pub const ALL: [ChallengeReason; 11] = [
        ChallengeReason::ContraventionDidNotOccur,
        ChallengeReason::NotVehicleOwner,
        ChallengeReason::VehicleStolen,
        ChallengeReason::HireFirm,
        ChallengeReason::PenaltyExceeded,
        ChallengeReason::AlreadyPaid,
        ChallengeReason::InvalidTrafficOrder,
        ChallengeReason::ProceduralImpropriety,
        ChallengeReason::SignageUnclear,
        ChallengeReason::MitigatingCircumstances,
        ChallengeReason::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeReason::ContraventionDidNotOccur => "CONTRAVENTION_DID_NOT_OCCUR",
            ChallengeReason::NotVehicleOwner => "NOT_VEHICLE_OWNER",
            ChallengeReason::VehicleStolen => "VEHICLE_STOLEN",
            ChallengeReason::HireFirm => "HIRE_FIRM",
            ChallengeReason::PenaltyExceeded => "PENALTY_EXCEEDED",
            ChallengeReason::AlreadyPaid => "ALREADY_PAID",
            ChallengeReason::InvalidTrafficOrder => "INVALID_TRAFFIC_ORDER",
            ChallengeReason::ProceduralImpropriety => "PROCEDURAL_IMPROPRIETY",
            ChallengeReason::SignageUnclear => "SIGNAGE_UNCLEAR",
            ChallengeReason::MitigatingCircumstances => "MITIGATING_CIRCUMSTANCES",
            ChallengeReason::Other => "OTHER",
        }
    }

    /// Plain-English description used in generated text.
    pub fn label(&self) -> &'static str {
        match self {
            ChallengeReason::ContraventionDidNotOccur => "The contravention did not occur",
            ChallengeReason::NotVehicleOwner => {
                "I was not the owner of the vehicle at the time of the contravention"
            }
            ChallengeReason::VehicleStolen => "The vehicle had been taken without consent",
            ChallengeReason::HireFirm => "The vehicle was on hire under a hire agreement",
            ChallengeReason::PenaltyExceeded => {
                "The penalty exceeded the amount applicable in the circumstances"
            }
            ChallengeReason::AlreadyPaid => "The penalty charge has already been paid",
            ChallengeReason::InvalidTrafficOrder => "The traffic order is invalid",
            ChallengeReason::ProceduralImpropriety => {
                "There has been a procedural impropriety by the enforcement authority"
            }
            ChallengeReason::SignageUnclear => "The signs or road markings were unclear",
            ChallengeReason::MitigatingCircumstances => "There are mitigating circumstances",
            ChallengeReason::Other => "Other grounds",
        }
    }
}

impl fmt::Display for ChallengeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChallengeReason {
    type Err = UnknownValue;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        ChallengeReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == wanted)
            .ok_or_else(|| UnknownValue {
                kind: "challenge reason",
                value: value.to_string(),
            })
    }
}

/// Timing knobs shared by the built-in recipes.
#[derive(Debug, Clone, Copy)]
pub struct ScriptOptions {
    /// Upper bound for waiting on portal-side processing.
    pub settle_timeout: Duration,
}

impl Default for ScriptOptions {
    fn default() -> Self {
        Self {
            settle_timeout: Duration::from_secs(180),
        }
    }
}

impl ScriptOptions {
    pub(crate) fn settle_ms(&self) -> Option<u64> {
        Some(self.settle_timeout.as_millis() as u64)
    }
}

/// Builds the recipe for an intent, or `None` when the issuer has no script
/// for it.
pub type ScriptBuilder = fn(Intent, Option<ChallengeReason>, &ScriptOptions) -> Option<Recipe>;

pub struct IssuerDefinition {
    pub id: &'static str,
    pub display_name: &'static str,
    /// Lowercase fragments matched against the normalized issuer name.
    pub patterns: &'static [&'static str],
    pub issuer_type: IssuerType,
    pub automation_supported: bool,
    pub challenge_url: Option<&'static str>,
    pub script: Option<ScriptBuilder>,
}

impl fmt::Debug for IssuerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuerDefinition")
            .field("id", &self.id)
            .field("automation_supported", &self.automation_supported)
            .field("has_script", &self.script.is_some())
            .finish()
    }
}

impl IssuerDefinition {
    pub fn has_built_in_support(&self) -> bool {
        self.automation_supported && self.script.is_some()
    }

    pub fn recipe(
        &self,
        intent: Intent,
        reason: Option<ChallengeReason>,
        options: &ScriptOptions,
    ) -> Option<Recipe> {
        self.script.and_then(|build| build(intent, reason, options))
    }
}

pub static ISSUERS: &[IssuerDefinition] = &[
    IssuerDefinition {
        id: "lewisham",
        display_name: "Lewisham Council",
        patterns: &["lewisham"],
        issuer_type: IssuerType::Council,
        automation_supported: true,
        challenge_url: Some(LEWISHAM_PORTAL_URL),
        script: Some(lewisham::recipe),
    },
    // Recipes exist but have not been signed off against the live portal.
    IssuerDefinition {
        id: "horizon",
        display_name: "Horizon Parking",
        patterns: &["horizon parking", "horizon"],
        issuer_type: IssuerType::PrivateCompany,
        automation_supported: false,
        challenge_url: Some(HORIZON_PORTAL_URL),
        script: Some(horizon::recipe),
    },
    IssuerDefinition {
        id: "westminster",
        display_name: "Westminster City Council",
        patterns: &["westminster"],
        issuer_type: IssuerType::Council,
        automation_supported: false,
        challenge_url: None,
        script: None,
    },
    IssuerDefinition {
        id: "tfl",
        display_name: "Transport for London",
        patterns: &["transport for london", "tfl"],
        issuer_type: IssuerType::Tfl,
        automation_supported: false,
        challenge_url: None,
        script: None,
    },
];

fn normalize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Matches a free-text issuer name against the static table.
pub fn resolve_issuer(name: &str) -> Option<&'static IssuerDefinition> {
    let normalized = normalize(name);
    if normalized.is_empty() {
        return None;
    }
    let padded = format!(" {normalized} ");
    ISSUERS.iter().find(|definition| {
        definition
            .patterns
            .iter()
            .any(|pattern| padded.contains(&format!(" {pattern} ")))
    })
}

pub fn has_built_in_support(name: &str) -> bool {
    resolve_issuer(name).is_some_and(IssuerDefinition::has_built_in_support)
}

/// Stable key for `issuer_automations.issuer_id`: the table id when known,
/// otherwise a slug of the name.
pub fn issuer_key(name: &str) -> String {
    match resolve_issuer(name) {
        Some(definition) => definition.id.to_string(),
        None => normalize(name).replace(' ', "-"),
    }
}
