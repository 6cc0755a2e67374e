//! String-backed status columns and the transitions allowed between them.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ROLE_ADMIN: &str = "admin";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value: {value}")]
pub struct UnknownStatus {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownStatus;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(ChallengeStatus, "challenge status", {
    Pending => "PENDING",
    Success => "SUCCESS",
    Error => "ERROR",
});

string_enum!(ChallengeType, "challenge type", {
    Letter => "LETTER",
    AutoChallenge => "AUTO_CHALLENGE",
});

string_enum!(AutomationStatus, "automation status", {
    Learning => "LEARNING",
    PendingReview => "PENDING_REVIEW",
    Verified => "VERIFIED",
    NeedsHumanHelp => "NEEDS_HUMAN_HELP",
    Failed => "FAILED",
});

string_enum!(MediaSource, "media source", {
    Ticket => "TICKET",
    Evidence => "EVIDENCE",
    Screenshot => "SCREENSHOT",
});

string_enum!(IssuerType, "issuer type", {
    Council => "COUNCIL",
    PrivateCompany => "PRIVATE_COMPANY",
    Tfl => "TFL",
});

impl ChallengeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChallengeStatus::Pending)
    }
}

impl AutomationStatus {
    /// Only verified recipes may be replayed against a real portal.
    pub fn is_executable(&self) -> bool {
        matches!(self, AutomationStatus::Verified)
    }

    pub fn can_transition_to(&self, next: AutomationStatus) -> bool {
        use AutomationStatus::*;
        matches!(
            (self, next),
            (Learning, PendingReview)
                | (Learning, NeedsHumanHelp)
                | (Learning, Failed)
                | (PendingReview, Verified)
                | (PendingReview, NeedsHumanHelp)
                | (PendingReview, Failed)
                | (NeedsHumanHelp, Verified)
                | (NeedsHumanHelp, Failed)
                | (Verified, NeedsHumanHelp)
                | (Failed, Learning)
        )
    }
}
