use super::{ChallengeReason, Intent, ScriptOptions};
use crate::automation::steps::{NoMatch, Recipe, Step, TextSource, WaitCondition};

pub const LEWISHAM_PORTAL_URL: &str = "https://pcnevidence.lewisham.gov.uk/pcnonline/index.php";

pub mod selectors {
    pub const PCN_INPUT: &str = "#pcnReference";
    pub const VRM_INPUT: &str = "#vehicleRegistration";
    pub const SEARCH_BUTTON: &str = "#btnSearch";
    pub const DETAILS_URL_FRAGMENT: &str = "/pcnonline/details";
    pub const STATUS: &str = ".pcn-summary .pcn-status";
    pub const GALLERY_IMAGES: &str = ".evidence-gallery img";
    pub const CHALLENGE_LINK: &str = "a#btnChallenge";
    pub const REASON_SELECT: &str = "select#challengeReason";
    pub const SUB_REASON_SELECT: &str = "select#challengeSubReason";
    pub const DETAILS_TEXTAREA: &str = "textarea#challengeDetails";
    pub const POSTCODE_INPUT: &str = "#addressPostcode";
    pub const FIND_ADDRESS_BUTTON: &str = "#btnFindAddress";
    pub const ADDRESS_RESULTS: &str = "ul#addressResults li";
    pub const FULL_NAME_INPUT: &str = "#contactName";
    pub const EMAIL_INPUT: &str = "#contactEmail";
    pub const DECLARATION_CHECKBOX: &str = "#declaration";
    pub const SUBMIT_BUTTON: &str = "#btnSubmitChallenge";
    pub const CONFIRMATION: &str = ".challenge-confirmation";
    pub const CONFIRMATION_REFERENCE: &str = ".challenge-confirmation .reference";
}

use selectors::*;

/// Option label shown in the portal's reason dropdown.
pub fn reason_option(reason: ChallengeReason) -> &'static str {
    match reason {
        ChallengeReason::ContraventionDidNotOccur | ChallengeReason::SignageUnclear => {
            "The contravention did not occur"
        }
        ChallengeReason::NotVehicleOwner => "I was not the owner of the vehicle",
        ChallengeReason::VehicleStolen => "The vehicle was stolen",
        ChallengeReason::HireFirm => "The vehicle was hired",
        ChallengeReason::PenaltyExceeded => "The penalty exceeded the relevant amount",
        ChallengeReason::AlreadyPaid => "The penalty has already been paid",
        ChallengeReason::InvalidTrafficOrder => "The traffic order was invalid",
        ChallengeReason::ProceduralImpropriety => "Procedural impropriety",
        ChallengeReason::MitigatingCircumstances | ChallengeReason::Other => "Other",
    }
}

fn sub_reason_option(reason: ChallengeReason) -> &'static str {
    match reason {
        ChallengeReason::SignageUnclear => "Signs and lines were unclear",
        _ => "Other",
    }
}

fn access() -> Vec<Step> {
    vec![
        Step::Navigate {
            url: LEWISHAM_PORTAL_URL.to_string(),
        },
        Step::Fill {
            selector: PCN_INPUT.to_string(),
            value: "{{pcn_number}}".to_string(),
        },
        Step::Fill {
            selector: VRM_INPUT.to_string(),
            value: "{{vrm}}".to_string(),
        },
        Step::Click {
            selector: SEARCH_BUTTON.to_string(),
        },
        Step::WaitFor {
            condition: WaitCondition::UrlContains {
                fragment: DETAILS_URL_FRAGMENT.to_string(),
            },
            timeout_ms: None,
        },
    ]
}

fn verify(options: &ScriptOptions) -> Vec<Step> {
    let mut steps = access();
    steps.extend([
        Step::ExtractText {
            selector: STATUS.to_string(),
            into: "portal_status".to_string(),
            source: TextSource::Text,
        },
        Step::WaitFor {
            condition: WaitCondition::Selector {
                selector: GALLERY_IMAGES.to_string(),
            },
            timeout_ms: options.settle_ms(),
        },
        Step::CaptureGallery {
            selector: GALLERY_IMAGES.to_string(),
            label: "portal-photo".to_string(),
        },
        Step::Screenshot {
            label: "verify".to_string(),
            full_page: true,
        },
    ]);
    steps
}

fn challenge(reason: ChallengeReason, options: &ScriptOptions) -> Vec<Step> {
    let mut steps = access();
    steps.extend([
        Step::CaptureGallery {
            selector: GALLERY_IMAGES.to_string(),
            label: "portal-photo".to_string(),
        },
        Step::Click {
            selector: CHALLENGE_LINK.to_string(),
        },
        Step::WaitFor {
            condition: WaitCondition::Selector {
                selector: REASON_SELECT.to_string(),
            },
            timeout_ms: None,
        },
        Step::SelectOption {
            selector: REASON_SELECT.to_string(),
            option: reason_option(reason).to_string(),
        },
        Step::IfPresent {
            selector: SUB_REASON_SELECT.to_string(),
            steps: vec![Step::SelectOption {
                selector: SUB_REASON_SELECT.to_string(),
                option: sub_reason_option(reason).to_string(),
            }],
        },
        Step::ExtractText {
            selector: DETAILS_TEXTAREA.to_string(),
            into: "portal_prompt".to_string(),
            source: TextSource::Placeholder,
        },
        Step::GenerateText {
            prompt_from: Some("portal_prompt".to_string()),
            into: "challenge_text".to_string(),
        },
        Step::Fill {
            selector: DETAILS_TEXTAREA.to_string(),
            value: "{{challenge_text}}".to_string(),
        },
        Step::Fill {
            selector: FULL_NAME_INPUT.to_string(),
            value: "{{full_name}}".to_string(),
        },
        Step::Fill {
            selector: EMAIL_INPUT.to_string(),
            value: "{{email}}".to_string(),
        },
        Step::Fill {
            selector: POSTCODE_INPUT.to_string(),
            value: "{{postcode}}".to_string(),
        },
        Step::Click {
            selector: FIND_ADDRESS_BUTTON.to_string(),
        },
        Step::WaitFor {
            condition: WaitCondition::Selector {
                selector: ADDRESS_RESULTS.to_string(),
            },
            timeout_ms: None,
        },
        Step::ClickMatching {
            selector: ADDRESS_RESULTS.to_string(),
            contains: "{{address_line1}}".to_string(),
            on_no_match: NoMatch::Fail,
        },
        Step::Check {
            selector: DECLARATION_CHECKBOX.to_string(),
        },
        Step::Click {
            selector: SUBMIT_BUTTON.to_string(),
        },
        Step::WaitFor {
            condition: WaitCondition::Selector {
                selector: CONFIRMATION.to_string(),
            },
            timeout_ms: options.settle_ms(),
        },
        Step::IfPresent {
            selector: CONFIRMATION_REFERENCE.to_string(),
            steps: vec![Step::ExtractText {
                selector: CONFIRMATION_REFERENCE.to_string(),
                into: "confirmation_reference".to_string(),
                source: TextSource::Text,
            }],
        },
        Step::Screenshot {
            label: "challenge-submitted".to_string(),
            full_page: true,
        },
    ]);
    steps
}

pub(super) fn recipe(
    intent: Intent,
    reason: Option<ChallengeReason>,
    options: &ScriptOptions,
) -> Option<Recipe> {
    let steps = match intent {
        Intent::Access => access(),
        Intent::Verify => verify(options),
        Intent::Challenge => challenge(reason?, options),
    };
    Some(Recipe::new(steps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_selects_the_mapped_reason_and_matches_address_strictly() {
        let recipe = recipe(
            Intent::Challenge,
            Some(ChallengeReason::NotVehicleOwner),
            &ScriptOptions::default(),
        )
        .unwrap();

        assert!(recipe.steps.contains(&Step::SelectOption {
            selector: REASON_SELECT.to_string(),
            option: "I was not the owner of the vehicle".to_string(),
        }));
        assert!(recipe.steps.iter().any(|step| matches!(
            step,
            Step::ClickMatching {
                on_no_match: NoMatch::Fail,
                ..
            }
        )));
    }

    #[test]
    fn settle_waits_use_the_configured_timeout() {
        let options = ScriptOptions {
            settle_timeout: std::time::Duration::from_secs(42),
        };
        let recipe = recipe(Intent::Verify, None, &options).unwrap();
        assert!(recipe.steps.contains(&Step::WaitFor {
            condition: WaitCondition::Selector {
                selector: GALLERY_IMAGES.to_string(),
            },
            timeout_ms: Some(42_000),
        }));
    }

    #[test]
    fn access_ends_on_the_details_page() {
        let recipe = recipe(Intent::Access, None, &ScriptOptions::default()).unwrap();
        assert_eq!(recipe.steps.len(), 5);
        assert_eq!(recipe.steps[0].kind(), "navigate");
        assert_eq!(recipe.steps[4].kind(), "wait_for");
    }
}
