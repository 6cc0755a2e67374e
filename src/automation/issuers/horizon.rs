use super::{ChallengeReason, Intent, ScriptOptions};
use crate::automation::steps::{Recipe, Step, TextSource, WaitCondition};

pub const HORIZON_PORTAL_URL: &str = "https://www.horizonparkingappeals.co.uk/";

const PCN_INPUT: &str = "input[name='pcnNumber']";
const VRM_INPUT: &str = "input[name='vehicleReg']";
const CONTINUE_BUTTON: &str = "button[type='submit']";
const CHARGE_URL_FRAGMENT: &str = "/charge/";
const STATUS: &str = "[data-testid='charge-status']";
const PHOTOS: &str = ".charge-photos img";
const APPEAL_BUTTON: &str = "[data-testid='start-appeal']";
const DRIVER_RADIO: &str = "#appellant-keeper";
const REASON_SELECT: &str = "select[name='appealReason']";
const DETAILS_TEXTAREA: &str = "textarea[name='appealDetails']";
const FIRST_NAME_INPUT: &str = "input[name='firstName']";
const LAST_NAME_INPUT: &str = "input[name='lastName']";
const EMAIL_INPUT: &str = "input[name='email']";
const ADDRESS_INPUT: &str = "input[name='addressLine1']";
const POSTCODE_INPUT: &str = "input[name='postcode']";
const TERMS_CHECKBOX: &str = "input[name='acceptTerms']";
const SUBMIT_BUTTON: &str = "[data-testid='submit-appeal']";
const CONFIRMATION: &str = "[data-testid='appeal-confirmation']";

fn reason_option(reason: ChallengeReason) -> &'static str {
    match reason {
        ChallengeReason::SignageUnclear => "Signage was unclear or missing",
        ChallengeReason::NotVehicleOwner
        | ChallengeReason::VehicleStolen
        | ChallengeReason::HireFirm => "I was not the keeper of the vehicle",
        ChallengeReason::AlreadyPaid => "I paid for parking",
        ChallengeReason::MitigatingCircumstances => "Mitigating circumstances",
        _ => "Other",
    }
}

fn access() -> Vec<Step> {
    vec![
        Step::Navigate {
            url: HORIZON_PORTAL_URL.to_string(),
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
            selector: CONTINUE_BUTTON.to_string(),
        },
        Step::WaitFor {
            condition: WaitCondition::UrlContains {
                fragment: CHARGE_URL_FRAGMENT.to_string(),
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
                selector: PHOTOS.to_string(),
            },
            timeout_ms: options.settle_ms(),
        },
        Step::CaptureGallery {
            selector: PHOTOS.to_string(),
            label: "site-photo".to_string(),
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
        Step::Click {
            selector: APPEAL_BUTTON.to_string(),
        },
        Step::WaitFor {
            condition: WaitCondition::Selector {
                selector: REASON_SELECT.to_string(),
            },
            timeout_ms: None,
        },
        Step::IfPresent {
            selector: DRIVER_RADIO.to_string(),
            steps: vec![Step::Check {
                selector: DRIVER_RADIO.to_string(),
            }],
        },
        Step::SelectOption {
            selector: REASON_SELECT.to_string(),
            option: reason_option(reason).to_string(),
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
            selector: FIRST_NAME_INPUT.to_string(),
            value: "{{first_name}}".to_string(),
        },
        Step::Fill {
            selector: LAST_NAME_INPUT.to_string(),
            value: "{{last_name}}".to_string(),
        },
        Step::Fill {
            selector: EMAIL_INPUT.to_string(),
            value: "{{email}}".to_string(),
        },
        Step::Fill {
            selector: ADDRESS_INPUT.to_string(),
            value: "{{address_line1}}".to_string(),
        },
        Step::Fill {
            selector: POSTCODE_INPUT.to_string(),
            value: "{{postcode}}".to_string(),
        },
        Step::Check {
            selector: TERMS_CHECKBOX.to_string(),
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
        Step::Screenshot {
            label: "appeal-submitted".to_string(),
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
