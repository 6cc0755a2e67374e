//! Declarative automation steps.
//!
//! A [`Recipe`] is the serialized form stored in `issuer_automations.steps`
//! and the form built-in issuers produce in code, so both replay through the
//! same engine. String fields accept `{{name}}` placeholders that are
//! resolved against the run variables.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Navigate {
        url: String,
    },
    Fill {
        selector: String,
        value: String,
    },
    Click {
        selector: String,
    },
    SelectOption {
        selector: String,
        option: String,
    },
    Check {
        selector: String,
    },
    WaitFor {
        condition: WaitCondition,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    ExtractText {
        selector: String,
        into: String,
        #[serde(default)]
        source: TextSource,
    },
    ClickMatching {
        selector: String,
        contains: String,
        #[serde(default)]
        on_no_match: NoMatch,
    },
    IfPresent {
        selector: String,
        steps: Vec<Step>,
    },
    Screenshot {
        label: String,
        #[serde(default = "default_full_page")]
        full_page: bool,
    },
    CaptureGallery {
        selector: String,
        label: String,
    },
    GenerateText {
        #[serde(default)]
        prompt_from: Option<String>,
        into: String,
    },
    Sleep {
        duration_ms: u64,
        reason: String,
    },
}

fn default_full_page() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitCondition {
    Selector { selector: String },
    UrlContains { fragment: String },
    TextContains { selector: String, text: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextSource {
    #[default]
    Text,
    Value,
    Placeholder,
}

/// Behaviour of `click_matching` when no list item contains the needle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoMatch {
    #[default]
    Fail,
    First,
}

impl Step {
    pub fn kind(&self) -> &'static str {
        match self {
            Step::Navigate { .. } => "navigate",
            Step::Fill { .. } => "fill",
            Step::Click { .. } => "click",
            Step::SelectOption { .. } => "select_option",
            Step::Check { .. } => "check",
            Step::WaitFor { .. } => "wait_for",
            Step::ExtractText { .. } => "extract_text",
            Step::ClickMatching { .. } => "click_matching",
            Step::IfPresent { .. } => "if_present",
            Step::Screenshot { .. } => "screenshot",
            Step::CaptureGallery { .. } => "capture_gallery",
            Step::GenerateText { .. } => "generate_text",
            Step::Sleep { .. } => "sleep",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    pub steps: Vec<Step>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecipeError {
    #[error("recipe has no steps")]
    Empty,
    #[error("invalid recipe JSON: {0}")]
    Malformed(String),
    #[error("step {position} ({kind}) references an empty selector")]
    EmptySelector { position: String, kind: &'static str },
}

impl Recipe {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Parses a stored recipe. Accepts either `{"steps": [...]}` or a bare
    /// array of steps, which is what the remote learner posts back.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, RecipeError> {
        let recipe = if value.is_array() {
            serde_json::from_value::<Vec<Step>>(value.clone()).map(Recipe::new)
        } else {
            serde_json::from_value::<Recipe>(value.clone())
        }
        .map_err(|err| RecipeError::Malformed(err.to_string()))?;
        recipe.validate()?;
        Ok(recipe)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "steps": [] }))
    }

    pub fn validate(&self) -> Result<(), RecipeError> {
        if self.steps.is_empty() {
            return Err(RecipeError::Empty);
        }
        validate_steps(&self.steps, "")
    }
}

/// Checks selectors at every depth. Positions are dotted and 1-based, the
/// same way the engine reports them.
fn validate_steps(steps: &[Step], prefix: &str) -> Result<(), RecipeError> {
    for (index, step) in steps.iter().enumerate() {
        let position = if prefix.is_empty() {
            (index + 1).to_string()
        } else {
            format!("{prefix}.{}", index + 1)
        };
        if step_selector(step).is_some_and(|selector| selector.trim().is_empty()) {
            return Err(RecipeError::EmptySelector {
                position,
                kind: step.kind(),
            });
        }
        if let Step::IfPresent { steps: nested, .. } = step {
            validate_steps(nested, &position)?;
        }
    }
    Ok(())
}

fn step_selector(step: &Step) -> Option<&str> {
    match step {
        Step::Fill { selector, .. }
        | Step::Click { selector }
        | Step::SelectOption { selector, .. }
        | Step::Check { selector }
        | Step::ExtractText { selector, .. }
        | Step::ClickMatching { selector, .. }
        | Step::IfPresent { selector, .. }
        | Step::CaptureGallery { selector, .. } => Some(selector),
        Step::WaitFor {
            condition: WaitCondition::Selector { selector },
            ..
        }
        | Step::WaitFor {
            condition: WaitCondition::TextContains { selector, .. },
            ..
        } => Some(selector),
        _ => None,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template variable `{0}`")]
    UnknownVariable(String),
    #[error("unterminated placeholder in `{0}`")]
    Unterminated(String),
}

/// Expands `{{name}}` placeholders.
pub fn render(template: &str, vars: &HashMap<String, String>) -> Result<String, TemplateError> {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Unterminated(template.to_string()))?;
        let name = after[..end].trim();
        let value = vars
            .get(name)
            .ok_or_else(|| TemplateError::UnknownVariable(name.to_string()))?;
        output.push_str(value);
        rest = &after[end + 2..];
    }
    output.push_str(rest);
    Ok(output)
}
