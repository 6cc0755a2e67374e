//! Runs recipes against a real portal for one ticket.

use std::sync::Arc;

use thiserror::Error;
use tokio::task;
use tracing::{error, info, warn};

use super::browser::DriverError;
use super::context::{load_ticket_by_pcn, AutomationContext, TicketBundle};
use super::engine::{EngineServices, RunOutcome, RunReport, StepEngine};
use super::evidence::{existing_evidence_urls, EvidenceOwner, TicketEvidenceSink};
use super::issuers::{resolve_issuer, ChallengeReason, Intent};
use super::steps::Recipe;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum AutomationError {
    #[error("no ticket with PCN `{pcn_number}`")]
    TicketNotFound { pcn_number: String },
    #[error("issuer `{issuer}` is not in the issuer table")]
    IssuerUnmatched { issuer: String },
    #[error("issuer `{issuer}` has no built-in automation")]
    IssuerUnsupported { issuer: String },
    #[error("issuer `{issuer}` has no {intent} script")]
    MissingScript { issuer: String, intent: Intent },
    #[error("a challenge reason is required")]
    ReasonRequired,
    #[error(transparent)]
    Browser(#[from] DriverError),
    #[error("step {position} ({kind}) failed: {message}")]
    StepFailed {
        position: String,
        kind: &'static str,
        message: String,
        report: Box<RunReport>,
    },
    #[error("database error: {0}")]
    Database(String),
}

impl AutomationError {
    /// Failures worth retrying later without risking a duplicate submission.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AutomationError::Browser(DriverError::Launch(_)) | AutomationError::Database(_)
        )
    }
}

pub async fn find_ticket(
    state: &AppState,
    pcn_number: &str,
) -> Result<TicketBundle, AutomationError> {
    let pool = state.pool.clone();
    let pcn = pcn_number.to_string();
    task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(|err| format!("{err:?}"))?;
        load_ticket_by_pcn(&mut conn, &pcn).map_err(|err| format!("{err:?}"))
    })
    .await
    .map_err(|err| AutomationError::Database(format!("ticket lookup panicked: {err}")))?
    .map_err(AutomationError::Database)?
    .ok_or_else(|| AutomationError::TicketNotFound {
        pcn_number: pcn_number.to_string(),
    })
}

/// Opens a page, replays `recipe` for the ticket and always closes the page.
///
/// A failed step is reported in the returned [`RunReport`]; only a browser
/// that cannot be opened is an error here.
pub async fn execute_recipe(
    state: &AppState,
    bundle: &TicketBundle,
    recipe: &Recipe,
    context: &AutomationContext,
    reason: Option<ChallengeReason>,
) -> Result<RunReport, AutomationError> {
    let owner = EvidenceOwner {
        ticket_id: bundle.ticket.id,
        user_id: bundle.user.id,
        pcn_number: bundle.ticket.pcn_number.clone(),
    };
    let services = EngineServices {
        evidence: Arc::new(TicketEvidenceSink::new(
            state.storage.clone(),
            state.pool.clone(),
            owner,
        )),
        text: state.automation.text.clone(),
    };

    let mut variables = context.variables();
    if let Some(reason) = reason {
        variables.insert("reason_label".to_string(), reason.label().to_string());
        variables.insert("challenge_reason".to_string(), reason.as_str().to_string());
    }
    let mut evidence_urls = context.evidence_urls.clone();
    if evidence_urls.is_empty() {
        evidence_urls = existing_evidence_urls(state.storage.as_ref(), &bundle.media).await;
    }

    let page = state.automation.browser.open().await?;
    let report = StepEngine::new(page.as_ref(), &services, state.engine_settings())
        .with_variables(variables)
        .with_evidence_urls(evidence_urls)
        .run(recipe)
        .await;

    if let Err(err) = page.close().await {
        warn!(pcn_number = %bundle.ticket.pcn_number, error = %err, "failed to close browser page");
    }
    Ok(report)
}

/// Runs a built-in issuer script for the ticket with `pcn_number`.
pub async fn dispatch(
    state: &AppState,
    pcn_number: &str,
    intent: Intent,
    reason: Option<ChallengeReason>,
    custom_reason: Option<String>,
) -> Result<RunReport, AutomationError> {
    let bundle = find_ticket(state, pcn_number).await?;
    let issuer = bundle.ticket.issuer.clone();

    let definition = resolve_issuer(&issuer).ok_or_else(|| AutomationError::IssuerUnmatched {
        issuer: issuer.clone(),
    })?;
    if !definition.automation_supported {
        return Err(AutomationError::IssuerUnsupported { issuer });
    }
    if intent == Intent::Challenge && reason.is_none() {
        return Err(AutomationError::ReasonRequired);
    }
    let recipe = definition
        .recipe(intent, reason, &state.script_options())
        .ok_or_else(|| AutomationError::MissingScript {
            issuer: issuer.clone(),
            intent,
        })?;

    let mut context = AutomationContext::from_bundle(&bundle, None, Vec::new());
    context.challenge_reason = reason.map(|r| r.as_str().to_string());
    context.custom_reason = custom_reason;

    info!(%pcn_number, issuer = definition.id, %intent, "dispatching built-in automation");
    let report = execute_recipe(state, &bundle, &recipe, &context, reason).await?;
    match &report.outcome {
        RunOutcome::Completed => Ok(report),
        RunOutcome::Failed {
            position,
            kind,
            error,
            ..
        } => Err(AutomationError::StepFailed {
            position: position.clone(),
            kind: *kind,
            message: error.clone(),
            report: Box::new(report.clone()),
        }),
    }
}

/// Boolean form of [`dispatch`]: every failure is logged and reported as
/// `false`.
pub async fn try_dispatch(
    state: &AppState,
    pcn_number: &str,
    intent: Intent,
    reason: Option<ChallengeReason>,
) -> bool {
    match dispatch(state, pcn_number, intent, reason, None).await {
        Ok(report) => {
            info!(%pcn_number, %intent, steps = report.completed_steps(), "automation succeeded");
            true
        }
        Err(err) => {
            error!(%pcn_number, %intent, error = %err, "automation failed");
            false
        }
    }
}
