//! Step interpreter shared by built-in issuers and learned recipes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::backoff::{poll_until, RetryPolicy};
use super::browser::{DriverError, PageDriver};
use super::evidence::{EvidenceCapture, EvidenceError, EvidenceSink, StoredEvidence};
use super::steps::{render, NoMatch, Recipe, Step, TemplateError, TextSource, WaitCondition};
use super::text_gen::{ChallengeTextRequest, TextGenerationError, TextGenerator};
use crate::status::MediaSource;

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("timed out after {waited_ms} ms waiting for {condition}")]
    Timeout { condition: String, waited_ms: u64 },
    #[error("no item in `{selector}` contains `{needle}`")]
    NoMatch { selector: String, needle: String },
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error(transparent)]
    TextGeneration(#[from] TextGenerationError),
}

impl StepError {
    /// Errors worth another attempt: the page may still be loading or a
    /// network call may have blipped.
    pub fn is_transient(&self) -> bool {
        match self {
            StepError::Driver(DriverError::Launch(_)) => false,
            StepError::Driver(_) => true,
            StepError::NoMatch { .. } => true,
            StepError::Evidence(EvidenceError::Storage(_)) => true,
            StepError::TextGeneration(TextGenerationError::Request(_)) => true,
            StepError::TextGeneration(TextGenerationError::Status { status, .. }) => {
                *status >= 500 || *status == 429
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct EngineServices {
    pub evidence: Arc<dyn EvidenceSink>,
    pub text: Arc<dyn TextGenerator>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    /// Used by `wait_for` steps that do not carry their own timeout.
    pub default_wait: Duration,
    pub poll_initial: Duration,
    pub poll_max: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            default_wait: Duration::from_secs(30),
            poll_initial: Duration::from_millis(250),
            poll_max: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepRecord {
    /// Dotted position, e.g. `7` or `7.2` for a step nested in `if_present`.
    pub position: String,
    pub kind: &'static str,
    pub attempts: u32,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Failed {
        position: String,
        kind: &'static str,
        attempts: u32,
        error: String,
        transient: bool,
    },
}

/// What happened during one recipe run, including partial progress.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub records: Vec<StepRecord>,
    pub outcome: RunOutcome,
    #[serde(skip)]
    pub evidence: Vec<StoredEvidence>,
    pub captured: HashMap<String, String>,
    pub generated_text: Option<String>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, RunOutcome::Completed)
    }

    pub fn completed_steps(&self) -> usize {
        self.records.len()
    }

    pub fn evidence_urls(&self) -> Vec<String> {
        self.evidence.iter().map(|e| e.url.clone()).collect()
    }
}

struct StepFailure {
    position: String,
    kind: &'static str,
    attempts: u32,
    error: StepError,
}

type StepsFuture<'a> = Pin<Box<dyn Future<Output = Result<(), StepFailure>> + Send + 'a>>;

pub struct StepEngine<'a> {
    page: &'a dyn PageDriver,
    services: &'a EngineServices,
    settings: EngineSettings,
    vars: HashMap<String, String>,
    base_evidence_urls: Vec<String>,
    gallery_urls: Vec<String>,
    records: Vec<StepRecord>,
    evidence: Vec<StoredEvidence>,
    captured: HashMap<String, String>,
    generated_text: Option<String>,
}

impl<'a> StepEngine<'a> {
    pub fn new(
        page: &'a dyn PageDriver,
        services: &'a EngineServices,
        settings: EngineSettings,
    ) -> Self {
        Self {
            page,
            services,
            settings,
            vars: HashMap::new(),
            base_evidence_urls: Vec::new(),
            gallery_urls: Vec::new(),
            records: Vec::new(),
            evidence: Vec::new(),
            captured: HashMap::new(),
            generated_text: None,
        }
    }

    pub fn with_variables(mut self, vars: HashMap<String, String>) -> Self {
        self.vars.extend(vars);
        self
    }

    /// Evidence that existed before the run, passed to text generation.
    pub fn with_evidence_urls(mut self, urls: Vec<String>) -> Self {
        self.base_evidence_urls = urls;
        self
    }

    pub async fn run(mut self, recipe: &Recipe) -> RunReport {
        let started = Instant::now();
        let result = self.run_steps(&recipe.steps, String::new()).await;
        let outcome = match result {
            Ok(()) => {
                info!(
                    steps = self.records.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "recipe completed"
                );
                RunOutcome::Completed
            }
            Err(failure) => {
                error!(
                    position = %failure.position,
                    kind = failure.kind,
                    attempts = failure.attempts,
                    completed = self.records.len(),
                    error = %failure.error,
                    "recipe failed"
                );
                RunOutcome::Failed {
                    position: failure.position,
                    kind: failure.kind,
                    attempts: failure.attempts,
                    transient: failure.error.is_transient(),
                    error: failure.error.to_string(),
                }
            }
        };
        RunReport {
            records: self.records,
            outcome,
            evidence: self.evidence,
            captured: self.captured,
            generated_text: self.generated_text,
        }
    }

    fn run_steps<'s>(&'s mut self, steps: &'s [Step], prefix: String) -> StepsFuture<'s> {
        Box::pin(async move {
            for (index, step) in steps.iter().enumerate() {
                let position = if prefix.is_empty() {
                    (index + 1).to_string()
                } else {
                    format!("{prefix}.{}", index + 1)
                };

                if let Step::IfPresent {
                    selector,
                    steps: nested,
                } = step
                {
                    let present = self.probe(&position, selector).await?;
                    if present {
                        self.run_steps(nested, position).await?;
                    }
                    continue;
                }

                self.run_step(step, &position).await?;
            }
            Ok(())
        })
    }

    async fn probe(&mut self, position: &str, selector: &str) -> Result<bool, StepFailure> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match render(selector, &self.vars) {
                Ok(selector) => self.page.exists(&selector).await.map_err(StepError::from),
                Err(err) => Err(StepError::from(err)),
            };
            match result {
                Ok(present) => {
                    debug!(%position, %selector, present, "probed optional branch");
                    self.records.push(StepRecord {
                        position: position.to_string(),
                        kind: "if_present",
                        attempts: attempt,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        note: Some(if present { "present" } else { "absent" }.to_string()),
                    });
                    return Ok(present);
                }
                Err(err) if err.is_transient() && attempt < self.settings.retry.max_attempts => {
                    warn!(%position, attempt, error = %err, "probe failed; retrying");
                    sleep(self.settings.retry.delay_after(attempt)).await;
                }
                Err(err) => {
                    return Err(StepFailure {
                        position: position.to_string(),
                        kind: "if_present",
                        attempts: attempt,
                        error: err,
                    })
                }
            }
        }
    }

    async fn run_step(&mut self, step: &Step, position: &str) -> Result<(), StepFailure> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!(%position, kind = step.kind(), attempt, "executing step");
            match self.execute(step).await {
                Ok(note) => {
                    self.records.push(StepRecord {
                        position: position.to_string(),
                        kind: step.kind(),
                        attempts: attempt,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        note,
                    });
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < self.settings.retry.max_attempts => {
                    let delay = self.settings.retry.delay_after(attempt);
                    warn!(
                        %position,
                        kind = step.kind(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "step failed; retrying"
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    return Err(StepFailure {
                        position: position.to_string(),
                        kind: step.kind(),
                        attempts: attempt,
                        error: err,
                    })
                }
            }
        }
    }

    fn render(&self, template: &str) -> Result<String, StepError> {
        Ok(render(template, &self.vars)?)
    }

    async fn execute(&mut self, step: &Step) -> Result<Option<String>, StepError> {
        match step {
            Step::Navigate { url } => {
                let url = self.render(url)?;
                self.page.goto(&url).await?;
                Ok(Some(url))
            }
            Step::Fill { selector, value } => {
                let selector = self.render(selector)?;
                let value = self.render(value)?;
                self.page.fill(&selector, &value).await?;
                Ok(None)
            }
            Step::Click { selector } => {
                let selector = self.render(selector)?;
                self.page.click(&selector).await?;
                Ok(None)
            }
            Step::SelectOption { selector, option } => {
                let selector = self.render(selector)?;
                let option = self.render(option)?;
                self.page.select_option(&selector, &option).await?;
                Ok(Some(option))
            }
            Step::Check { selector } => {
                let selector = self.render(selector)?;
                self.page.set_checked(&selector, true).await?;
                Ok(None)
            }
            Step::WaitFor {
                condition,
                timeout_ms,
            } => {
                let timeout = timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.settings.default_wait);
                self.wait_for(condition, timeout).await
            }
            Step::ExtractText {
                selector,
                into,
                source,
            } => {
                let selector = self.render(selector)?;
                let text = match source {
                    TextSource::Text => self.page.text(&selector).await?,
                    TextSource::Value => self.page.value(&selector).await?,
                    TextSource::Placeholder => self
                        .page
                        .attribute(&selector, "placeholder")
                        .await?
                        .unwrap_or_default(),
                };
                self.vars.insert(into.clone(), text.clone());
                self.captured.insert(into.clone(), text);
                Ok(Some(format!("captured `{into}`")))
            }
            Step::ClickMatching {
                selector,
                contains,
                on_no_match,
            } => {
                let selector = self.render(selector)?;
                let needle = self.render(contains)?;
                let items = self.page.texts(&selector).await?;
                match pick_matching(&items, &needle, *on_no_match) {
                    Some(Pick::Matched(index)) => {
                        self.page.click_nth(&selector, index).await?;
                        Ok(Some(items[index].clone()))
                    }
                    Some(Pick::Fallback(index)) => {
                        warn!(%selector, %needle, "no list item matched; using first item");
                        self.page.click_nth(&selector, index).await?;
                        Ok(Some(format!("fallback: {}", items[index])))
                    }
                    None => Err(StepError::NoMatch { selector, needle }),
                }
            }
            Step::IfPresent { .. } => Ok(None),
            Step::Screenshot { label, full_page } => {
                let label = self.render(label)?;
                let bytes = self.page.screenshot(*full_page).await?;
                let stored = self
                    .services
                    .evidence
                    .store(EvidenceCapture {
                        source: MediaSource::Screenshot,
                        label,
                        bytes,
                    })
                    .await?;
                let key = stored.key.clone();
                self.evidence.push(stored);
                Ok(Some(key))
            }
            Step::CaptureGallery { selector, label } => {
                let selector = self.render(selector)?;
                let label = self.render(label)?;
                let captures = self.page.element_screenshots(&selector).await?;
                let count = captures.len();
                for (index, bytes) in captures.into_iter().enumerate() {
                    let stored = self
                        .services
                        .evidence
                        .store(EvidenceCapture {
                            source: MediaSource::Evidence,
                            label: format!("{label}-{}", index + 1),
                            bytes,
                        })
                        .await?;
                    if !self.evidence.iter().any(|e| e.key == stored.key) {
                        self.gallery_urls.push(stored.url.clone());
                        self.evidence.push(stored);
                    }
                }
                Ok(Some(format!("{count} images")))
            }
            Step::GenerateText { prompt_from, into } => {
                let portal_prompt = match prompt_from {
                    Some(name) => Some(
                        self.vars
                            .get(name)
                            .cloned()
                            .ok_or_else(|| TemplateError::UnknownVariable(name.clone()))?,
                    ),
                    None => None,
                };
                let request = self.text_request(portal_prompt);
                let text = self.services.text.generate(&request).await?;
                self.vars.insert(into.clone(), text.clone());
                self.generated_text = Some(text);
                Ok(Some(format!("generated `{into}`")))
            }
            Step::Sleep {
                duration_ms,
                reason,
            } => {
                info!(duration_ms, %reason, "sleeping");
                sleep(Duration::from_millis(*duration_ms)).await;
                Ok(Some(reason.clone()))
            }
        }
    }

    async fn wait_for(
        &self,
        condition: &WaitCondition,
        timeout: Duration,
    ) -> Result<Option<String>, StepError> {
        let started = Instant::now();
        let (description, satisfied) = match condition {
            WaitCondition::Selector { selector } => {
                let selector = self.render(selector)?;
                let satisfied = poll_until(
                    timeout,
                    self.settings.poll_initial,
                    self.settings.poll_max,
                    || self.page.exists(&selector),
                )
                .await?;
                (format!("selector `{selector}`"), satisfied)
            }
            WaitCondition::UrlContains { fragment } => {
                let fragment = self.render(fragment)?;
                let satisfied = poll_until(
                    timeout,
                    self.settings.poll_initial,
                    self.settings.poll_max,
                    || async { Ok::<_, DriverError>(self.page.current_url().await?.contains(&fragment)) },
                )
                .await?;
                (format!("url containing `{fragment}`"), satisfied)
            }
            WaitCondition::TextContains { selector, text } => {
                let selector = self.render(selector)?;
                let text = self.render(text)?;
                let needle = normalize(&text);
                let satisfied = poll_until(
                    timeout,
                    self.settings.poll_initial,
                    self.settings.poll_max,
                    || async {
                        match self.page.text(&selector).await {
                            Ok(current) => Ok(normalize(&current).contains(&needle)),
                            Err(DriverError::SelectorNotFound { .. }) => Ok(false),
                            Err(err) => Err(err),
                        }
                    },
                )
                .await?;
                (format!("`{selector}` to contain `{text}`"), satisfied)
            }
        };

        if satisfied {
            Ok(Some(format!(
                "{description} after {} ms",
                started.elapsed().as_millis()
            )))
        } else {
            Err(StepError::Timeout {
                condition: description,
                waited_ms: timeout.as_millis() as u64,
            })
        }
    }

    fn text_request(&self, portal_prompt: Option<String>) -> ChallengeTextRequest {
        let var = |name: &str| self.vars.get(name).cloned().unwrap_or_default();
        let optional = |name: &str| self.vars.get(name).filter(|v| !v.is_empty()).cloned();
        let mut evidence_urls = self.base_evidence_urls.clone();
        evidence_urls.extend(self.gallery_urls.iter().cloned());
        ChallengeTextRequest {
            pcn_number: var("pcn_number"),
            issuer: var("issuer"),
            contravention_code: optional("contravention_code"),
            reason_label: var("reason_label"),
            custom_reason: optional("custom_reason"),
            portal_prompt,
            evidence_urls,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Pick {
    Matched(usize),
    Fallback(usize),
}

fn normalize(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn pick_matching(items: &[String], needle: &str, on_no_match: NoMatch) -> Option<Pick> {
    let needle = normalize(needle);
    if !needle.is_empty() {
        if let Some(index) = items
            .iter()
            .position(|item| normalize(item).contains(&needle))
        {
            return Some(Pick::Matched(index));
        }
    }
    match on_no_match {
        NoMatch::First if !items.is_empty() => Some(Pick::Fallback(0)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::evidence::StoredEvidence;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct PageState {
        url: String,
        present: HashMap<String, String>,
        lists: HashMap<String, Vec<String>>,
        placeholders: HashMap<String, String>,
        flaky: HashMap<String, u32>,
        appear_after_polls: HashMap<String, u32>,
        url_after_click: HashMap<String, String>,
        actions: Vec<String>,
    }

    #[derive(Default)]
    struct FakePage {
        state: Mutex<PageState>,
    }

    impl FakePage {
        fn with(build: impl FnOnce(&mut PageState)) -> Self {
            let page = FakePage::default();
            build(&mut page.state.lock().unwrap());
            page
        }

        fn actions(&self) -> Vec<String> {
            self.state.lock().unwrap().actions.clone()
        }

        fn lookup(&self, selector: &str) -> Result<String, DriverError> {
            let mut state = self.state.lock().unwrap();
            if let Some(remaining) = state.flaky.get_mut(selector) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DriverError::selector_not_found(selector));
                }
            }
            state
                .present
                .get(selector)
                .cloned()
                .ok_or_else(|| DriverError::selector_not_found(selector))
        }
    }

    #[async_trait]
    impl PageDriver for FakePage {
        async fn goto(&self, url: &str) -> Result<(), DriverError> {
            let mut state = self.state.lock().unwrap();
            state.url = url.to_string();
            state.actions.push(format!("goto {url}"));
            Ok(())
        }

        async fn current_url(&self) -> Result<String, DriverError> {
            Ok(self.state.lock().unwrap().url.clone())
        }

        async fn exists(&self, selector: &str) -> Result<bool, DriverError> {
            let mut state = self.state.lock().unwrap();
            if let Some(remaining) = state.appear_after_polls.get_mut(selector) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Ok(false);
                }
            }
            Ok(state.present.contains_key(selector))
        }

        async fn fill(&self, selector: &str, value: &str) -> Result<(), DriverError> {
            self.lookup(selector)?;
            let mut state = self.state.lock().unwrap();
            state.actions.push(format!("fill {selector}={value}"));
            Ok(())
        }

        async fn click(&self, selector: &str) -> Result<(), DriverError> {
            self.lookup(selector)?;
            let mut state = self.state.lock().unwrap();
            state.actions.push(format!("click {selector}"));
            if let Some(url) = state.url_after_click.get(selector).cloned() {
                state.url = url;
            }
            Ok(())
        }

        async fn click_nth(&self, selector: &str, index: usize) -> Result<(), DriverError> {
            let mut state = self.state.lock().unwrap();
            let len = state.lists.get(selector).map(Vec::len).unwrap_or(0);
            if index >= len {
                return Err(DriverError::selector_not_found(selector));
            }
            state.actions.push(format!("click {selector}[{index}]"));
            Ok(())
        }

        async fn select_option(&self, selector: &str, option: &str) -> Result<(), DriverError> {
            self.lookup(selector)?;
            let mut state = self.state.lock().unwrap();
            state.actions.push(format!("select {selector}={option}"));
            Ok(())
        }

        async fn set_checked(&self, selector: &str, checked: bool) -> Result<(), DriverError> {
            self.lookup(selector)?;
            let mut state = self.state.lock().unwrap();
            state.actions.push(format!("check {selector}={checked}"));
            Ok(())
        }

        async fn text(&self, selector: &str) -> Result<String, DriverError> {
            self.lookup(selector)
        }

        async fn value(&self, selector: &str) -> Result<String, DriverError> {
            self.lookup(selector)
        }

        async fn attribute(
            &self,
            selector: &str,
            name: &str,
        ) -> Result<Option<String>, DriverError> {
            self.lookup(selector)?;
            let state = self.state.lock().unwrap();
            if name == "placeholder" {
                Ok(state.placeholders.get(selector).cloned())
            } else {
                Ok(None)
            }
        }

        async fn texts(&self, selector: &str) -> Result<Vec<String>, DriverError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .lists
                .get(selector)
                .cloned()
                .unwrap_or_default())
        }

        async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>, DriverError> {
            Ok(b"page".to_vec())
        }

        async fn element_screenshots(&self, selector: &str) -> Result<Vec<Vec<u8>>, DriverError> {
            let count = self
                .state
                .lock()
                .unwrap()
                .lists
                .get(selector)
                .map(Vec::len)
                .unwrap_or(0);
            Ok((0..count).map(|i| format!("img-{i}").into_bytes()).collect())
        }

        async fn close(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemorySink {
        stored: Mutex<Vec<EvidenceCapture>>,
    }

    #[async_trait]
    impl EvidenceSink for MemorySink {
        async fn store(&self, capture: EvidenceCapture) -> Result<StoredEvidence, EvidenceError> {
            let mut stored = self.stored.lock().unwrap();
            let key = format!(
                "mem/{}/{}-{}.png",
                capture.source.as_str().to_lowercase(),
                capture.label,
                stored.len()
            );
            stored.push(capture);
            Ok(StoredEvidence {
                media_id: Uuid::new_v4(),
                url: format!("https://cdn.test/{key}"),
                key,
            })
        }
    }

    #[derive(Default)]
    struct EchoText {
        requests: Mutex<Vec<ChallengeTextRequest>>,
    }

    #[async_trait]
    impl TextGenerator for EchoText {
        async fn generate(
            &self,
            request: &ChallengeTextRequest,
        ) -> Result<String, TextGenerationError> {
            self.requests.lock().unwrap().push(request.clone());
            Ok(format!("Appeal for {}", request.pcn_number))
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
            default_wait: Duration::from_millis(50),
            poll_initial: Duration::from_millis(1),
            poll_max: Duration::from_millis(2),
        }
    }

    fn services() -> (EngineServices, Arc<MemorySink>, Arc<EchoText>) {
        let sink = Arc::new(MemorySink::default());
        let text = Arc::new(EchoText::default());
        (
            EngineServices {
                evidence: sink.clone(),
                text: text.clone(),
            },
            sink,
            text,
        )
    }

    fn vars() -> HashMap<String, String> {
        HashMap::from([
            ("pcn_number".to_string(), "LW123".to_string()),
            ("vrm".to_string(), "AB12CDE".to_string()),
            ("address_line1".to_string(), "12 Catford Road".to_string()),
            ("reason_label".to_string(), "Contravention did not occur".to_string()),
        ])
    }

    #[tokio::test]
    async fn runs_access_sequence_with_templates() {
        let page = FakePage::with(|s| {
            s.present.insert("#pcn".into(), String::new());
            s.present.insert("#vrm".into(), String::new());
            s.present.insert("#go".into(), String::new());
            s.url_after_click
                .insert("#go".into(), "https://portal.test/details".into());
        });
        let (services, _, _) = services();
        let recipe = Recipe::new(vec![
            Step::Navigate {
                url: "https://portal.test/?ref={{pcn_number}}".into(),
            },
            Step::Fill {
                selector: "#pcn".into(),
                value: "{{pcn_number}}".into(),
            },
            Step::Fill {
                selector: "#vrm".into(),
                value: "{{vrm}}".into(),
            },
            Step::Click {
                selector: "#go".into(),
            },
            Step::WaitFor {
                condition: WaitCondition::UrlContains {
                    fragment: "/details".into(),
                },
                timeout_ms: None,
            },
        ]);

        let report = StepEngine::new(&page, &services, settings())
            .with_variables(vars())
            .run(&recipe)
            .await;

        assert!(report.succeeded(), "{:?}", report.outcome);
        assert_eq!(report.completed_steps(), 5);
        assert_eq!(
            page.actions(),
            vec![
                "goto https://portal.test/?ref=LW123",
                "fill #pcn=LW123",
                "fill #vrm=AB12CDE",
                "click #go",
            ]
        );
    }

    #[tokio::test]
    async fn transient_selector_failures_are_retried() {
        let page = FakePage::with(|s| {
            s.present.insert("#submit".into(), String::new());
            s.flaky.insert("#submit".into(), 2);
        });
        let (services, _, _) = services();
        let recipe = Recipe::new(vec![Step::Click {
            selector: "#submit".into(),
        }]);

        let report = StepEngine::new(&page, &services, settings()).run(&recipe).await;

        assert!(report.succeeded());
        assert_eq!(report.records[0].attempts, 3);
    }

    #[tokio::test]
    async fn failure_keeps_partial_progress() {
        let page = FakePage::with(|s| {
            s.present.insert("#pcn".into(), String::new());
        });
        let (services, _, _) = services();
        let recipe = Recipe::new(vec![
            Step::Fill {
                selector: "#pcn".into(),
                value: "{{pcn_number}}".into(),
            },
            Step::Click {
                selector: "#missing".into(),
            },
            Step::Click {
                selector: "#pcn".into(),
            },
        ]);

        let report = StepEngine::new(&page, &services, settings())
            .with_variables(vars())
            .run(&recipe)
            .await;

        assert_eq!(report.completed_steps(), 1);
        match report.outcome {
            RunOutcome::Failed {
                position,
                kind,
                attempts,
                transient,
                ..
            } => {
                assert_eq!(position, "2");
                assert_eq!(kind, "click");
                assert_eq!(attempts, 3);
                assert!(transient);
            }
            RunOutcome::Completed => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn unknown_variables_fail_without_retry() {
        let page = FakePage::with(|s| {
            s.present.insert("#postcode".into(), String::new());
        });
        let (services, _, _) = services();
        let recipe = Recipe::new(vec![Step::Fill {
            selector: "#postcode".into(),
            value: "{{postcode}}".into(),
        }]);

        let report = StepEngine::new(&page, &services, settings()).run(&recipe).await;

        match report.outcome {
            RunOutcome::Failed {
                attempts, transient, ..
            } => {
                assert_eq!(attempts, 1);
                assert!(!transient);
            }
            RunOutcome::Completed => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn wait_for_polls_until_selector_appears() {
        let page = FakePage::with(|s| {
            s.present.insert(".confirmation".into(), String::new());
            s.appear_after_polls.insert(".confirmation".into(), 3);
        });
        let (services, _, _) = services();
        let recipe = Recipe::new(vec![Step::WaitFor {
            condition: WaitCondition::Selector {
                selector: ".confirmation".into(),
            },
            timeout_ms: Some(1_000),
        }]);

        let report = StepEngine::new(&page, &services, settings()).run(&recipe).await;

        assert!(report.succeeded());
        assert_eq!(report.records[0].attempts, 1);
    }

    #[tokio::test]
    async fn wait_for_times_out() {
        let page = FakePage::default();
        let (services, _, _) = services();
        let recipe = Recipe::new(vec![Step::WaitFor {
            condition: WaitCondition::TextContains {
                selector: ".status".into(),
                text: "received".into(),
            },
            timeout_ms: Some(10),
        }]);

        let report = StepEngine::new(&page, &services, settings()).run(&recipe).await;

        match report.outcome {
            RunOutcome::Failed { error, kind, .. } => {
                assert_eq!(kind, "wait_for");
                assert!(error.contains("timed out"), "{error}");
            }
            RunOutcome::Completed => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn if_present_runs_nested_steps_only_when_selector_exists() {
        let page = FakePage::with(|s| {
            s.present.insert("#sub-reason".into(), String::new());
        });
        let (services, _, _) = services();
        let recipe = Recipe::new(vec![
            Step::IfPresent {
                selector: "#sub-reason".into(),
                steps: vec![Step::SelectOption {
                    selector: "#sub-reason".into(),
                    option: "Signs unclear".into(),
                }],
            },
            Step::IfPresent {
                selector: "#captcha".into(),
                steps: vec![Step::Click {
                    selector: "#captcha".into(),
                }],
            },
        ]);

        let report = StepEngine::new(&page, &services, settings()).run(&recipe).await;

        assert!(report.succeeded());
        let positions: Vec<_> = report.records.iter().map(|r| r.position.as_str()).collect();
        assert_eq!(positions, vec!["1", "1.1", "2"]);
        assert_eq!(page.actions(), vec!["select #sub-reason=Signs unclear"]);
    }

    #[tokio::test]
    async fn click_matching_picks_the_item_containing_the_address() {
        let page = FakePage::with(|s| {
            s.lists.insert(
                "li.address".into(),
                vec![
                    "1 Catford Road, London".into(),
                    "12  CATFORD road, London".into(),
                ],
            );
        });
        let (services, _, _) = services();
        let recipe = Recipe::new(vec![Step::ClickMatching {
            selector: "li.address".into(),
            contains: "{{address_line1}}".into(),
            on_no_match: NoMatch::Fail,
        }]);

        let report = StepEngine::new(&page, &services, settings())
            .with_variables(vars())
            .run(&recipe)
            .await;

        assert!(report.succeeded());
        assert_eq!(page.actions(), vec!["click li.address[1]"]);
    }

    #[test]
    fn pick_matching_respects_no_match_policy() {
        let items = vec!["Flat 3, 9 High Street".to_string()];
        assert_eq!(pick_matching(&items, "12 Catford Road", NoMatch::Fail), None);
        assert_eq!(
            pick_matching(&items, "12 Catford Road", NoMatch::First),
            Some(Pick::Fallback(0))
        );
        assert_eq!(pick_matching(&items, "", NoMatch::Fail), None);
        assert_eq!(pick_matching(&[], "x", NoMatch::First), None);
    }

    #[tokio::test]
    async fn generates_text_from_portal_prompt_and_captured_evidence() {
        let page = FakePage::with(|s| {
            s.present.insert("textarea#details".into(), String::new());
            s.placeholders
                .insert("textarea#details".into(), "Tell us why".into());
            s.lists
                .insert(".gallery img".into(), vec![String::new(), String::new()]);
        });
        let (services, sink, text) = services();
        let recipe = Recipe::new(vec![
            Step::CaptureGallery {
                selector: ".gallery img".into(),
                label: "pcn-photo".into(),
            },
            Step::ExtractText {
                selector: "textarea#details".into(),
                into: "portal_prompt".into(),
                source: TextSource::Placeholder,
            },
            Step::GenerateText {
                prompt_from: Some("portal_prompt".into()),
                into: "challenge_text".into(),
            },
            Step::Fill {
                selector: "textarea#details".into(),
                value: "{{challenge_text}}".into(),
            },
            Step::Screenshot {
                label: "submitted".into(),
                full_page: true,
            },
        ]);

        let report = StepEngine::new(&page, &services, settings())
            .with_variables(vars())
            .with_evidence_urls(vec!["https://cdn.test/upload.png".into()])
            .run(&recipe)
            .await;

        assert!(report.succeeded(), "{:?}", report.outcome);
        assert_eq!(report.generated_text.as_deref(), Some("Appeal for LW123"));
        assert_eq!(report.captured["portal_prompt"], "Tell us why");
        assert_eq!(sink.stored.lock().unwrap().len(), 3);

        let requests = text.requests.lock().unwrap();
        assert_eq!(requests[0].portal_prompt.as_deref(), Some("Tell us why"));
        assert_eq!(requests[0].reason_label, "Contravention did not occur");
        assert_eq!(requests[0].evidence_urls.len(), 3);
        assert!(page
            .actions()
            .contains(&"fill textarea#details=Appeal for LW123".to_string()));
    }

    #[tokio::test]
    async fn sleep_step_records_its_reason() {
        let page = FakePage::default();
        let (services, _, _) = services();
        let recipe = Recipe::new(vec![Step::Sleep {
            duration_ms: 5,
            reason: "gallery fade-in".into(),
        }]);

        let report = StepEngine::new(&page, &services, settings()).run(&recipe).await;

        assert!(report.succeeded());
        assert_eq!(report.records[0].note.as_deref(), Some("gallery fade-in"));
    }
}
