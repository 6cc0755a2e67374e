//! Portal automation: recipes, the step engine that replays them, and the
//! orchestration that decides when to learn, wait or run.

pub mod auto_challenge;
pub mod backoff;
pub mod browser;
pub mod challenges;
pub mod chromium;
pub mod context;
pub mod dispatcher;
pub mod engine;
pub mod evidence;
pub mod issuers;
pub mod metadata;
pub mod recipes;
pub mod remote;
pub mod review;
pub mod steps;
pub mod text_gen;
pub mod webhook;

use std::sync::Arc;

pub use auto_challenge::{initiate_auto_challenge, AutoChallengeResult, AutoChallengeStatus};
pub use browser::{BrowserProvider, DriverError, PageDriver};
pub use dispatcher::{dispatch, try_dispatch, AutomationError};
pub use engine::{RunOutcome, RunReport, StepEngine};
pub use issuers::{ChallengeReason, Intent};
pub use remote::RemoteJobClient;
pub use steps::{Recipe, Step};
pub use text_gen::TextGenerator;

use crate::config::AppConfig;

/// External collaborators the automation paths call out to.
#[derive(Clone)]
pub struct AutomationServices {
    pub browser: Arc<dyn BrowserProvider>,
    pub text: Arc<dyn TextGenerator>,
    pub remote: Arc<dyn RemoteJobClient>,
}

impl AutomationServices {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            browser: Arc::new(chromium::ChromiumProvider::new(
                config.browser_headless,
                config.browser_executable.clone(),
            )),
            text: Arc::new(text_gen::OpenAiTextGenerator::new(
                config.openai_base_url.clone(),
                config.openai_api_key.clone(),
                config.openai_model.clone(),
            )),
            remote: remote::remote_jobs_from_config(config),
        }
    }
}
