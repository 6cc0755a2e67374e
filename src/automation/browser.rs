//! Browser seam used by the step engine.
//!
//! The engine only ever talks to a [`PageDriver`]; production runs get a
//! Chromium page from [`super::chromium::ChromiumProvider`], tests script a
//! fake one.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("failed to launch browser: {0}")]
    Launch(String),
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("no element matches selector `{selector}`")]
    SelectorNotFound { selector: String },
    #[error("element `{selector}` has no option `{option}`")]
    OptionNotFound { selector: String, option: String },
    #[error("browser protocol error: {0}")]
    Protocol(String),
}

impl DriverError {
    pub fn selector_not_found(selector: &str) -> Self {
        Self::SelectorNotFound {
            selector: selector.to_string(),
        }
    }
}

/// A single page in a browser context opened for one automation run.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<(), DriverError>;

    async fn current_url(&self) -> Result<String, DriverError>;

    async fn exists(&self, selector: &str) -> Result<bool, DriverError>;

    /// Replaces the current value of an input or textarea.
    async fn fill(&self, selector: &str, value: &str) -> Result<(), DriverError>;

    async fn click(&self, selector: &str) -> Result<(), DriverError>;

    async fn click_nth(&self, selector: &str, index: usize) -> Result<(), DriverError>;

    /// Selects the `<option>` whose label or value equals `option`.
    async fn select_option(&self, selector: &str, option: &str) -> Result<(), DriverError>;

    async fn set_checked(&self, selector: &str, checked: bool) -> Result<(), DriverError>;

    async fn text(&self, selector: &str) -> Result<String, DriverError>;

    async fn value(&self, selector: &str) -> Result<String, DriverError>;

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, DriverError>;

    /// Inner text of every element matching `selector`, in document order.
    async fn texts(&self, selector: &str) -> Result<Vec<String>, DriverError>;

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, DriverError>;

    /// PNG captures of every element matching `selector`.
    async fn element_screenshots(&self, selector: &str) -> Result<Vec<Vec<u8>>, DriverError>;

    async fn close(&self) -> Result<(), DriverError>;
}

#[async_trait]
pub trait BrowserProvider: Send + Sync + 'static {
    async fn open(&self) -> Result<Box<dyn PageDriver>, DriverError>;
}
