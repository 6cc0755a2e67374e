use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::browser::{BrowserProvider, DriverError, PageDriver};

/// Launches a fresh Chromium process per run.
#[derive(Debug, Clone)]
pub struct ChromiumProvider {
    headless: bool,
    executable: Option<String>,
}

impl ChromiumProvider {
    pub fn new(headless: bool, executable: Option<String>) -> Self {
        Self {
            headless,
            executable,
        }
    }
}

#[async_trait]
impl BrowserProvider for ChromiumProvider {
    async fn open(&self) -> Result<Box<dyn PageDriver>, DriverError> {
        let mut builder = BrowserConfig::builder().no_sandbox();
        if !self.headless {
            builder = builder.with_head().window_size(1280, 900);
        }
        if let Some(path) = &self.executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(DriverError::Launch)?;

        info!(
            headless = self.headless,
            executable = ?self.executable,
            "launching chromium"
        );

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| DriverError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move { while handler.next().await.is_some() {} });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(err) => {
                handler_task.abort();
                return Err(DriverError::Launch(format!("failed to open page: {err}")));
            }
        };

        Ok(Box::new(ChromiumPage {
            page,
            browser: Mutex::new(Some(browser)),
            handler_task: Mutex::new(Some(handler_task)),
        }))
    }
}

pub struct ChromiumPage {
    page: Page,
    browser: Mutex<Option<Browser>>,
    handler_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Deserialize)]
struct AttributeLookup {
    found: bool,
    value: Option<String>,
}

impl ChromiumPage {
    async fn eval<T: DeserializeOwned>(&self, script: String) -> Result<T, DriverError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|err| DriverError::Protocol(err.to_string()))?;
        result
            .into_value::<T>()
            .map_err(|err| DriverError::Protocol(format!("unexpected script result: {err}")))
    }
}

fn js_string(raw: &str) -> String {
    Value::String(raw.to_string()).to_string()
}

#[async_trait]
impl PageDriver for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<(), DriverError> {
        debug!(%url, "navigating");
        self.page
            .goto(url)
            .await
            .map_err(|err| DriverError::Navigation {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, DriverError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|err| DriverError::Protocol(err.to_string()))?;
        Ok(url.unwrap_or_default())
    }

    async fn exists(&self, selector: &str) -> Result<bool, DriverError> {
        self.eval(format!(
            "document.querySelector({}) !== null",
            js_string(selector)
        ))
        .await
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), DriverError> {
        let filled: bool = self
            .eval(format!(
                r#"(() => {{
                    const el = document.querySelector({sel});
                    if (!el) return false;
                    el.focus();
                    el.value = {val};
                    el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                    return true;
                }})()"#,
                sel = js_string(selector),
                val = js_string(value),
            ))
            .await?;
        if filled {
            Ok(())
        } else {
            Err(DriverError::selector_not_found(selector))
        }
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| DriverError::selector_not_found(selector))?;
        element
            .click()
            .await
            .map_err(|err| DriverError::Protocol(format!("click on `{selector}` failed: {err}")))?;
        Ok(())
    }

    async fn click_nth(&self, selector: &str, index: usize) -> Result<(), DriverError> {
        let elements = self
            .page
            .find_elements(selector)
            .await
            .map_err(|_| DriverError::selector_not_found(selector))?;
        let element = elements
            .get(index)
            .ok_or_else(|| DriverError::selector_not_found(selector))?;
        element
            .click()
            .await
            .map_err(|err| DriverError::Protocol(format!("click on `{selector}` failed: {err}")))?;
        Ok(())
    }

    async fn select_option(&self, selector: &str, option: &str) -> Result<(), DriverError> {
        let outcome: String = self
            .eval(format!(
                r#"(() => {{
                    const el = document.querySelector({sel});
                    if (!el) return 'missing-element';
                    const wanted = {opt};
                    const idx = Array.from(el.options || []).findIndex(
                        (o) => o.text.trim() === wanted || o.value === wanted
                    );
                    if (idx < 0) return 'missing-option';
                    el.selectedIndex = idx;
                    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                    return 'ok';
                }})()"#,
                sel = js_string(selector),
                opt = js_string(option),
            ))
            .await?;
        match outcome.as_str() {
            "ok" => Ok(()),
            "missing-option" => Err(DriverError::OptionNotFound {
                selector: selector.to_string(),
                option: option.to_string(),
            }),
            _ => Err(DriverError::selector_not_found(selector)),
        }
    }

    async fn set_checked(&self, selector: &str, checked: bool) -> Result<(), DriverError> {
        let found: bool = self
            .eval(format!(
                r#"(() => {{
                    const el = document.querySelector({sel});
                    if (!el) return false;
                    if (el.checked !== {checked}) el.click();
                    return true;
                }})()"#,
                sel = js_string(selector),
            ))
            .await?;
        if found {
            Ok(())
        } else {
            Err(DriverError::selector_not_found(selector))
        }
    }

    async fn text(&self, selector: &str) -> Result<String, DriverError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|_| DriverError::selector_not_found(selector))?;
        let text = element
            .inner_text()
            .await
            .map_err(|err| DriverError::Protocol(err.to_string()))?;
        Ok(text.unwrap_or_default().trim().to_string())
    }

    async fn value(&self, selector: &str) -> Result<String, DriverError> {
        let value: Option<String> = self
            .eval(format!(
                "(() => {{ const el = document.querySelector({}); return el ? (el.value ?? '') : null; }})()",
                js_string(selector)
            ))
            .await?;
        value.ok_or_else(|| DriverError::selector_not_found(selector))
    }

    async fn attribute(&self, selector: &str, name: &str) -> Result<Option<String>, DriverError> {
        let lookup: AttributeLookup = self
            .eval(format!(
                r#"(() => {{
                    const el = document.querySelector({sel});
                    return el ? {{ found: true, value: el.getAttribute({name}) }} : {{ found: false, value: null }};
                }})()"#,
                sel = js_string(selector),
                name = js_string(name),
            ))
            .await?;
        if lookup.found {
            Ok(lookup.value)
        } else {
            Err(DriverError::selector_not_found(selector))
        }
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>, DriverError> {
        self.eval(format!(
            "Array.from(document.querySelectorAll({})).map((el) => (el.innerText || el.textContent || '').trim())",
            js_string(selector)
        ))
        .await
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, DriverError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|err| DriverError::Protocol(format!("screenshot failed: {err}")))
    }

    async fn element_screenshots(&self, selector: &str) -> Result<Vec<Vec<u8>>, DriverError> {
        let elements = self
            .page
            .find_elements(selector)
            .await
            .map_err(|_| DriverError::selector_not_found(selector))?;
        let mut captures = Vec::with_capacity(elements.len());
        for element in elements {
            let bytes = element
                .screenshot(CaptureScreenshotFormat::Png)
                .await
                .map_err(|err| DriverError::Protocol(format!("element screenshot failed: {err}")))?;
            captures.push(bytes);
        }
        Ok(captures)
    }

    async fn close(&self) -> Result<(), DriverError> {
        if let Some(mut browser) = self.browser.lock().await.take() {
            if let Err(err) = browser.close().await {
                warn!(error = %err, "browser close returned error");
            }
            let _ = browser.wait().await;
        }
        if let Some(task) = self.handler_task.lock().await.take() {
            task.abort();
        }
        info!("browser closed");
        Ok(())
    }
}
