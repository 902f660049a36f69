//! Browser-side execution of single actions, bounded by a step timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};

use crate::action::Action;
use crate::dom;
use crate::error::{ExecutorError, ExecutorErrorKind};

/// What the executor observed while running one step.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    /// URL the tab showed after the step, when it could be read.
    pub url: Option<String>,
    /// Screenshot written for an explicit screenshot action.
    pub screenshot: Option<PathBuf>,
}

/// Performs whitelisted actions against a live browser session.
#[async_trait]
pub trait ActionExecutor: Send {
    /// Run one action, bounded by `timeout`. A timeout is reported as a
    /// failure, never a crash.
    async fn execute(
        &mut self,
        action: &Action,
        timeout: Duration,
    ) -> Result<StepReport, ExecutorError>;

    /// Best-effort page outline used as replanning context. Returns an
    /// empty string when the page cannot be read.
    async fn snapshot(&mut self) -> String;

    /// Best-effort screenshot of the page as it looked when a step failed.
    async fn failure_screenshot(&mut self, step_index: usize) -> Option<PathBuf>;
}

#[async_trait]
impl<X: ActionExecutor + ?Sized> ActionExecutor for &mut X {
    async fn execute(
        &mut self,
        action: &Action,
        timeout: Duration,
    ) -> Result<StepReport, ExecutorError> {
        (**self).execute(action, timeout).await
    }

    async fn snapshot(&mut self) -> String {
        (**self).snapshot().await
    }

    async fn failure_screenshot(&mut self, step_index: usize) -> Option<PathBuf> {
        (**self).failure_screenshot(step_index).await
    }
}

/// Executor backed by a persistent Chrome session.
pub struct ChromeExecutor {
    _browser: Browser,
    tab: Arc<Tab>,
    screenshot_dir: PathBuf,
}

impl ChromeExecutor {
    /// Attach to a Chrome already listening on the debug port, or launch a
    /// fresh one.
    pub fn launch(headless: bool, screenshot_dir: impl Into<PathBuf>) -> Result<Self> {
        let screenshot_dir = screenshot_dir.into();
        std::fs::create_dir_all(&screenshot_dir).with_context(|| {
            format!("creating screenshot dir {}", screenshot_dir.display())
        })?;

        if let Ok(browser) = Browser::connect("http://127.0.0.1:9222".to_string()) {
            tracing::info!("attached to existing Chrome on port 9222");
            let tab = {
                let tabs = browser.get_tabs().lock().map_err(|_| {
                    anyhow::anyhow!("browser tab registry poisoned")
                })?;
                tabs.first().cloned()
            };
            let tab = match tab {
                Some(tab) => tab,
                None => browser.new_tab()?,
            };
            return Ok(Self {
                _browser: browser,
                tab,
                screenshot_dir,
            });
        }

        tracing::info!(headless, "launching Chrome");
        let options = LaunchOptions {
            headless,
            window_size: Some((1920, 1080)),
            args: vec![
                std::ffi::OsStr::new("--no-first-run"),
                std::ffi::OsStr::new("--no-default-browser-check"),
                std::ffi::OsStr::new("--disable-dev-shm-usage"),
            ],
            idle_browser_timeout: Duration::from_secs(600),
            ..Default::default()
        };
        let browser = Browser::new(options).context("Chrome launch failed")?;
        let tab = browser.new_tab()?;
        tab.navigate_to("about:blank")?;

        Ok(Self {
            _browser: browser,
            tab,
            screenshot_dir,
        })
    }
}

#[async_trait]
impl ActionExecutor for ChromeExecutor {
    async fn execute(
        &mut self,
        action: &Action,
        timeout: Duration,
    ) -> Result<StepReport, ExecutorError> {
        let tab = self.tab.clone();
        let action = action.clone();
        let screenshot_dir = self.screenshot_dir.clone();

        // The browser protocol is blocking; run it off the async thread and
        // bound it. On timeout the blocking task is left to finish on its
        // own while the step is reported as failed.
        let work =
            tokio::task::spawn_blocking(move || run_action(&tab, &action, &screenshot_dir));
        match tokio::time::timeout(timeout, work).await {
            Err(_) => Err(ExecutorError::timeout(timeout)),
            Ok(Err(join)) => Err(ExecutorError::new(
                ExecutorErrorKind::Browser,
                format!("executor task aborted: {join}"),
            )),
            Ok(Ok(result)) => result,
        }
    }

    async fn snapshot(&mut self) -> String {
        let tab = self.tab.clone();
        let captured = tokio::task::spawn_blocking(move || {
            let url = dom::current_url(&tab).unwrap_or_else(|_| "about:blank".into());
            let title = dom::page_title(&tab).unwrap_or_default();
            let outline = dom::capture_page_outline(&tab).unwrap_or_default();
            format!("URL: {url}\nTitle: {title}\n{outline}")
        })
        .await;
        match captured {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::debug!("snapshot capture failed: {err}");
                String::new()
            }
        }
    }

    async fn failure_screenshot(&mut self, step_index: usize) -> Option<PathBuf> {
        let tab = self.tab.clone();
        let path = self
            .screenshot_dir
            .join(timestamped_name(&format!("error_step_{step_index}")));
        let saved = tokio::task::spawn_blocking(move || save_screenshot(&tab, &path)).await;
        match saved {
            Ok(Ok(path)) => Some(path),
            Ok(Err(err)) => {
                tracing::warn!(step_index, "failure screenshot not captured: {err}");
                None
            }
            Err(err) => {
                tracing::warn!(step_index, "screenshot task aborted: {err}");
                None
            }
        }
    }
}

fn run_action(
    tab: &Arc<Tab>,
    action: &Action,
    screenshot_dir: &Path,
) -> Result<StepReport, ExecutorError> {
    let mut report = StepReport::default();

    match action {
        Action::Open { url } => {
            tab.navigate_to(url)
                .and_then(|t| t.wait_until_navigated())
                .map_err(|e| ExecutorError::new(ExecutorErrorKind::Navigation, e.to_string()))?;
        }
        Action::Type { selector, value } => {
            let element = tab.wait_for_element(selector).map_err(|e| {
                ExecutorError::new(ExecutorErrorKind::ElementNotFound, e.to_string())
            })?;
            element
                .click()
                .map_err(|e| ExecutorError::new(ExecutorErrorKind::Browser, e.to_string()))?;
            let escaped = selector.replace('\'', "\\'");
            tab.evaluate(
                &format!("document.querySelector('{escaped}').value = ''"),
                false,
            )
            .map_err(|e| ExecutorError::new(ExecutorErrorKind::Browser, e.to_string()))?;
            tab.type_str(value)
                .map_err(|e| ExecutorError::new(ExecutorErrorKind::Browser, e.to_string()))?;
        }
        Action::Click { selector } => {
            let element = tab.wait_for_element(selector).map_err(|e| {
                ExecutorError::new(ExecutorErrorKind::ElementNotFound, e.to_string())
            })?;
            element
                .click()
                .map_err(|e| ExecutorError::new(ExecutorErrorKind::Browser, e.to_string()))?;
            // give the page a moment to react before the next step
            std::thread::sleep(Duration::from_millis(500));
        }
        Action::Wait { seconds } => {
            std::thread::sleep(Duration::from_secs_f64(*seconds));
        }
        Action::Screenshot => {
            let path = screenshot_dir.join(timestamped_name("step"));
            let saved = save_screenshot(tab, &path)
                .map_err(|e| ExecutorError::new(ExecutorErrorKind::Browser, e.to_string()))?;
            report.screenshot = Some(saved);
        }
    }

    report.url = dom::current_url(tab).ok();
    Ok(report)
}

fn save_screenshot(tab: &Arc<Tab>, path: &Path) -> Result<PathBuf> {
    let png = tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)?;
    std::fs::write(path, png).with_context(|| format!("writing {}", path.display()))?;
    Ok(path.to_path_buf())
}

fn timestamped_name(prefix: &str) -> String {
    format!("{prefix}_{}.png", Utc::now().format("%Y%m%d_%H%M%S%3f"))
}
