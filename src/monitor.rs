//! Runtime monitor: the per-run event log, observer fan-out, and the
//! status projection derived from them.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::Action;

/// Lifecycle stage of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Started,
    Success,
    Failed,
}

/// Overall state of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
}

/// One lifecycle transition of one step. Append-only; the field set is the
/// stable schema of the persisted log file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub execution_id: Uuid,
    pub step_index: usize,
    pub action: String,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<String>,
}

impl ExecutionEvent {
    fn base(execution_id: Uuid, step_index: usize, action: &Action, status: StepStatus) -> Self {
        Self {
            execution_id,
            step_index,
            action: action.name().to_string(),
            status,
            timestamp: Utc::now(),
            selector: action.selector().map(str::to_string),
            url: action.url().map(str::to_string),
            value: action.value().map(str::to_string),
            error: None,
            screenshot_path: None,
        }
    }

    pub fn started(execution_id: Uuid, step_index: usize, action: &Action) -> Self {
        Self::base(execution_id, step_index, action, StepStatus::Started)
    }

    pub fn success(execution_id: Uuid, step_index: usize, action: &Action) -> Self {
        Self::base(execution_id, step_index, action, StepStatus::Success)
    }

    pub fn failed(
        execution_id: Uuid,
        step_index: usize,
        action: &Action,
        error: impl Into<String>,
    ) -> Self {
        let mut event = Self::base(execution_id, step_index, action, StepStatus::Failed);
        event.error = Some(error.into());
        event
    }

    /// Override the URL with what the executor actually observed.
    pub fn with_url(mut self, url: Option<String>) -> Self {
        if url.is_some() {
            self.url = url;
        }
        self
    }

    pub fn with_screenshot(mut self, path: Option<String>) -> Self {
        self.screenshot_path = path;
        self
    }
}

/// Aggregate view over the event log, recomputed on demand.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStatus {
    pub state: RunState,
    pub total_steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub errors: Vec<String>,
    pub urls_visited: Vec<String>,
}

type Observer = Box<dyn FnMut(&ExecutionEvent) + Send>;

/// In-process pub/sub for execution events, plus the durable ordered log
/// for one task run. Created per run, discarded with it.
pub struct RuntimeMonitor {
    events: Vec<ExecutionEvent>,
    observers: Vec<Observer>,
    total_steps: usize,
    state: RunState,
}

impl Default for RuntimeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMonitor {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            observers: Vec::new(),
            total_steps: 0,
            state: RunState::Pending,
        }
    }

    /// Register an observer. Observers are invoked synchronously, in
    /// registration order, for every published event. The same closure may
    /// be registered more than once.
    pub fn subscribe<F>(&mut self, observer: F)
    where
        F: FnMut(&ExecutionEvent) + Send + 'static,
    {
        self.observers.push(Box::new(observer));
    }

    /// Append to the log and deliver to all observers. A panicking observer
    /// is isolated: delivery continues with the next one and the run's own
    /// outcome is unaffected.
    pub fn publish(&mut self, event: ExecutionEvent) {
        self.events.push(event);
        let Some(event) = self.events.last() else {
            return;
        };
        for observer in &mut self.observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(event))) {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                tracing::warn!(step = event.step_index, %message, "observer panicked; dropped");
            }
        }
    }

    /// The full ordered event log.
    pub fn log(&self) -> &[ExecutionEvent] {
        &self.events
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn plan_activated(&mut self, total_steps: usize) {
        self.total_steps = total_steps;
    }

    pub(crate) fn transition(&mut self, state: RunState) {
        self.state = state;
    }

    /// Recompute the aggregate status from the log. A step counts as
    /// completed or failed according to its latest terminal event, so a
    /// step that failed and later succeeded after a replan counts once, as
    /// completed. Stale indexes from a superseded longer plan are ignored.
    pub fn status(&self) -> ExecutionStatus {
        let mut outcomes: Vec<Option<StepStatus>> = vec![None; self.total_steps];
        let mut errors = Vec::new();
        let mut urls_visited: Vec<String> = Vec::new();

        for event in &self.events {
            if let Some(error) = &event.error {
                errors.push(error.clone());
            }
            let navigated = event.action == "open" || event.status == StepStatus::Success;
            if navigated {
                if let Some(url) = &event.url {
                    if !urls_visited.iter().any(|seen| seen == url) {
                        urls_visited.push(url.clone());
                    }
                }
            }
            if event.status != StepStatus::Started && event.step_index < self.total_steps {
                outcomes[event.step_index] = Some(event.status);
            }
        }

        let completed = outcomes
            .iter()
            .filter(|o| **o == Some(StepStatus::Success))
            .count();
        let failed = outcomes
            .iter()
            .filter(|o| **o == Some(StepStatus::Failed))
            .count();

        ExecutionStatus {
            state: self.state,
            total_steps: self.total_steps,
            completed,
            failed,
            errors,
            urls_visited,
        }
    }

    /// Persist the log as one JSON document, the artifact downstream report
    /// tooling consumes.
    pub fn save_log(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
        let file = std::fs::File::create(path)
            .with_context(|| format!("creating log file {}", path.display()))?;
        serde_json::to_writer_pretty(std::io::BufWriter::new(file), &self.events)
            .context("serializing event log")?;
        Ok(())
    }
}

/// Observer that prints step lifecycle lines to the terminal.
pub fn console_observer() -> impl FnMut(&ExecutionEvent) + Send + 'static {
    |event: &ExecutionEvent| {
        let mark = match event.status {
            StepStatus::Started => '→',
            StepStatus::Success => '✓',
            StepStatus::Failed => '✗',
        };
        let mut line = format!(
            "[{}] {} step {}: {}",
            event.timestamp.format("%H:%M:%S"),
            mark,
            event.step_index,
            event.action
        );
        if let Some(selector) = &event.selector {
            line.push_str(&format!(" ({selector})"));
        } else if let Some(url) = &event.url {
            line.push_str(&format!(" ({url})"));
        }
        if let Some(error) = &event.error {
            line.push_str(&format!("\n    error: {error}"));
        }
        println!("{line}");
    }
}
