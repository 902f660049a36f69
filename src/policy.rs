//! Safety gate run over every action before it reaches the executor.

use crate::action::Action;

/// Substrings that must never appear in a plan's string parameters,
/// matched case-insensitively.
const DEFAULT_DENYLIST: &[&str] = &[
    "javascript:",
    "data:text/html",
    "eval(",
    "<script",
    "document.cookie",
    "document.write",
];

/// Parameter-level checks on top of the closed action enum. The enum itself
/// guarantees the variant whitelist; this gate rejects dangerous parameter
/// content and structurally invalid values. Violations are fatal and never
/// fed back into replanning.
#[derive(Debug, Clone)]
pub struct SafetyPolicy {
    denylist: Vec<String>,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            denylist: DEFAULT_DENYLIST.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SafetyPolicy {
    /// Extend the default denylist with caller-supplied entries.
    pub fn with_denied(mut self, entries: impl IntoIterator<Item = String>) -> Self {
        self.denylist
            .extend(entries.into_iter().map(|e| e.to_lowercase()));
        self
    }

    /// Check one action. Returns the violation detail on failure.
    pub fn check(&self, action: &Action) -> Result<(), String> {
        match action {
            Action::Open { url } => {
                if url.trim().is_empty() {
                    return Err("open requires a non-empty url".into());
                }
                self.check_text("url", url)
            }
            Action::Type { selector, value } => {
                if selector.trim().is_empty() {
                    return Err("type requires a non-empty selector".into());
                }
                self.check_text("selector", selector)?;
                self.check_text("value", value)
            }
            Action::Click { selector } => {
                if selector.trim().is_empty() {
                    return Err("click requires a non-empty selector".into());
                }
                self.check_text("selector", selector)
            }
            Action::Wait { seconds } => {
                if !seconds.is_finite() || *seconds <= 0.0 {
                    return Err(format!("wait requires a positive duration, got {seconds}"));
                }
                Ok(())
            }
            Action::Screenshot => Ok(()),
        }
    }

    fn check_text(&self, field: &str, text: &str) -> Result<(), String> {
        let lowered = text.to_lowercase();
        for denied in &self.denylist {
            if lowered.contains(denied.as_str()) {
                return Err(format!("{field} contains denied substring '{denied}'"));
            }
        }
        Ok(())
    }
}
