//! Task planning against an OpenRouter-compatible chat-completions API.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::action::{Action, Plan};
use crate::error::PlannerError;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Action tags the planner is allowed to emit. Anything else is rejected
/// before an `Action` value ever exists.
const WHITELISTED_ACTIONS: &[&str] = &["open", "type", "click", "wait", "screenshot"];

/// Page-snapshot characters forwarded in a refine prompt.
const SNAPSHOT_CONTEXT_MAX_CHARS: usize = 1200;

const SYSTEM_PROMPT: &str = r#"You are a browser automation planner. Convert the user's instruction into an ordered JSON plan.

Allowed actions:
- {"action":"open","url":"https://..."}
- {"action":"type","selector":"css selector","value":"text to type"}
- {"action":"click","selector":"css selector"}
- {"action":"wait","seconds":2}
- {"action":"screenshot"}

Rules:
1. Return ONLY a JSON object of the form {"steps":[...]}. No markdown, no explanation.
2. Use only the five actions above. Selectors are CSS selectors.
3. Never use javascript: URLs or script injection of any kind.
4. Keep the plan minimal and safe."#;

/// Whether a refined plan replaces the whole active plan or only the step
/// that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplanScope {
    FullPlan,
    ReplaceFailedStep,
}

/// A corrective plan plus how the engine should install it.
#[derive(Debug, Clone)]
pub struct Refinement {
    pub plan: Plan,
    pub scope: ReplanScope,
}

/// Produces plans and corrective replans.
///
/// Convention: the shipped OpenRouter adapter always returns a full
/// replacement plan (`ReplanScope::FullPlan`); the engine honors
/// `ReplaceFailedStep` for planners that patch in place.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, prompt: &str) -> Result<Plan, PlannerError>;

    async fn refine(
        &self,
        active: &Plan,
        failed_index: usize,
        error: &str,
        snapshot: &str,
    ) -> Result<Refinement, PlannerError>;
}

#[async_trait]
impl<P: Planner + ?Sized> Planner for &P {
    async fn plan(&self, prompt: &str) -> Result<Plan, PlannerError> {
        (**self).plan(prompt).await
    }

    async fn refine(
        &self,
        active: &Plan,
        failed_index: usize,
        error: &str,
        snapshot: &str,
    ) -> Result<Refinement, PlannerError> {
        (**self).refine(active, failed_index, error, snapshot).await
    }
}

/// Chat-completions planner client.
pub struct OpenRouterPlanner {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenRouterPlanner {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn complete(&self, user_prompt: &str) -> Result<String, PlannerError> {
        let response = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": SYSTEM_PROMPT},
                    {"role": "user", "content": user_prompt},
                ],
                "temperature": 0.3,
                "max_tokens": 2000,
            }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("unknown API error")
                .to_string();
            return Err(PlannerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(PlannerError::EmptyResponse)?;
        tracing::debug!(model = %self.model, "planner replied: {content}");
        Ok(content.to_string())
    }
}

#[async_trait]
impl Planner for OpenRouterPlanner {
    async fn plan(&self, prompt: &str) -> Result<Plan, PlannerError> {
        let content = self.complete(prompt).await?;
        parse_plan(&content)
    }

    async fn refine(
        &self,
        active: &Plan,
        failed_index: usize,
        error: &str,
        snapshot: &str,
    ) -> Result<Refinement, PlannerError> {
        let prompt = refine_prompt(active, failed_index, error, snapshot);
        let content = self.complete(&prompt).await?;
        let plan = parse_plan(&content)?;
        if plan.is_empty() {
            return Err(PlannerError::EmptyRefinement);
        }
        Ok(Refinement {
            plan,
            scope: ReplanScope::FullPlan,
        })
    }
}

fn refine_prompt(active: &Plan, failed_index: usize, error: &str, snapshot: &str) -> String {
    let failed_step = active
        .get(failed_index)
        .and_then(|a| serde_json::to_string(a).ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut prompt = format!(
        "The plan failed at step {failed_index}.\nError: {error}\nFailed step: {failed_step}\n"
    );
    if !snapshot.is_empty() {
        let truncated: String = snapshot.chars().take(SNAPSHOT_CONTEXT_MAX_CHARS).collect();
        prompt.push_str(&format!("\nCurrent page:\n{truncated}\n"));
    }
    prompt.push_str(
        "\nProduce a complete corrected plan that avoids the failure, \
         for example by using a different selector or waiting for the page to settle.",
    );
    prompt
}

/// Parse an LLM reply into a plan, validating each step against the action
/// whitelist. Tolerates markdown code fences around the JSON.
pub(crate) fn parse_plan(content: &str) -> Result<Plan, PlannerError> {
    let cleaned = strip_fences(content);
    let value: serde_json::Value = serde_json::from_str(cleaned)
        .map_err(|e| PlannerError::Malformed(format!("invalid JSON: {e}")))?;

    let steps = value
        .get("steps")
        .and_then(|s| s.as_array())
        .ok_or_else(|| PlannerError::Malformed("missing 'steps' array".into()))?;

    let mut actions = Vec::with_capacity(steps.len());
    for (index, raw) in steps.iter().enumerate() {
        let tag = raw
            .get("action")
            .and_then(|a| a.as_str())
            .ok_or_else(|| PlannerError::Malformed(format!("step {index} has no 'action' tag")))?;
        if !WHITELISTED_ACTIONS.contains(&tag) {
            return Err(PlannerError::UnsupportedAction(tag.to_string()));
        }
        let action: Action = serde_json::from_value(raw.clone())
            .map_err(|e| PlannerError::Malformed(format!("step {index} ({tag}): {e}")))?;
        actions.push(action);
    }
    Ok(Plan::new(actions))
}

fn strip_fences(content: &str) -> &str {
    content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}
