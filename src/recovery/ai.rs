use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cli::config::AiSettings;
use crate::error::WorkflowError;
use crate::recovery::rules::ActionSpec;
use crate::recovery::ErrorContext;

/// A recovery proposal produced by the AI fallback: a named action plan
/// in the same shape a rule carries, plus the model's confidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiProposal {
    pub rule_name: String,
    pub confidence: f64,
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

/// Proposes recovery plans for errors no rule matched.
#[async_trait]
pub trait AiClient: Send + Sync {
    async fn propose_solution(&self, prompt: &str) -> Result<AiProposal, WorkflowError>;
}

/// Build the prompt from the error context and the rules already tried,
/// so the model does not re-propose a plan that just failed.
pub fn build_prompt(ctx: &ErrorContext) -> String {
    let status = ctx
        .response
        .status_code
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".to_string());
    let headers: Vec<String> = ctx
        .response
        .headers
        .iter()
        .map(|(name, values)| format!("{}: {}", name, values.join(", ")))
        .collect();
    let body_excerpt: String = ctx.response.body.chars().take(1000).collect();
    let attempted = if ctx.attempted_rules.is_empty() {
        "none".to_string()
    } else {
        ctx.attempted_rules.join(", ")
    };

    format!(
        "A web crawler hit an error it has no recovery rule for.\n\
         \n\
         Error: {error}\n\
         URL: {url}\n\
         Domain: {domain}\n\
         HTTP status: {status}\n\
         Retry count: {retries}\n\
         Response headers:\n{headers}\n\
         Response body (excerpt):\n{body}\n\
         \n\
         Already attempted rules (do not repeat them): {attempted}\n\
         \n\
         Propose a recovery plan as JSON with this exact shape:\n\
         {{\n\
           \"rule_name\": \"short_snake_case_name\",\n\
           \"confidence\": 0.0-1.0,\n\
           \"actions\": [{{\"action\": \"<name>\", \"params\": {{...}}}}]\n\
         }}\n\
         Allowed actions: pause_execution, wait (params: duration_ms), \
         reduce_workers (params: target), add_delay (params: delay_ms), \
         resume, rotate_fingerprint, clear_cookies.\n\
         Respond with JSON only.",
        error = ctx.error_message,
        url = ctx.url,
        domain = ctx.domain,
        status = status,
        retries = ctx.retry_count,
        headers = headers.join("\n"),
        body = body_excerpt,
        attempted = attempted,
    )
}

/// OpenAI-compatible chat-completions client.
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn from_settings(settings: &AiSettings) -> Result<Self, WorkflowError> {
        let api_key = std::env::var(&settings.api_key_env).map_err(|_| {
            WorkflowError::Ai(format!(
                "AI recovery is enabled but {} is not set",
                settings.api_key_env
            ))
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| WorkflowError::Ai(format!("failed to build AI client: {}", e)))?;
        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl AiClient for OpenAiClient {
    async fn propose_solution(&self, prompt: &str) -> Result<AiProposal, WorkflowError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You design recovery plans for a web crawler. Respond with JSON only."
                },
                { "role": "user", "content": prompt }
            ],
            "temperature": 0.2,
        });

        debug!(model = %self.model, "requesting AI recovery proposal");
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| WorkflowError::Ai(format!("AI request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Ai(format!(
                "AI request returned {}: {}",
                status, text
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| WorkflowError::Ai(format!("AI response was not JSON: {}", e)))?;
        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| WorkflowError::Ai("AI response had no message content".to_string()))?;

        parse_proposal(content)
    }
}

/// Parse the model's reply, tolerating markdown code fences.
pub fn parse_proposal(content: &str) -> Result<AiProposal, WorkflowError> {
    let trimmed = strip_fences(content);
    let proposal: AiProposal = serde_json::from_str(trimmed).map_err(|e| {
        warn!("unparseable AI proposal: {}", e);
        WorkflowError::Ai(format!("AI proposal was not valid JSON: {}", e))
    })?;
    if proposal.actions.is_empty() {
        return Err(WorkflowError::Ai("AI proposal had no actions".to_string()));
    }
    Ok(proposal)
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let trimmed = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    trimmed.strip_suffix("```").unwrap_or(trimmed).trim()
}
