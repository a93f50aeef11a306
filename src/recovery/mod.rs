pub mod actions;
pub mod ai;
pub mod analyzer;
pub mod learning;
pub mod rules;
pub mod variables;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::browser::BrowserContext;
use crate::cli::config::RecoverySettings;
use crate::error::WorkflowError;
use crate::workflow::types::ResponseInfo;

pub use actions::{apply_actions, RecoveryAction, RecoveryControls};
pub use ai::{build_prompt, AiClient, AiProposal, OpenAiClient};
pub use analyzer::{ActivationDecision, ErrorPattern, PatternAnalyzer, PatternType};
pub use learning::LearningEngine;
pub use rules::{ActionSpec, ContextAwareRule, RuleOrigin, RuleSet};
pub use variables::DynamicVariable;

/// Everything known about one failure, assembled for rule matching,
/// variable resolution and AI prompting.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub execution_id: String,
    pub url: String,
    pub domain: String,
    pub error_message: String,
    pub response: ResponseInfo,
    pub retry_count: u32,
    /// Rule ids already tried for this failure, so matching never loops.
    pub attempted_rules: Vec<String>,
}

impl ErrorContext {
    pub fn new(
        execution_id: &str,
        url: &str,
        error: &WorkflowError,
        response: ResponseInfo,
        retry_count: u32,
    ) -> Self {
        let domain = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();
        Self {
            execution_id: execution_id.to_string(),
            url: url.to_string(),
            domain,
            error_message: error.to_string(),
            response,
            retry_count,
            attempted_rules: Vec::new(),
        }
    }

    /// Look a field up by name for rule conditions. `headers.<name>` digs
    /// into the response headers (case-insensitive, first value).
    pub fn field(&self, name: &str) -> Option<Value> {
        if let Some(header) = name.strip_prefix("headers.") {
            return self.response.header(header).map(|v| Value::from(v.to_string()));
        }
        match name {
            "status_code" => self.response.status_code.map(Value::from),
            "error_message" | "error" => Some(Value::from(self.error_message.clone())),
            "url" => Some(Value::from(self.url.clone())),
            "domain" => Some(Value::from(self.domain.clone())),
            "body" => Some(Value::from(self.response.body.clone())),
            "retry_count" => Some(Value::from(self.retry_count)),
            _ => None,
        }
    }

    /// Numeric inputs available to calculated-variable formulas.
    pub fn formula_inputs(&self) -> HashMap<String, f64> {
        let mut inputs = HashMap::new();
        if let Some(status) = self.response.status_code {
            inputs.insert("status_code".to_string(), status as f64);
        }
        inputs.insert("retry_count".to_string(), self.retry_count as f64);
        inputs
    }
}

/// Where a solution came from, for logging and outcome routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolutionOrigin {
    Rule { rule_id: String },
    Ai,
}

/// A resolved recovery plan: parsed actions plus the raw specs (kept for
/// learning fingerprints) and the variables that were substituted in.
#[derive(Debug, Clone)]
pub struct Solution {
    pub rule_name: String,
    pub actions: Vec<RecoveryAction>,
    pub action_specs: Vec<ActionSpec>,
    pub confidence: f64,
    pub variables: HashMap<String, Value>,
    pub origin: SolutionOrigin,
}

/// The adaptive recovery system: analyzer, rules engine, AI fallback and
/// learning engine behind one facade the executor talks to.
pub struct RecoverySystem {
    settings: RecoverySettings,
    analyzer: Mutex<PatternAnalyzer>,
    rules: Mutex<RuleSet>,
    learning: Mutex<LearningEngine>,
    ai: Option<Arc<dyn AiClient>>,
    controls: Arc<RecoveryControls>,
}

impl RecoverySystem {
    pub fn new(
        settings: RecoverySettings,
        ai: Option<Arc<dyn AiClient>>,
        initial_workers: usize,
    ) -> Self {
        Self {
            analyzer: Mutex::new(PatternAnalyzer::new(settings.analyzer.clone())),
            rules: Mutex::new(RuleSet::with_predefined()),
            learning: Mutex::new(LearningEngine::new(settings.learning.clone())),
            ai,
            controls: Arc::new(RecoveryControls::new(initial_workers)),
            settings,
        }
    }

    pub fn controls(&self) -> Arc<RecoveryControls> {
        Arc::clone(&self.controls)
    }

    pub async fn record_success(&self) {
        self.analyzer.lock().await.record_success();
    }

    /// Feed a failure to the analyzer and ask whether recovery should
    /// engage. `None` means let the plain retry path handle it.
    pub async fn observe_failure(&self, error: &WorkflowError) -> Option<ActivationDecision> {
        let mut analyzer = self.analyzer.lock().await;
        analyzer.record_failure(&error.signature());
        analyzer.should_activate(&error.to_string())
    }

    /// Find the best solution for an error: rules first, AI fallback when
    /// no rule is left. The matched rule is appended to `attempted_rules`.
    pub async fn find_solution(&self, ctx: &mut ErrorContext) -> Result<Solution, WorkflowError> {
        {
            let rules = self.rules.lock().await;
            if let Some(rule) = rules.find_match(ctx) {
                debug!(rule = %rule.name, domain = %ctx.domain, "recovery rule matched");
                let resolved = variables::resolve_all(&rule.context.variables, ctx);
                let solution = build_solution(
                    &rule.name,
                    &rule.actions,
                    rule.confidence,
                    resolved,
                    SolutionOrigin::Rule {
                        rule_id: rule.id.clone(),
                    },
                )?;
                ctx.attempted_rules.push(rule.id.clone());
                return Ok(solution);
            }
        }

        if self.settings.ai.enabled {
            if let Some(ai) = &self.ai {
                info!(error = %ctx.error_message, "no rule matched, consulting AI fallback");
                let prompt = build_prompt(ctx);
                let proposal = ai.propose_solution(&prompt).await?;
                let solution = build_solution(
                    &proposal.rule_name,
                    &proposal.actions,
                    proposal.confidence,
                    proposal.variables,
                    SolutionOrigin::Ai,
                )?;
                return Ok(solution);
            }
        }

        warn!(error = %ctx.error_message, "no recovery rule matched and AI fallback is disabled");
        Err(WorkflowError::NoRuleMatched(ctx.error_message.clone()))
    }

    /// Run a solution's actions against the controls and browser.
    pub async fn apply(
        &self,
        solution: &Solution,
        browser: &mut dyn BrowserContext,
    ) -> Result<(), WorkflowError> {
        info!(
            plan = %solution.rule_name,
            actions = solution.actions.len(),
            confidence = solution.confidence,
            "applying recovery solution"
        );
        apply_actions(&solution.actions, &self.controls, browser).await
    }

    /// Report whether the recovered operation succeeded on re-execution.
    /// Rule outcomes update rule statistics; AI outcomes feed the learning
    /// engine and may promote the plan to a learned rule.
    pub async fn report_outcome(&self, solution: &Solution, ctx: &ErrorContext, success: bool) {
        match &solution.origin {
            SolutionOrigin::Rule { rule_id } => {
                self.rules.lock().await.record_usage(
                    rule_id,
                    success,
                    self.settings.learning.deprecation_floor,
                );
            }
            SolutionOrigin::Ai => {
                let promoted = self.learning.lock().await.record(
                    &solution.rule_name,
                    &solution.action_specs,
                    ctx,
                    success,
                );
                if let Some(rule) = promoted {
                    self.rules.lock().await.insert(rule);
                }
            }
        }
    }

    /// Snapshot of the current rule set, for the CLI.
    pub async fn rules_snapshot(&self) -> Vec<ContextAwareRule> {
        self.rules.lock().await.rules().to_vec()
    }
}

fn build_solution(
    name: &str,
    specs: &[ActionSpec],
    confidence: f64,
    variables: HashMap<String, Value>,
    origin: SolutionOrigin,
) -> Result<Solution, WorkflowError> {
    let mut parsed = Vec::with_capacity(specs.len());
    let mut substituted_specs = Vec::with_capacity(specs.len());
    for spec in specs {
        let params: HashMap<String, Value> = spec
            .params
            .iter()
            .map(|(k, v)| (k.clone(), variables::substitute(v, &variables)))
            .collect();
        let substituted = ActionSpec {
            action: spec.action.clone(),
            params,
        };
        parsed.push(RecoveryAction::parse(&substituted)?);
        substituted_specs.push(substituted);
    }
    Ok(Solution {
        rule_name: name.to_string(),
        actions: parsed,
        action_specs: substituted_specs,
        confidence,
        variables,
        origin,
    })
}
