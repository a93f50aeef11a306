use std::collections::HashMap;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cli::config::LearningSettings;
use crate::recovery::rules::{
    ActionSpec, ConditionOperator, ContextAwareRule, RuleCondition, RuleContext, RuleOrigin,
};
use crate::recovery::ErrorContext;

/// Outcome history for one AI-proposed action plan, keyed by the plan's
/// fingerprint.
#[derive(Debug, Clone)]
struct SolutionRecord {
    actions: Vec<ActionSpec>,
    successes: u64,
    failures: u64,
    domains: HashMap<String, u64>,
    status_codes: HashMap<u16, u64>,
    messages: HashMap<String, u64>,
    promoted: bool,
}

impl SolutionRecord {
    fn usage(&self) -> u64 {
        self.successes + self.failures
    }

    fn success_rate(&self) -> f64 {
        let usage = self.usage();
        if usage == 0 {
            return 0.0;
        }
        self.successes as f64 / usage as f64
    }
}

/// Turns AI proposals that keep working into real rules.
///
/// Every applied AI solution is recorded with its outcome; once a plan has
/// been used enough times with a high enough success rate, it is promoted
/// to a learned rule so future matches skip the AI round trip.
pub struct LearningEngine {
    settings: LearningSettings,
    records: HashMap<String, SolutionRecord>,
}

impl LearningEngine {
    pub fn new(settings: LearningSettings) -> Self {
        Self {
            settings,
            records: HashMap::new(),
        }
    }

    /// Stable identity for an action plan, independent of who proposed it.
    pub fn fingerprint(actions: &[ActionSpec]) -> String {
        serde_json::to_string(actions).unwrap_or_default()
    }

    /// Record one application of an AI plan. Returns a freshly promoted
    /// rule when this outcome tips the plan over the promotion thresholds.
    pub fn record(
        &mut self,
        rule_name: &str,
        actions: &[ActionSpec],
        ctx: &ErrorContext,
        success: bool,
    ) -> Option<ContextAwareRule> {
        let key = Self::fingerprint(actions);
        let record = self.records.entry(key).or_insert_with(|| SolutionRecord {
            actions: actions.to_vec(),
            successes: 0,
            failures: 0,
            domains: HashMap::new(),
            status_codes: HashMap::new(),
            messages: HashMap::new(),
            promoted: false,
        });

        if success {
            record.successes += 1;
        } else {
            record.failures += 1;
        }
        *record.domains.entry(ctx.domain.clone()).or_default() += 1;
        if let Some(status) = ctx.response.status_code {
            *record.status_codes.entry(status).or_default() += 1;
        }
        *record
            .messages
            .entry(ctx.error_message.clone())
            .or_default() += 1;

        debug!(
            plan = rule_name,
            usage = record.usage(),
            success_rate = record.success_rate(),
            "AI solution outcome recorded"
        );

        if record.promoted
            || record.usage() < self.settings.min_usage_count
            || record.success_rate() < self.settings.min_success_rate
        {
            return None;
        }
        record.promoted = true;

        let rule = build_learned_rule(rule_name, record);
        info!(
            rule = %rule.name,
            usage = record.usage(),
            success_rate = record.success_rate(),
            "promoting AI solution to learned rule"
        );
        Some(rule)
    }
}

fn dominant<K: Clone + Ord>(counts: &HashMap<K, u64>) -> Option<K> {
    counts
        .iter()
        .max_by_key(|(key, count)| (**count, std::cmp::Reverse((*key).clone())))
        .map(|(key, _)| key.clone())
}

fn build_learned_rule(rule_name: &str, record: &SolutionRecord) -> ContextAwareRule {
    // Condition on the failure shape this plan was observed fixing
    let mut conditions = Vec::new();
    if let Some(status) = dominant(&record.status_codes) {
        conditions.push(RuleCondition::new(
            "status_code",
            ConditionOperator::Equals,
            json!(status),
        ));
    } else if let Some(message) = dominant(&record.messages) {
        conditions.push(RuleCondition::new(
            "error_message",
            ConditionOperator::Contains,
            json!(message),
        ));
    }

    // Scope to the single domain seen, or everywhere if the plan worked
    // across domains
    let domain_pattern = if record.domains.len() == 1 {
        record
            .domains
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "*".to_string())
    } else {
        "*".to_string()
    };

    ContextAwareRule {
        id: format!("learned_{}", Uuid::new_v4()),
        name: format!("Learned: {}", rule_name),
        conditions,
        context: RuleContext {
            domain_pattern,
            variables: HashMap::new(),
            max_retries: 1,
            timeout_multiplier: 1.0,
        },
        actions: record.actions.clone(),
        priority: 5,
        confidence: record.success_rate(),
        created_by: RuleOrigin::Learned,
        usage_count: record.usage(),
        success_rate: record.success_rate(),
        deprecated: false,
        created_at: Utc::now(),
    }
}
