use std::collections::HashMap;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::recovery::variables::DynamicVariable;
use crate::recovery::ErrorContext;

/// Where a rule came from. Learned and AI-born rules are subject to
/// deprecation when their live success rate collapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrigin {
    Predefined,
    Learned,
    Ai,
}

/// Comparison applied between an error-context field and a rule's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Regex,
    Gt,
    Lt,
}

/// One predicate over the error context. All of a rule's conditions must
/// hold for the rule to match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

impl RuleCondition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    fn matches(&self, ctx: &ErrorContext) -> bool {
        let Some(actual) = ctx.field(&self.field) else {
            return false;
        };
        match self.operator {
            ConditionOperator::Equals => values_equal(&actual, &self.value),
            ConditionOperator::Contains => match (&actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                }
                _ => false,
            },
            ConditionOperator::Regex => {
                let Value::String(pattern) = &self.value else {
                    return false;
                };
                match Regex::new(pattern) {
                    Ok(re) => re.is_match(&to_display(&actual)),
                    Err(e) => {
                        warn!(pattern = %pattern, "invalid regex in rule condition: {}", e);
                        false
                    }
                }
            }
            ConditionOperator::Gt => match (to_f64(&actual), to_f64(&self.value)) {
                (Some(a), Some(b)) => a > b,
                _ => false,
            },
            ConditionOperator::Lt => match (to_f64(&actual), to_f64(&self.value)) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
        }
    }
}

/// Numeric-first equality: `429`, `"429"` and `429.0` all compare equal.
/// Values that don't both coerce to numbers fall back to string equality.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(a), Some(b)) = (to_f64(a), to_f64(b)) {
        return (a - b).abs() < f64::EPSILON;
    }
    to_display(a) == to_display(b)
}

/// Coerce a JSON value to f64 where that makes sense.
pub fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Match a domain against a glob pattern where `*` matches any run of
/// characters. `*.example.com` matches `shop.example.com` but not the
/// apex `example.com`.
pub fn matches_domain(pattern: &str, domain: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let mut regex = String::from("^");
    for (i, part) in pattern.split('*').enumerate() {
        if i > 0 {
            regex.push_str(".*");
        }
        regex.push_str(&regex::escape(part));
    }
    regex.push('$');
    match Regex::new(&regex) {
        Ok(re) => re.is_match(domain),
        Err(_) => false,
    }
}

/// Scoping and tuning attached to a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleContext {
    /// Domain glob this rule applies to; `*` means everywhere.
    #[serde(default = "default_domain_pattern")]
    pub domain_pattern: String,
    /// Variables resolved at match time and substituted into the actions.
    #[serde(default)]
    pub variables: HashMap<String, DynamicVariable>,
    #[serde(default = "default_rule_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_multiplier")]
    pub timeout_multiplier: f64,
}

fn default_domain_pattern() -> String {
    "*".to_string()
}

fn default_rule_retries() -> u32 {
    1
}

fn default_timeout_multiplier() -> f64 {
    1.0
}

impl Default for RuleContext {
    fn default() -> Self {
        Self {
            domain_pattern: default_domain_pattern(),
            variables: HashMap::new(),
            max_retries: default_rule_retries(),
            timeout_multiplier: default_timeout_multiplier(),
        }
    }
}

/// An action to run, expressed as a name plus parameters that may contain
/// `{{variable}}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl ActionSpec {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.params.insert(key.to_string(), value);
        self
    }
}

/// A recovery rule: conditions on the error context, a scope, an ordered
/// action list, and live statistics used for ranking and deprecation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextAwareRule {
    pub id: String,
    pub name: String,
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub context: RuleContext,
    pub actions: Vec<ActionSpec>,
    pub priority: i32,
    pub confidence: f64,
    pub created_by: RuleOrigin,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default = "default_success_rate")]
    pub success_rate: f64,
    #[serde(default)]
    pub deprecated: bool,
    pub created_at: DateTime<Utc>,
}

fn default_success_rate() -> f64 {
    1.0
}

impl ContextAwareRule {
    /// True when every condition holds and the error's domain is in scope.
    pub fn matches(&self, ctx: &ErrorContext) -> bool {
        if self.deprecated {
            return false;
        }
        if !matches_domain(&self.context.domain_pattern, &ctx.domain) {
            return false;
        }
        self.conditions.iter().all(|c| c.matches(ctx))
    }

    /// Fold one application outcome into the running success rate.
    pub fn record_outcome(&mut self, success: bool) {
        self.usage_count += 1;
        let outcome = if success { 1.0 } else { 0.0 };
        let n = self.usage_count as f64;
        self.success_rate = ((self.success_rate * (n - 1.0)) + outcome) / n;
    }
}

/// Priority-ordered rule collection. Higher priority wins; insertion
/// order breaks ties (stable sort).
pub struct RuleSet {
    rules: Vec<ContextAwareRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<ContextAwareRule>) -> Self {
        let mut set = Self { rules };
        set.sort();
        set
    }

    /// The built-in rules every recovery system starts with.
    pub fn with_predefined() -> Self {
        Self::new(predefined_rules())
    }

    fn sort(&mut self) {
        self.rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    pub fn insert(&mut self, rule: ContextAwareRule) {
        info!(rule = %rule.name, priority = rule.priority, "adding recovery rule");
        self.rules.push(rule);
        self.sort();
    }

    pub fn rules(&self) -> &[ContextAwareRule] {
        &self.rules
    }

    /// First live rule (in priority order) whose conditions hold and that
    /// has not already been attempted for this error.
    pub fn find_match(&self, ctx: &ErrorContext) -> Option<&ContextAwareRule> {
        self.rules
            .iter()
            .filter(|r| !ctx.attempted_rules.contains(&r.id))
            .find(|r| r.matches(ctx))
    }

    /// Record an application outcome for a rule and deprecate non-built-in
    /// rules whose success rate falls through the floor.
    pub fn record_usage(&mut self, rule_id: &str, success: bool, deprecation_floor: f64) {
        let Some(rule) = self.rules.iter_mut().find(|r| r.id == rule_id) else {
            return;
        };
        rule.record_outcome(success);
        debug!(
            rule = %rule.name,
            usage = rule.usage_count,
            success_rate = rule.success_rate,
            "recovery rule outcome recorded"
        );
        if rule.created_by != RuleOrigin::Predefined
            && rule.usage_count >= 3
            && rule.success_rate < deprecation_floor
            && !rule.deprecated
        {
            warn!(rule = %rule.name, success_rate = rule.success_rate, "deprecating recovery rule");
            rule.deprecated = true;
        }
    }
}

/// Built-in rules covering the common failure classes.
pub fn predefined_rules() -> Vec<ContextAwareRule> {
    let now = Utc::now();

    let mut rate_limit_vars = HashMap::new();
    rate_limit_vars.insert(
        "wait_time".to_string(),
        DynamicVariable::Calculated {
            header: Some("Retry-After".to_string()),
            formula: None,
            multiplier: 1000.0,
            fallback: 30_000.0,
        },
    );

    let mut blocked_vars = HashMap::new();
    blocked_vars.insert(
        "cooldown".to_string(),
        DynamicVariable::DomainBased {
            table: HashMap::new(),
            default: json!(15_000),
        },
    );

    let mut challenge_vars = HashMap::new();
    challenge_vars.insert(
        "challenge_wait".to_string(),
        DynamicVariable::Conditional {
            check_substring: "captcha".to_string(),
            if_present: json!(60_000),
            if_absent: json!(20_000),
        },
    );

    vec![
        ContextAwareRule {
            id: "generic_rate_limit_429".to_string(),
            name: "Generic rate limit (429)".to_string(),
            conditions: vec![RuleCondition::new(
                "status_code",
                ConditionOperator::Equals,
                json!("429"),
            )],
            context: RuleContext {
                domain_pattern: "*".to_string(),
                variables: rate_limit_vars,
                max_retries: 2,
                timeout_multiplier: 2.0,
            },
            actions: vec![
                ActionSpec::new("pause_execution"),
                ActionSpec::new("wait").with_param("duration_ms", json!("{{wait_time}}")),
                ActionSpec::new("reduce_workers").with_param("target", json!(1)),
                ActionSpec::new("add_delay").with_param("delay_ms", json!(1000)),
                ActionSpec::new("resume"),
            ],
            priority: 10,
            confidence: 0.9,
            created_by: RuleOrigin::Predefined,
            usage_count: 0,
            success_rate: 1.0,
            deprecated: false,
            created_at: now,
        },
        ContextAwareRule {
            id: "access_blocked_403".to_string(),
            name: "Access blocked (403)".to_string(),
            conditions: vec![RuleCondition::new(
                "status_code",
                ConditionOperator::Equals,
                json!(403),
            )],
            context: RuleContext {
                domain_pattern: "*".to_string(),
                variables: blocked_vars,
                max_retries: 1,
                timeout_multiplier: 1.0,
            },
            actions: vec![
                ActionSpec::new("rotate_fingerprint"),
                ActionSpec::new("clear_cookies"),
                ActionSpec::new("wait").with_param("duration_ms", json!("{{cooldown}}")),
            ],
            priority: 9,
            confidence: 0.8,
            created_by: RuleOrigin::Predefined,
            usage_count: 0,
            success_rate: 1.0,
            deprecated: false,
            created_at: now,
        },
        ContextAwareRule {
            id: "bot_detection_challenge".to_string(),
            name: "Bot detection / challenge page".to_string(),
            conditions: vec![RuleCondition::new(
                "error_message",
                ConditionOperator::Regex,
                json!("(?i)bot detection|captcha|access denied"),
            )],
            context: RuleContext {
                domain_pattern: "*".to_string(),
                variables: challenge_vars,
                max_retries: 1,
                timeout_multiplier: 2.0,
            },
            actions: vec![
                ActionSpec::new("pause_execution"),
                ActionSpec::new("rotate_fingerprint"),
                ActionSpec::new("clear_cookies"),
                ActionSpec::new("wait").with_param("duration_ms", json!("{{challenge_wait}}")),
                ActionSpec::new("reduce_workers").with_param("target", json!(1)),
                ActionSpec::new("resume"),
            ],
            priority: 8,
            confidence: 0.7,
            created_by: RuleOrigin::Predefined,
            usage_count: 0,
            success_rate: 1.0,
            deprecated: false,
            created_at: now,
        },
        ContextAwareRule {
            id: "server_error_5xx".to_string(),
            name: "Server error (5xx)".to_string(),
            conditions: vec![RuleCondition::new(
                "status_code",
                ConditionOperator::Gt,
                json!(499),
            )],
            context: RuleContext::default(),
            actions: vec![
                ActionSpec::new("wait").with_param("duration_ms", json!(5000)),
                ActionSpec::new("add_delay").with_param("delay_ms", json!(500)),
            ],
            priority: 5,
            confidence: 0.6,
            created_by: RuleOrigin::Predefined,
            usage_count: 0,
            success_rate: 1.0,
            deprecated: false,
            created_at: now,
        },
    ]
}
