use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::recovery::rules::matches_domain;
use crate::recovery::ErrorContext;

/// A value computed from the error context at match time, so one rule can
/// adapt its actions to the concrete failure instead of hard-coding them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DynamicVariable {
    /// Pick one of two values depending on whether the response body
    /// contains a substring.
    Conditional {
        check_substring: String,
        if_present: Value,
        if_absent: Value,
    },
    /// Derive a number from a response header (e.g. `Retry-After`) or an
    /// arithmetic formula over `status_code` and `retry_count`. The
    /// fallback applies when the header is missing or nothing parses.
    Calculated {
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        formula: Option<String>,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        fallback: f64,
    },
    /// Look the value up by the error's domain. Table keys may be exact
    /// domains or globs (`*.example.com`); the default covers everything
    /// else.
    DomainBased {
        table: HashMap<String, Value>,
        default: Value,
    },
}

fn default_multiplier() -> f64 {
    1.0
}

impl DynamicVariable {
    /// Compute this variable against the error being recovered from.
    pub fn resolve(&self, ctx: &ErrorContext) -> Value {
        match self {
            DynamicVariable::Conditional {
                check_substring,
                if_present,
                if_absent,
            } => {
                let body = ctx.response.body.to_lowercase();
                if body.contains(&check_substring.to_lowercase()) {
                    if_present.clone()
                } else {
                    if_absent.clone()
                }
            }
            DynamicVariable::Calculated {
                header,
                formula,
                multiplier,
                fallback,
            } => {
                let base = header
                    .as_deref()
                    .and_then(|name| ctx.response.header(name))
                    .and_then(|raw| raw.trim().parse::<f64>().ok())
                    .or_else(|| {
                        formula
                            .as_deref()
                            .and_then(|expr| eval_formula(expr, &ctx.formula_inputs()))
                    });
                let value = base.map(|v| v * multiplier).unwrap_or(*fallback);
                number(value)
            }
            DynamicVariable::DomainBased { table, default } => {
                if let Some(value) = table.get(&ctx.domain) {
                    return value.clone();
                }
                // Keys may be globs; scan in sorted order so overlapping
                // patterns resolve the same way every time
                let mut keys: Vec<&String> = table.keys().collect();
                keys.sort();
                keys.into_iter()
                    .find(|key| matches_domain(key, &ctx.domain))
                    .and_then(|key| table.get(key))
                    .cloned()
                    .unwrap_or_else(|| default.clone())
            }
        }
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Resolve every variable a rule declares against one error context.
pub fn resolve_all(
    variables: &HashMap<String, DynamicVariable>,
    ctx: &ErrorContext,
) -> HashMap<String, Value> {
    variables
        .iter()
        .map(|(name, var)| (name.clone(), var.resolve(ctx)))
        .collect()
}

/// Substitute `{{name}}` placeholders in action parameters.
///
/// A string that is exactly one placeholder takes the resolved value as-is
/// (numbers stay numbers); placeholders embedded in a longer string are
/// replaced textually. Unknown placeholders are left intact and warned
/// about, so a misconfigured rule is visible in the logs.
pub fn substitute(value: &Value, resolved: &HashMap<String, Value>) -> Value {
    match value {
        Value::String(s) => substitute_str(s, resolved),
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, resolved)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, resolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn substitute_str(s: &str, resolved: &HashMap<String, Value>) -> Value {
    let trimmed = s.trim();
    if let Some(name) = exact_placeholder(trimmed) {
        return match resolved.get(name) {
            Some(value) => value.clone(),
            None => {
                warn!(variable = name, "unresolved recovery variable");
                Value::String(s.to_string())
            }
        };
    }

    let mut out = s.to_string();
    for (name, value) in resolved {
        let placeholder = format!("{{{{{}}}}}", name);
        if out.contains(&placeholder) {
            let rendered = match value {
                Value::String(v) => v.clone(),
                other => other.to_string(),
            };
            out = out.replace(&placeholder, &rendered);
        }
    }
    Value::String(out)
}

fn exact_placeholder(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("{{")?.strip_suffix("}}")?;
    let name = inner.trim();
    if !name.is_empty() && !name.contains("{{") {
        Some(name)
    } else {
        None
    }
}

/// Evaluate a small arithmetic expression (`+ - * /`, parentheses, named
/// inputs, numeric literals). Returns `None` on any parse or math error.
pub fn eval_formula(expr: &str, inputs: &HashMap<String, f64>) -> Option<f64> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        inputs,
    };
    let value = parser.expression()?;
    if parser.pos == tokens.len() && value.is_finite() {
        Some(value)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Open,
    Close,
}

fn tokenize(expr: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        literal.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Number(literal.parse().ok()?));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            _ => return None,
        }
    }
    Some(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    inputs: &'a HashMap<String, f64>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expression(&mut self) -> Option<f64> {
        let mut value = self.term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.pos += 1;
                    value += self.term()?;
                }
                Token::Minus => {
                    self.pos += 1;
                    value -= self.term()?;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn term(&mut self) -> Option<f64> {
        let mut value = self.factor()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.pos += 1;
                    value *= self.factor()?;
                }
                Token::Slash => {
                    self.pos += 1;
                    let divisor = self.factor()?;
                    if divisor == 0.0 {
                        return None;
                    }
                    value /= divisor;
                }
                _ => break,
            }
        }
        Some(value)
    }

    fn factor(&mut self) -> Option<f64> {
        match self.peek()? {
            Token::Number(n) => {
                let n = *n;
                self.pos += 1;
                Some(n)
            }
            Token::Ident(name) => {
                let value = *self.inputs.get(name)?;
                self.pos += 1;
                Some(value)
            }
            Token::Minus => {
                self.pos += 1;
                Some(-self.factor()?)
            }
            Token::Open => {
                self.pos += 1;
                let value = self.expression()?;
                match self.peek() {
                    Some(Token::Close) => {
                        self.pos += 1;
                        Some(value)
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::ResponseInfo;
    use serde_json::json;

    fn ctx_with(status: Option<u16>, headers: &[(&str, &str)], body: &str) -> ErrorContext {
        let mut header_map: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in headers {
            header_map
                .entry(name.to_string())
                .or_default()
                .push(value.to_string());
        }
        ErrorContext {
            execution_id: "exec-1".to_string(),
            url: "https://shop.example.com/p/1".to_string(),
            domain: "shop.example.com".to_string(),
            error_message: "rate limit exceeded".to_string(),
            response: ResponseInfo {
                status_code: status,
                headers: header_map,
                body: body.to_string(),
            },
            retry_count: 2,
            attempted_rules: Vec::new(),
        }
    }

    #[test]
    fn test_calculated_from_retry_after_header() {
        let var = DynamicVariable::Calculated {
            header: Some("Retry-After".to_string()),
            formula: None,
            multiplier: 1000.0,
            fallback: 30_000.0,
        };
        let ctx = ctx_with(Some(429), &[("retry-after", "30")], "");
        assert_eq!(var.resolve(&ctx), json!(30_000));
    }

    #[test]
    fn test_calculated_fallback_when_header_missing() {
        let var = DynamicVariable::Calculated {
            header: Some("Retry-After".to_string()),
            formula: None,
            multiplier: 1000.0,
            fallback: 30_000.0,
        };
        let ctx = ctx_with(Some(429), &[], "");
        assert_eq!(var.resolve(&ctx), json!(30_000));
    }

    #[test]
    fn test_calculated_formula_over_retry_count() {
        let var = DynamicVariable::Calculated {
            header: None,
            formula: Some("(retry_count + 1) * 500".to_string()),
            multiplier: 1.0,
            fallback: 500.0,
        };
        let ctx = ctx_with(Some(503), &[], "");
        // retry_count is 2
        assert_eq!(var.resolve(&ctx), json!(1500));
    }

    #[test]
    fn test_conditional_on_body_substring() {
        let var = DynamicVariable::Conditional {
            check_substring: "captcha".to_string(),
            if_present: json!(60_000),
            if_absent: json!(10_000),
        };
        let challenged = ctx_with(Some(403), &[], "<html>Please solve this CAPTCHA</html>");
        let plain = ctx_with(Some(403), &[], "<html>forbidden</html>");
        assert_eq!(var.resolve(&challenged), json!(60_000));
        assert_eq!(var.resolve(&plain), json!(10_000));
    }

    #[test]
    fn test_domain_based_lookup() {
        let mut table = HashMap::new();
        table.insert("shop.example.com".to_string(), json!(5000));
        let var = DynamicVariable::DomainBased {
            table,
            default: json!(15_000),
        };
        let known = ctx_with(Some(403), &[], "");
        assert_eq!(var.resolve(&known), json!(5000));

        let mut other = ctx_with(Some(403), &[], "");
        other.domain = "other.example.org".to_string();
        assert_eq!(var.resolve(&other), json!(15_000));
    }

    #[test]
    fn test_domain_based_glob_key() {
        let mut table = HashMap::new();
        table.insert("*.example.com".to_string(), json!(5000));
        let var = DynamicVariable::DomainBased {
            table,
            default: json!(15_000),
        };
        // ctx domain is shop.example.com
        let subdomain = ctx_with(Some(429), &[], "");
        assert_eq!(var.resolve(&subdomain), json!(5000));

        // The glob does not cover the apex
        let mut apex = ctx_with(Some(429), &[], "");
        apex.domain = "example.com".to_string();
        assert_eq!(var.resolve(&apex), json!(15_000));
    }

    #[test]
    fn test_domain_based_exact_key_beats_glob() {
        let mut table = HashMap::new();
        table.insert("*.example.com".to_string(), json!(5000));
        table.insert("shop.example.com".to_string(), json!(2000));
        let var = DynamicVariable::DomainBased {
            table,
            default: json!(15_000),
        };
        let ctx = ctx_with(Some(429), &[], "");
        assert_eq!(var.resolve(&ctx), json!(2000));
    }

    #[test]
    fn test_substitute_whole_placeholder_keeps_type() {
        let mut resolved = HashMap::new();
        resolved.insert("wait_time".to_string(), json!(30_000));
        let params = json!({ "duration_ms": "{{wait_time}}" });
        let out = substitute(&params, &resolved);
        assert_eq!(out, json!({ "duration_ms": 30_000 }));
    }

    #[test]
    fn test_substitute_embedded_placeholder_is_textual() {
        let mut resolved = HashMap::new();
        resolved.insert("domain".to_string(), json!("shop.example.com"));
        let params = json!("cooling down {{domain}} now");
        let out = substitute(&params, &resolved);
        assert_eq!(out, json!("cooling down shop.example.com now"));
    }

    #[test]
    fn test_substitute_unknown_placeholder_left_intact() {
        let resolved = HashMap::new();
        let params = json!("{{missing}}");
        assert_eq!(substitute(&params, &resolved), json!("{{missing}}"));
    }

    #[test]
    fn test_formula_parser() {
        let mut inputs = HashMap::new();
        inputs.insert("status_code".to_string(), 429.0);
        inputs.insert("retry_count".to_string(), 3.0);
        assert_eq!(eval_formula("retry_count * 1000", &inputs), Some(3000.0));
        assert_eq!(eval_formula("(1 + retry_count) * 2", &inputs), Some(8.0));
        assert_eq!(eval_formula("10 / 0", &inputs), None);
        assert_eq!(eval_formula("unknown_var + 1", &inputs), None);
        assert_eq!(eval_formula("1 +", &inputs), None);
        assert_eq!(eval_formula("-retry_count + 4", &inputs), Some(1.0));
    }
}
