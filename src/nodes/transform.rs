use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::WorkflowError;
use crate::nodes::{NodeExecutor, NodeInput, NodeOutput};

const KNOWN_OPS: &[&str] = &[
    "trim",
    "lowercase",
    "uppercase",
    "parse_number",
    "rename",
    "default",
    "remove",
];

/// Applies field-level operations to the extracted fields accumulated so
/// far in the URL's context.
///
/// Params: `operations`, an ordered list of `{field, op, ...}`:
/// - `trim` / `lowercase` / `uppercase`: string cleanup.
/// - `parse_number`: parse a string field into a number (strips currency
///   symbols and thousands separators).
/// - `rename` (`to`): move a field to a new key.
/// - `default` (`value`): set the field only when absent.
/// - `remove`: drop the field.
pub struct TransformNode;

#[async_trait]
impl NodeExecutor for TransformNode {
    fn node_type(&self) -> &'static str {
        "transform"
    }

    fn validate(&self, params: &Value) -> Result<(), WorkflowError> {
        let operations = params
            .get("operations")
            .and_then(|v| v.as_array())
            .ok_or_else(|| self.invalid("requires an 'operations' list"))?;
        for (i, operation) in operations.iter().enumerate() {
            let op = operation
                .get("op")
                .and_then(|v| v.as_str())
                .ok_or_else(|| self.invalid(&format!("operation {} has no 'op'", i)))?;
            if !KNOWN_OPS.contains(&op) {
                return Err(self.invalid(&format!("unknown op '{}'", op)));
            }
            if operation.get("field").and_then(|v| v.as_str()).is_none() {
                return Err(self.invalid(&format!("operation {} has no 'field'", i)));
            }
            if op == "rename" && operation.get("to").and_then(|v| v.as_str()).is_none() {
                return Err(self.invalid(&format!("rename at {} needs a 'to'", i)));
            }
            if op == "default" && operation.get("value").is_none() {
                return Err(self.invalid(&format!("default at {} needs a 'value'", i)));
            }
        }
        Ok(())
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutput, WorkflowError> {
        let mut fields = input
            .ctx
            .extracted_fields()
            .cloned()
            .unwrap_or_default();

        let operations = input
            .params
            .get("operations")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for operation in &operations {
            apply_operation(&mut fields, operation);
        }

        debug!(fields = fields.len(), "transform node finished");
        input.ctx.set(
            crate::workflow::context::EXTRACTED_FIELDS,
            Value::Object(fields.clone()),
        );

        let mut result = Map::new();
        result.insert("fields".to_string(), Value::Object(fields));
        Ok(NodeOutput {
            result,
            discovered_urls: Vec::new(),
        })
    }
}

impl TransformNode {
    fn invalid(&self, reason: &str) -> WorkflowError {
        WorkflowError::InvalidParams {
            node: self.node_type().to_string(),
            reason: reason.to_string(),
        }
    }
}

fn apply_operation(fields: &mut Map<String, Value>, operation: &Value) {
    let Some(field) = operation.get("field").and_then(|v| v.as_str()) else {
        return;
    };
    let Some(op) = operation.get("op").and_then(|v| v.as_str()) else {
        return;
    };

    match op {
        "trim" => {
            if let Some(Value::String(s)) = fields.get(field) {
                let trimmed = s.trim().to_string();
                fields.insert(field.to_string(), Value::from(trimmed));
            }
        }
        "lowercase" => {
            if let Some(Value::String(s)) = fields.get(field) {
                let lowered = s.to_lowercase();
                fields.insert(field.to_string(), Value::from(lowered));
            }
        }
        "uppercase" => {
            if let Some(Value::String(s)) = fields.get(field) {
                let upper = s.to_uppercase();
                fields.insert(field.to_string(), Value::from(upper));
            }
        }
        "parse_number" => {
            if let Some(Value::String(s)) = fields.get(field) {
                let cleaned: String = s
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                    .collect();
                if let Ok(n) = cleaned.parse::<f64>() {
                    let value = if n.fract() == 0.0 {
                        Value::from(n as i64)
                    } else {
                        serde_json::Number::from_f64(n)
                            .map(Value::Number)
                            .unwrap_or(Value::Null)
                    };
                    fields.insert(field.to_string(), value);
                }
            }
        }
        "rename" => {
            if let Some(to) = operation.get("to").and_then(|v| v.as_str()) {
                if let Some(value) = fields.remove(field) {
                    fields.insert(to.to_string(), value);
                }
            }
        }
        "default" => {
            if !fields.contains_key(field) {
                if let Some(value) = operation.get("value") {
                    fields.insert(field.to_string(), value.clone());
                }
            }
        }
        "remove" => {
            fields.remove(field);
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::FakeBrowser;
    use crate::workflow::context::ExecutionContext;
    use crate::workflow::types::UrlQueueItem;
    use serde_json::json;

    async fn run(initial: Value, params: Value) -> (NodeOutput, ExecutionContext) {
        let mut browser = FakeBrowser::with_body("");
        let mut ctx = ExecutionContext::new();
        if let Some(map) = initial.as_object() {
            ctx.merge_extracted(map);
        }
        let item = UrlQueueItem::start_url("exec-1", "https://shop.example.com/p/1");
        let output = TransformNode
            .execute(NodeInput {
                browser: &mut browser,
                ctx: &mut ctx,
                params: &params,
                url_item: &item,
                execution_id: "exec-1",
            })
            .await
            .unwrap();
        (output, ctx)
    }

    #[tokio::test]
    async fn test_transform_pipeline() {
        let initial = json!({
            "title": "  Blue Widget  ",
            "price": "$1,299.50",
            "internal": "x"
        });
        let params = json!({
            "operations": [
                { "field": "title", "op": "trim" },
                { "field": "price", "op": "parse_number" },
                { "field": "price", "op": "rename", "to": "price_usd" },
                { "field": "currency", "op": "default", "value": "USD" },
                { "field": "internal", "op": "remove" }
            ]
        });
        let (_, ctx) = run(initial, params).await;
        let fields = ctx.extracted_fields().unwrap();
        assert_eq!(fields.get("title").unwrap(), "Blue Widget");
        assert_eq!(fields.get("price_usd").unwrap(), &json!(1299.5));
        assert_eq!(fields.get("currency").unwrap(), "USD");
        assert!(!fields.contains_key("internal"));
        assert!(!fields.contains_key("price"));
    }

    #[tokio::test]
    async fn test_default_does_not_overwrite() {
        let initial = json!({"currency": "EUR"});
        let params = json!({
            "operations": [
                { "field": "currency", "op": "default", "value": "USD" }
            ]
        });
        let (_, ctx) = run(initial, params).await;
        assert_eq!(ctx.extracted_fields().unwrap().get("currency").unwrap(), "EUR");
    }

    #[tokio::test]
    async fn test_ops_on_missing_fields_are_noops() {
        let params = json!({
            "operations": [
                { "field": "ghost", "op": "trim" },
                { "field": "ghost", "op": "parse_number" }
            ]
        });
        let (output, _) = run(json!({}), params).await;
        let fields = output.result["fields"].as_object().unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn test_validate() {
        let node = TransformNode;
        assert!(node.validate(&json!({})).is_err());
        assert!(node
            .validate(&json!({"operations": [{"field": "a", "op": "trim"}]}))
            .is_ok());
        assert!(node
            .validate(&json!({"operations": [{"field": "a", "op": "explode"}]}))
            .is_err());
        assert!(node
            .validate(&json!({"operations": [{"field": "a", "op": "rename"}]}))
            .is_err());
        assert!(node
            .validate(&json!({"operations": [{"field": "a", "op": "default"}]}))
            .is_err());
    }
}
