use std::collections::HashMap;

use serde_json::Value;

/// Context key holding the node execution id currently running.
pub const NODE_EXEC_ID: &str = "_node_exec_id";

/// Context key holding the previously completed node execution id, used to
/// chain parent/child lineage for events and discovered URLs.
pub const LAST_NODE_EXEC_ID: &str = "_last_node_exec_id";

/// Context key under which extract/transform nodes accumulate the fields
/// persisted at the end of the phase pass.
pub const EXTRACTED_FIELDS: &str = "_extracted_fields";

/// Per-URL mutable scratch space holding intermediate node outputs and
/// bookkeeping keys. Scoped to one URL's processing pass and discarded
/// after it.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    values: HashMap<String, Value>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.as_str())
    }

    /// Current lineage parent: the node execution in flight if any,
    /// otherwise the last one that completed.
    pub fn lineage_parent(&self) -> Option<String> {
        self.get_str(NODE_EXEC_ID)
            .or_else(|| self.get_str(LAST_NODE_EXEC_ID))
            .map(|s| s.to_string())
    }

    /// Merge a result object into the accumulated extracted fields.
    pub fn merge_extracted(&mut self, fields: &serde_json::Map<String, Value>) {
        let entry = self
            .values
            .entry(EXTRACTED_FIELDS.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Value::Object(map) = entry {
            for (k, v) in fields {
                map.insert(k.clone(), v.clone());
            }
        }
    }

    /// Extracted fields accumulated during this pass, if any.
    pub fn extracted_fields(&self) -> Option<&serde_json::Map<String, Value>> {
        match self.values.get(EXTRACTED_FIELDS) {
            Some(Value::Object(map)) if !map.is_empty() => Some(map),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lineage_prefers_current_node() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(ctx.lineage_parent(), None);

        ctx.set(LAST_NODE_EXEC_ID, json!("exec-1"));
        assert_eq!(ctx.lineage_parent(), Some("exec-1".to_string()));

        ctx.set(NODE_EXEC_ID, json!("exec-2"));
        assert_eq!(ctx.lineage_parent(), Some("exec-2".to_string()));
    }

    #[test]
    fn test_merge_extracted_accumulates() {
        let mut ctx = ExecutionContext::new();
        assert!(ctx.extracted_fields().is_none());

        let first = json!({"title": "Widget"});
        let second = json!({"price": "9.99"});
        ctx.merge_extracted(first.as_object().unwrap());
        ctx.merge_extracted(second.as_object().unwrap());

        let fields = ctx.extracted_fields().unwrap();
        assert_eq!(fields.get("title").unwrap(), "Widget");
        assert_eq!(fields.get("price").unwrap(), "9.99");
    }
}
