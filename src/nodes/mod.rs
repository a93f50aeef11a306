pub mod extract;
pub mod navigate;
pub mod paginate;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::browser::BrowserContext;
use crate::error::WorkflowError;
use crate::workflow::context::ExecutionContext;
use crate::workflow::types::{UrlQueueItem, Workflow};

pub use extract::ExtractNode;
pub use navigate::NavigateNode;
pub use paginate::PaginateNode;
pub use transform::TransformNode;

/// A URL found by a node, carrying the routing marker its node config
/// assigns.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredUrl {
    pub url: String,
    pub marker: Option<String>,
    pub priority: i32,
}

/// What a node produced: a result object (stored under the node's
/// output_key) and any URLs it discovered.
#[derive(Debug, Default)]
pub struct NodeOutput {
    pub result: Map<String, Value>,
    pub discovered_urls: Vec<DiscoveredUrl>,
}

/// Everything a node sees when it runs against one URL.
pub struct NodeInput<'a> {
    pub browser: &'a mut dyn BrowserContext,
    pub ctx: &'a mut ExecutionContext,
    pub params: &'a Value,
    pub url_item: &'a UrlQueueItem,
    pub execution_id: &'a str,
}

/// One registered node type. Validation runs once when a workflow is
/// loaded; execution runs per URL in DAG order.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn node_type(&self) -> &'static str;

    /// Check node params at workflow load time, before anything runs.
    fn validate(&self, params: &Value) -> Result<(), WorkflowError>;

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutput, WorkflowError>;
}

/// Node dispatch table keyed by node type.
pub struct NodeRegistry {
    executors: HashMap<&'static str, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Registry preloaded with every built-in node type.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(NavigateNode));
        registry.register(Arc::new(ExtractNode));
        registry.register(Arc::new(PaginateNode));
        registry.register(Arc::new(TransformNode));
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(executor.node_type(), executor);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(node_type).cloned()
    }

    /// Validate every node of every phase against its registered
    /// executor. Unknown node types and bad params fail the workflow
    /// before execution starts.
    pub fn validate_workflow(&self, workflow: &Workflow) -> Result<(), WorkflowError> {
        for phase in &workflow.phases {
            for node in &phase.nodes {
                let executor = self.get(&node.node_type).ok_or_else(|| {
                    WorkflowError::Definition(format!(
                        "phase '{}' node '{}' has unknown type '{}'",
                        phase.id, node.id, node.node_type
                    ))
                })?;
                executor.validate(&node.params).map_err(|e| {
                    WorkflowError::Definition(format!(
                        "phase '{}' node '{}': {}",
                        phase.id, node.id, e
                    ))
                })?;
            }
        }
        Ok(())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::workflow::types::ResponseInfo;

    /// In-memory browser returning a canned body, for node tests.
    pub struct FakeBrowser {
        pub status: u16,
        pub body: String,
        pub navigations: Vec<String>,
    }

    impl FakeBrowser {
        pub fn with_body(body: &str) -> Self {
            Self {
                status: 200,
                body: body.to_string(),
                navigations: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl BrowserContext for FakeBrowser {
        async fn navigate(&mut self, url: &str) -> Result<(), WorkflowError> {
            self.navigations.push(url.to_string());
            Ok(())
        }

        fn check_http_status(&self) -> Result<(), WorkflowError> {
            match crate::browser::status_error(self.status) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn response_status(&self) -> Option<u16> {
            Some(self.status)
        }

        fn response_body(&self) -> &str {
            &self.body
        }

        fn response_info(&self) -> ResponseInfo {
            ResponseInfo {
                status_code: Some(self.status),
                headers: Default::default(),
                body: self.body.clone(),
            }
        }

        async fn rotate_fingerprint(&mut self) -> Result<(), WorkflowError> {
            Ok(())
        }

        async fn clear_cookies(&mut self) -> Result<(), WorkflowError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry_covers_all_node_types() {
        let registry = NodeRegistry::builtin();
        for node_type in ["navigate", "extract", "paginate", "transform"] {
            assert!(registry.get(node_type).is_some(), "missing {}", node_type);
        }
        assert!(registry.get("teleport").is_none());
    }

    #[test]
    fn test_validate_workflow_rejects_unknown_type() {
        let yaml = r#"
id: w
name: w
phases:
  - id: p
    name: p
    nodes:
      - id: n
        type: teleport
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let registry = NodeRegistry::builtin();
        match registry.validate_workflow(&workflow) {
            Err(WorkflowError::Definition(msg)) => assert!(msg.contains("teleport")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_validate_workflow_surfaces_bad_params() {
        let yaml = r#"
id: w
name: w
phases:
  - id: p
    name: p
    nodes:
      - id: n
        type: extract
        params: {}
"#;
        let workflow: Workflow = serde_yaml::from_str(yaml).unwrap();
        let registry = NodeRegistry::builtin();
        assert!(registry.validate_workflow(&workflow).is_err());
    }
}
