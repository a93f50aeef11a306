use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::WorkflowError;
use crate::nodes::{NodeExecutor, NodeInput, NodeOutput};

/// Loads the queue item's URL in the browser and verifies the HTTP
/// status. An error status is returned as-is so the executor can hand it
/// to the recovery system with the response snapshot.
pub struct NavigateNode;

#[async_trait]
impl NodeExecutor for NavigateNode {
    fn node_type(&self) -> &'static str {
        "navigate"
    }

    fn validate(&self, params: &Value) -> Result<(), WorkflowError> {
        if let Some(wait) = params.get("wait_ms") {
            if !wait.is_u64() {
                return Err(WorkflowError::InvalidParams {
                    node: self.node_type().to_string(),
                    reason: "wait_ms must be a non-negative integer".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutput, WorkflowError> {
        let url = &input.url_item.url;
        debug!(url = %url, "navigate node");
        input.browser.navigate(url).await?;

        if let Some(wait_ms) = input.params.get("wait_ms").and_then(|v| v.as_u64()) {
            // Give slow pages time to settle before downstream extraction
            tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
        }

        input.browser.check_http_status()?;

        let mut result = Map::new();
        result.insert("url".to_string(), Value::from(url.clone()));
        if let Some(status) = input.browser.response_status() {
            result.insert("status".to_string(), Value::from(status));
        }
        Ok(NodeOutput {
            result,
            discovered_urls: Vec::new(),
        })
    }
}
