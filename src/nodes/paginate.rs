use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use tracing::debug;
use url::Url;

use crate::error::WorkflowError;
use crate::nodes::{DiscoveredUrl, NodeExecutor, NodeInput, NodeOutput};

/// Follows a "next page" link, re-enqueueing it so the same phase picks it
/// up at the next depth.
///
/// Params:
/// - `selector` (required): CSS selector for the next-page anchor.
/// - `attribute`: link attribute, default `href`.
/// - `marker`: routing marker for the next page; defaults to the current
///   item's marker so pagination stays in the same phase.
/// - `max_depth`: stop paginating once the current item reaches this depth.
pub struct PaginateNode;

#[async_trait]
impl NodeExecutor for PaginateNode {
    fn node_type(&self) -> &'static str {
        "paginate"
    }

    fn validate(&self, params: &Value) -> Result<(), WorkflowError> {
        let selector = params
            .get("selector")
            .and_then(|v| v.as_str())
            .ok_or_else(|| WorkflowError::InvalidParams {
                node: self.node_type().to_string(),
                reason: "requires a 'selector'".to_string(),
            })?;
        Selector::parse(selector).map_err(|e| WorkflowError::InvalidParams {
            node: self.node_type().to_string(),
            reason: format!("invalid selector '{}': {}", selector, e),
        })?;
        Ok(())
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutput, WorkflowError> {
        let mut result = Map::new();

        if let Some(max_depth) = input.params.get("max_depth").and_then(|v| v.as_u64()) {
            if u64::from(input.url_item.depth) >= max_depth {
                debug!(
                    depth = input.url_item.depth,
                    max_depth, "pagination depth limit reached"
                );
                result.insert("next_url".to_string(), Value::Null);
                return Ok(NodeOutput {
                    result,
                    discovered_urls: Vec::new(),
                });
            }
        }

        let body = input.browser.response_body().to_string();
        let next = find_next_url(&body, &input.url_item.url, input.params)?;

        let discovered_urls = match &next {
            Some(url) => {
                let marker = input
                    .params
                    .get("marker")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .or_else(|| input.url_item.marker.clone());
                debug!(next = %url, "pagination link found");
                vec![DiscoveredUrl {
                    url: url.clone(),
                    marker,
                    priority: input.url_item.priority,
                }]
            }
            None => Vec::new(),
        };

        result.insert(
            "next_url".to_string(),
            next.map(Value::from).unwrap_or(Value::Null),
        );
        Ok(NodeOutput {
            result,
            discovered_urls,
        })
    }
}

fn find_next_url(body: &str, page_url: &str, params: &Value) -> Result<Option<String>, WorkflowError> {
    let selector_str = params
        .get("selector")
        .and_then(|v| v.as_str())
        .unwrap_or("a.next");
    let selector = Selector::parse(selector_str).map_err(|e| WorkflowError::InvalidParams {
        node: "paginate".to_string(),
        reason: format!("invalid selector '{}': {}", selector_str, e),
    })?;
    let attribute = params
        .get("attribute")
        .and_then(|v| v.as_str())
        .unwrap_or("href");
    let base = Url::parse(page_url).map_err(|e| WorkflowError::NodeFailed {
        node: "paginate".to_string(),
        reason: format!("page URL '{}' is not parseable: {}", page_url, e),
    })?;

    let document = Html::parse_document(body);
    let next = document
        .select(&selector)
        .filter_map(|el| el.value().attr(attribute))
        .filter_map(|href| base.join(href).ok())
        .find(|url| url.scheme() == "http" || url.scheme() == "https")
        .map(|url| url.to_string());
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::FakeBrowser;
    use crate::workflow::context::ExecutionContext;
    use crate::workflow::types::UrlQueueItem;
    use serde_json::json;

    const PAGE: &str = r#"
<html><body>
  <a class="next" href="/catalog?page=2">Next</a>
</body></html>
"#;

    async fn run(params: Value, item: UrlQueueItem) -> NodeOutput {
        let mut browser = FakeBrowser::with_body(PAGE);
        let mut ctx = ExecutionContext::new();
        PaginateNode
            .execute(NodeInput {
                browser: &mut browser,
                ctx: &mut ctx,
                params: &params,
                url_item: &item,
                execution_id: "exec-1",
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_paginate_discovers_next_page() {
        let mut item = UrlQueueItem::start_url("exec-1", "https://shop.example.com/catalog");
        item.marker = Some("listing".to_string());
        let output = run(json!({"selector": "a.next"}), item).await;

        assert_eq!(output.discovered_urls.len(), 1);
        let next = &output.discovered_urls[0];
        assert_eq!(next.url, "https://shop.example.com/catalog?page=2");
        // Marker defaults to the current item's, keeping pagination in-phase
        assert_eq!(next.marker.as_deref(), Some("listing"));
    }

    #[tokio::test]
    async fn test_paginate_stops_at_max_depth() {
        let mut item = UrlQueueItem::start_url("exec-1", "https://shop.example.com/catalog");
        item.depth = 3;
        let output = run(json!({"selector": "a.next", "max_depth": 3}), item).await;
        assert!(output.discovered_urls.is_empty());
        assert_eq!(output.result.get("next_url"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_paginate_no_link_is_not_an_error() {
        let item = UrlQueueItem::start_url("exec-1", "https://shop.example.com/catalog");
        let output = run(json!({"selector": "a.missing"}), item).await;
        assert!(output.discovered_urls.is_empty());
    }

    #[test]
    fn test_validate_requires_selector() {
        let node = PaginateNode;
        assert!(node.validate(&json!({})).is_err());
        assert!(node.validate(&json!({"selector": "a.next"})).is_ok());
    }
}
