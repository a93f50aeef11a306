use async_trait::async_trait;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::error::WorkflowError;
use crate::nodes::{DiscoveredUrl, NodeExecutor, NodeInput, NodeOutput};

/// Extracts structured fields and/or links from the current page with CSS
/// selectors.
///
/// Params:
/// - `fields`: map of field name → selector string or
///   `{selector, attribute?, all?}`. Results accumulate in the context's
///   extracted-fields map and are persisted at the end of the phase pass.
/// - `links`: `{selector, attribute?, marker?, priority?, limit?}` —
///   matched hrefs are absolutized against the page URL and emitted as
///   discovered URLs carrying the configured marker.
pub struct ExtractNode;

#[async_trait]
impl NodeExecutor for ExtractNode {
    fn node_type(&self) -> &'static str {
        "extract"
    }

    fn validate(&self, params: &Value) -> Result<(), WorkflowError> {
        let fields = params.get("fields").and_then(|v| v.as_object());
        let links = params.get("links").and_then(|v| v.as_object());
        if fields.is_none() && links.is_none() {
            return Err(self.invalid("requires 'fields' and/or 'links'"));
        }

        if let Some(fields) = fields {
            for (name, spec) in fields {
                let selector = field_selector(spec)
                    .ok_or_else(|| self.invalid(&format!("field '{}' has no selector", name)))?;
                check_selector(selector)
                    .map_err(|e| self.invalid(&format!("field '{}': {}", name, e)))?;
            }
        }
        if let Some(links) = links {
            let selector = links
                .get("selector")
                .and_then(|v| v.as_str())
                .ok_or_else(|| self.invalid("'links' requires a selector"))?;
            check_selector(selector).map_err(|e| self.invalid(&format!("links: {}", e)))?;
        }
        Ok(())
    }

    async fn execute(&self, input: NodeInput<'_>) -> Result<NodeOutput, WorkflowError> {
        let body = input.browser.response_body().to_string();
        let output = extract_from_html(&body, &input.url_item.url, input.params)?;

        if let Some(Value::Object(fields)) = output.result.get("fields") {
            input.ctx.merge_extracted(fields);
        }

        debug!(
            url = %input.url_item.url,
            links = output.discovered_urls.len(),
            "extract node finished"
        );
        Ok(output)
    }
}

impl ExtractNode {
    fn invalid(&self, reason: &str) -> WorkflowError {
        WorkflowError::InvalidParams {
            node: self.node_type().to_string(),
            reason: reason.to_string(),
        }
    }
}

fn field_selector(spec: &Value) -> Option<&str> {
    match spec {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("selector").and_then(|v| v.as_str()),
        _ => None,
    }
}

fn check_selector(selector: &str) -> Result<(), String> {
    Selector::parse(selector)
        .map(|_| ())
        .map_err(|e| format!("invalid selector '{}': {}", selector, e))
}

/// Synchronous extraction pass. `Html` is not `Send`, so the parsed
/// document must never be held across an await point.
fn extract_from_html(body: &str, page_url: &str, params: &Value) -> Result<NodeOutput, WorkflowError> {
    let document = Html::parse_document(body);
    let mut result = Map::new();

    if let Some(fields) = params.get("fields").and_then(|v| v.as_object()) {
        let mut extracted = Map::new();
        for (name, spec) in fields {
            if let Some(value) = extract_field(&document, spec) {
                extracted.insert(name.clone(), value);
            }
        }
        result.insert("fields".to_string(), Value::Object(extracted));
    }

    let mut discovered_urls = Vec::new();
    if let Some(links) = params.get("links").and_then(|v| v.as_object()) {
        discovered_urls = extract_links(&document, page_url, links)?;
        result.insert("links_found".to_string(), Value::from(discovered_urls.len()));
    }

    Ok(NodeOutput {
        result,
        discovered_urls,
    })
}

fn extract_field(document: &Html, spec: &Value) -> Option<Value> {
    let selector_str = field_selector(spec)?;
    let selector = Selector::parse(selector_str).ok()?;
    let attribute = spec.get("attribute").and_then(|v| v.as_str());
    let all = spec
        .get("all")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut values: Vec<Value> = Vec::new();
    for element in document.select(&selector) {
        let text = match attribute {
            Some(attr) => element.value().attr(attr).map(|s| s.to_string()),
            None => {
                let joined = element.text().collect::<Vec<_>>().join(" ");
                let trimmed = joined.split_whitespace().collect::<Vec<_>>().join(" ");
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed)
                }
            }
        };
        if let Some(text) = text {
            values.push(Value::from(text));
        }
        if !all && !values.is_empty() {
            break;
        }
    }

    if values.is_empty() {
        None
    } else if all {
        Some(Value::Array(values))
    } else {
        values.into_iter().next()
    }
}

fn extract_links(
    document: &Html,
    page_url: &str,
    links: &Map<String, Value>,
) -> Result<Vec<DiscoveredUrl>, WorkflowError> {
    let selector_str = links
        .get("selector")
        .and_then(|v| v.as_str())
        .unwrap_or("a");
    let selector = Selector::parse(selector_str).map_err(|e| WorkflowError::InvalidParams {
        node: "extract".to_string(),
        reason: format!("invalid selector '{}': {}", selector_str, e),
    })?;
    let attribute = links
        .get("attribute")
        .and_then(|v| v.as_str())
        .unwrap_or("href");
    let marker = links
        .get("marker")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let priority = links
        .get("priority")
        .and_then(|v| v.as_i64())
        .unwrap_or(0) as i32;
    let limit = links
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(u64::MAX) as usize;

    let base = Url::parse(page_url).map_err(|e| WorkflowError::NodeFailed {
        node: "extract".to_string(),
        reason: format!("page URL '{}' is not parseable: {}", page_url, e),
    })?;

    let mut seen = std::collections::HashSet::new();
    let mut discovered = Vec::new();
    for element in document.select(&selector) {
        if discovered.len() >= limit {
            break;
        }
        let Some(href) = element.value().attr(attribute) else {
            continue;
        };
        let absolute = match base.join(href) {
            Ok(url) => url,
            Err(e) => {
                warn!(href = href, "skipping unjoinable link: {}", e);
                continue;
            }
        };
        // Only crawlable schemes; anchors and javascript: links are noise
        if absolute.scheme() != "http" && absolute.scheme() != "https" {
            continue;
        }
        let url = absolute.to_string();
        if seen.insert(url.clone()) {
            discovered.push(DiscoveredUrl {
                url,
                marker: marker.clone(),
                priority,
            });
        }
    }
    Ok(discovered)
}
