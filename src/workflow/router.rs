use regex::Regex;
use tracing::{debug, warn};

use crate::workflow::types::{UrlQueueItem, Workflow, WorkflowPhase};

/// Routes dequeued URL items to workflow phases.
///
/// Matching priority: an item that already carries a `phase_id` matches that
/// phase exactly; otherwise each phase's filter is evaluated in declaration
/// order checking marker membership, then exact depth, then regex patterns
/// against the URL. An item no phase claims falls back to the first
/// declared phase.
pub struct PhaseRouter {
    phases: Vec<CompiledPhase>,
}

struct CompiledPhase {
    index: usize,
    id: String,
    markers: Vec<String>,
    depth: Option<u32>,
    patterns: Vec<Regex>,
}

impl PhaseRouter {
    pub fn new(workflow: &Workflow) -> Self {
        let phases = workflow
            .phases
            .iter()
            .enumerate()
            .map(|(index, phase)| CompiledPhase {
                index,
                id: phase.id.clone(),
                markers: phase.url_filter.markers.clone(),
                depth: phase.url_filter.depth,
                // Invalid patterns are dropped with a warning, as the
                // scheduler does for URL include/exclude patterns
                patterns: phase
                    .url_filter
                    .patterns
                    .iter()
                    .filter_map(|p| match Regex::new(p) {
                        Ok(re) => Some(re),
                        Err(e) => {
                            warn!("invalid url pattern '{}' in phase '{}': {}", p, phase.id, e);
                            None
                        }
                    })
                    .collect(),
            })
            .collect();

        Self { phases }
    }

    /// Pick the phase that should process this item.
    ///
    /// Returns `None` only when the workflow has no phases at all.
    pub fn route<'a>(
        &self,
        workflow: &'a Workflow,
        item: &UrlQueueItem,
    ) -> Option<&'a WorkflowPhase> {
        if let Some(phase_id) = &item.phase_id {
            if let Some(phase) = workflow.phase(phase_id) {
                return Some(phase);
            }
            warn!(
                "item {} carries unknown phase_id '{}', falling back to filters",
                item.id, phase_id
            );
        }

        for compiled in &self.phases {
            if compiled.matches(item) {
                debug!(
                    url = %item.url,
                    phase = %compiled.id,
                    "routed item to phase"
                );
                return Some(&workflow.phases[compiled.index]);
            }
        }

        // No filter claimed the item: route to the first declared phase
        workflow.phases.first()
    }
}

impl CompiledPhase {
    fn matches(&self, item: &UrlQueueItem) -> bool {
        if !self.markers.is_empty() {
            return match &item.marker {
                Some(marker) => self.markers.iter().any(|m| m == marker),
                None => false,
            };
        }

        if let Some(depth) = self.depth {
            return item.depth == depth;
        }

        if !self.patterns.is_empty() {
            return self.patterns.iter().any(|p| p.is_match(&item.url));
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{UrlFilter, UrlStatus};

    fn phase(id: &str, filter: UrlFilter) -> WorkflowPhase {
        WorkflowPhase {
            id: id.to_string(),
            phase_type: String::new(),
            name: id.to_string(),
            nodes: vec![],
            url_filter: filter,
            transition: None,
        }
    }

    fn workflow(phases: Vec<WorkflowPhase>) -> Workflow {
        Workflow {
            id: "wf".to_string(),
            name: "wf".to_string(),
            phases,
            start_urls: vec![],
        }
    }

    fn item(url: &str, depth: u32, marker: Option<&str>, phase_id: Option<&str>) -> UrlQueueItem {
        UrlQueueItem {
            id: "item-1".to_string(),
            execution_id: "exec-1".to_string(),
            url: url.to_string(),
            depth,
            priority: 0,
            parent_url_id: None,
            marker: marker.map(|m| m.to_string()),
            phase_id: phase_id.map(|p| p.to_string()),
            discovered_by_node: None,
            parent_node_execution_id: None,
            retry_count: 0,
            status: UrlStatus::Pending,
        }
    }

    #[test]
    fn test_explicit_phase_id_wins() {
        let wf = workflow(vec![
            phase(
                "listing",
                UrlFilter {
                    depth: Some(0),
                    ..Default::default()
                },
            ),
            phase("detail", UrlFilter::default()),
        ]);
        let router = PhaseRouter::new(&wf);
        // Depth 0 would route to "listing", but the explicit id wins
        let routed = router
            .route(&wf, &item("https://example.com", 0, None, Some("detail")))
            .unwrap();
        assert_eq!(routed.id, "detail");
    }

    #[test]
    fn test_marker_beats_depth_declaration_order() {
        let wf = workflow(vec![
            phase(
                "by-depth",
                UrlFilter {
                    depth: Some(1),
                    ..Default::default()
                },
            ),
            phase(
                "by-marker",
                UrlFilter {
                    markers: vec!["product".to_string()],
                    ..Default::default()
                },
            ),
        ]);
        let router = PhaseRouter::new(&wf);

        // Marker item at depth 1: first phase has no markers and matches on
        // depth, so declaration order decides
        let routed = router
            .route(&wf, &item("https://example.com/p/1", 1, Some("product"), None))
            .unwrap();
        assert_eq!(routed.id, "by-depth");

        // At a non-matching depth only the marker phase claims it
        let routed = router
            .route(&wf, &item("https://example.com/p/1", 2, Some("product"), None))
            .unwrap();
        assert_eq!(routed.id, "by-marker");
    }

    #[test]
    fn test_depth_zero_routes_start_urls() {
        let wf = workflow(vec![
            phase(
                "listing",
                UrlFilter {
                    depth: Some(0),
                    ..Default::default()
                },
            ),
            phase(
                "detail",
                UrlFilter {
                    depth: Some(1),
                    ..Default::default()
                },
            ),
        ]);
        let router = PhaseRouter::new(&wf);
        let routed = router
            .route(&wf, &item("https://example.com", 0, None, None))
            .unwrap();
        assert_eq!(routed.id, "listing");
    }

    #[test]
    fn test_regex_pattern_match() {
        let wf = workflow(vec![
            phase(
                "products",
                UrlFilter {
                    patterns: vec![r"/products/\d+".to_string()],
                    ..Default::default()
                },
            ),
            phase("other", UrlFilter::default()),
        ]);
        let router = PhaseRouter::new(&wf);
        let routed = router
            .route(&wf, &item("https://example.com/products/42", 3, None, None))
            .unwrap();
        assert_eq!(routed.id, "products");
    }

    #[test]
    fn test_no_match_falls_back_to_first_phase() {
        let wf = workflow(vec![
            phase(
                "listing",
                UrlFilter {
                    depth: Some(5),
                    ..Default::default()
                },
            ),
            phase(
                "detail",
                UrlFilter {
                    markers: vec!["product".to_string()],
                    ..Default::default()
                },
            ),
        ]);
        let router = PhaseRouter::new(&wf);
        let routed = router
            .route(&wf, &item("https://example.com", 0, None, None))
            .unwrap();
        assert_eq!(routed.id, "listing");
    }
}
