use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::WorkflowError;

/// A complete workflow definition: the document operators author in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier for this workflow
    pub id: String,

    /// Human-readable workflow name
    pub name: String,

    /// Ordered list of phases; the first phase is the routing fallback
    pub phases: Vec<WorkflowPhase>,

    /// Seed URLs enqueued at depth 0 when an execution starts
    #[serde(default)]
    pub start_urls: Vec<String>,
}

impl Workflow {
    /// Load a workflow definition from a YAML file.
    pub fn from_yaml_file(path: &Path) -> Result<Self, WorkflowError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WorkflowError::Definition(format!("failed to read {}: {}", path.display(), e))
        })?;
        let workflow: Workflow = serde_yaml::from_str(&contents).map_err(|e| {
            WorkflowError::Definition(format!("failed to parse {}: {}", path.display(), e))
        })?;
        if workflow.phases.is_empty() {
            return Err(WorkflowError::Definition(
                "workflow has no phases".to_string(),
            ));
        }
        Ok(workflow)
    }

    /// Find a phase by id.
    pub fn phase(&self, phase_id: &str) -> Option<&WorkflowPhase> {
        self.phases.iter().find(|p| p.id == phase_id)
    }
}

/// A named stage of a workflow with its own node DAG and URL routing filter.
/// Immutable once the workflow is defined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPhase {
    /// Unique identifier within the workflow
    pub id: String,

    /// Phase type label (e.g. "listing", "detail")
    #[serde(rename = "type", default)]
    pub phase_type: String,

    /// Human-readable phase name
    pub name: String,

    /// Ordered node list; execution order is derived from dependencies
    pub nodes: Vec<NodeSpec>,

    /// Filter deciding which queue items this phase accepts
    #[serde(default)]
    pub url_filter: UrlFilter,

    /// Optional transition re-routing URLs discovered in this phase
    #[serde(default)]
    pub transition: Option<PhaseTransition>,
}

impl WorkflowPhase {
    /// Whether the phase declares an explicit navigate node. When it does
    /// not, the executor auto-navigates before running the DAG.
    pub fn has_navigate_node(&self) -> bool {
        self.nodes.iter().any(|n| n.node_type == "navigate")
    }
}

/// Routing filter for a phase. Checked in priority order:
/// marker membership, exact depth, regex patterns against the URL.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UrlFilter {
    /// Routing tags this phase accepts
    #[serde(default)]
    pub markers: Vec<String>,

    /// Exact crawl depth this phase accepts
    #[serde(default)]
    pub depth: Option<u32>,

    /// Regex patterns matched against the URL
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// Re-routing applied to URLs discovered while processing a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTransition {
    /// Transition condition: "always" (default) or "items_extracted"
    #[serde(default)]
    pub condition: Option<String>,

    /// Phase id newly discovered URLs are routed to
    pub next_phase: String,

    /// Free-form parameters forwarded to the next phase
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// Static definition of one node inside a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique identifier within the phase
    pub id: String,

    /// Node type, dispatched through the node registry
    #[serde(rename = "type")]
    pub node_type: String,

    /// Human-readable node name
    #[serde(default)]
    pub name: String,

    /// Node parameters, validated by the node executor
    #[serde(default)]
    pub params: Value,

    /// Ids of nodes that must complete before this node runs
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Context key the node's result is stored under
    #[serde(default)]
    pub output_key: Option<String>,

    /// Optional nodes fail soft: the failure is logged and skipped
    #[serde(default)]
    pub optional: bool,

    /// Node-level retry policy for execution errors
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Retry policy for node execution errors (not HTTP errors, which are
/// handled by the recovery system).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 500,
        }
    }
}

/// Terminal and in-flight states of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One URL awaiting or undergoing processing. Created at enqueue time,
/// mutated by dequeue/mark-completed/mark-failed/phase-transition, never
/// deleted mid-execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlQueueItem {
    /// Unique identifier for this item
    pub id: String,

    /// Execution this item belongs to
    pub execution_id: String,

    /// URL to process
    pub url: String,

    /// Crawl depth (0 for start URLs)
    pub depth: u32,

    /// Priority (higher values dequeue first)
    pub priority: i32,

    /// Id of the queue item that discovered this URL
    pub parent_url_id: Option<String>,

    /// Routing tag used for phase matching
    pub marker: Option<String>,

    /// Explicit phase assignment; when set, routing is exact
    pub phase_id: Option<String>,

    /// Id of the node that discovered this URL
    pub discovered_by_node: Option<String>,

    /// Node execution record that produced this URL
    pub parent_node_execution_id: Option<String>,

    /// How many times this URL has been re-enqueued after failure
    pub retry_count: u32,

    /// Current queue status
    pub status: UrlStatus,
}

impl UrlQueueItem {
    /// Build a fresh pending item for a start URL at depth 0.
    pub fn start_url(execution_id: &str, url: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            url: url.to_string(),
            depth: 0,
            priority: 0,
            parent_url_id: None,
            marker: None,
            phase_id: None,
            discovered_by_node: None,
            parent_node_execution_id: None,
            retry_count: 0,
            status: UrlStatus::Pending,
        }
    }
}

/// Status of one node execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// One concrete run record of a node against one URL. Created immediately
/// before the node runs; updated to completed/failed after. The
/// `parent_node_execution_id` links form the execution lineage tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub execution_id: String,
    pub node_id: String,
    pub node_type: String,
    pub status: NodeExecutionStatus,
    pub url_id: String,
    pub parent_node_execution_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub input: Value,
    pub output: Value,
    pub retry_count: u32,
    pub urls_discovered: u64,
    pub error: Option<String>,
}

impl NodeExecution {
    pub fn start(
        execution_id: &str,
        node_id: &str,
        node_type: &str,
        url_id: &str,
        parent_node_execution_id: Option<String>,
        input: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            node_type: node_type.to_string(),
            status: NodeExecutionStatus::Running,
            url_id: url_id.to_string(),
            parent_node_execution_id,
            started_at: Utc::now(),
            completed_at: None,
            input,
            output: Value::Null,
            retry_count: 0,
            urls_discovered: 0,
            error: None,
        }
    }
}

/// Aggregate counters for one execution. Recomputed on the stats ticker
/// and at terminal states.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub urls_discovered: u64,
    pub urls_processed: u64,
    pub urls_failed: u64,
    pub items_extracted: u64,
    pub nodes_executed: u64,
    pub nodes_failed: u64,
    pub duration_ms: u64,
}

/// Terminal status of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// A structured record extracted from one URL by the extract/transform
/// nodes of a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub id: String,
    pub execution_id: String,
    pub url: String,
    pub phase_id: String,
    pub data: Value,
    pub extracted_at: DateTime<Utc>,
}

/// Snapshot of an HTTP response passed into recovery condition evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseInfo {
    pub status_code: Option<u16>,

    /// Response headers; multi-valued headers keep every value
    pub headers: HashMap<String, Vec<String>>,

    /// Body snapshot (may be truncated by the browser layer)
    pub body: String,
}

impl ResponseInfo {
    /// First value of a header, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .and_then(|(_, vals)| vals.first())
            .map(|s| s.as_str())
    }
}
