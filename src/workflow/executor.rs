use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::{BrowserContext, BrowserPool};
use crate::cli::config::ExecutorSettings;
use crate::error::WorkflowError;
use crate::nodes::{NodeInput, NodeOutput, NodeRegistry};
use crate::recovery::{ErrorContext, RecoverySystem};
use crate::storage::{ExecutionRepo, ExtractedItemRepo, NodeExecutionRepo, UrlQueue};
use crate::workflow::context::{ExecutionContext, LAST_NODE_EXEC_ID, NODE_EXEC_ID};
use crate::workflow::dag::NodeDag;
use crate::workflow::events::{EventBroadcaster, EventType, ExecutionEvent};
use crate::workflow::router::PhaseRouter;
use crate::workflow::types::{
    ExecutionStats, ExecutionStatus, ExtractedItem, NodeExecution, NodeSpec, UrlQueueItem,
    UrlStatus, Workflow, WorkflowPhase,
};

/// Live counters shared between the main loop and the stats ticker.
#[derive(Default)]
struct Counters {
    urls_discovered: AtomicU64,
    urls_processed: AtomicU64,
    urls_failed: AtomicU64,
    items_extracted: AtomicU64,
    nodes_executed: AtomicU64,
    nodes_failed: AtomicU64,
}

impl Counters {
    fn snapshot(&self, started: Instant) -> ExecutionStats {
        ExecutionStats {
            urls_discovered: self.urls_discovered.load(Ordering::Relaxed),
            urls_processed: self.urls_processed.load(Ordering::Relaxed),
            urls_failed: self.urls_failed.load(Ordering::Relaxed),
            items_extracted: self.items_extracted.load(Ordering::Relaxed),
            nodes_executed: self.nodes_executed.load(Ordering::Relaxed),
            nodes_failed: self.nodes_failed.load(Ordering::Relaxed),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Runs one workflow execution: a single control loop that dequeues URLs,
/// routes them to phases, executes each phase's node DAG sequentially, and
/// escalates HTTP errors to the recovery system.
///
/// Parallelism comes from running multiple executors against a shared
/// queue, not from concurrency inside one executor.
pub struct WorkflowExecutor {
    workflow: Workflow,
    router: PhaseRouter,
    registry: NodeRegistry,
    queue: Arc<dyn UrlQueue>,
    node_repo: Arc<dyn NodeExecutionRepo>,
    item_repo: Arc<dyn ExtractedItemRepo>,
    execution_repo: Arc<dyn ExecutionRepo>,
    pool: Arc<BrowserPool>,
    recovery: Arc<RecoverySystem>,
    events: EventBroadcaster,
    settings: ExecutorSettings,
    counters: Arc<Counters>,
}

impl WorkflowExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow: Workflow,
        registry: NodeRegistry,
        queue: Arc<dyn UrlQueue>,
        node_repo: Arc<dyn NodeExecutionRepo>,
        item_repo: Arc<dyn ExtractedItemRepo>,
        execution_repo: Arc<dyn ExecutionRepo>,
        pool: Arc<BrowserPool>,
        recovery: Arc<RecoverySystem>,
        events: EventBroadcaster,
        settings: ExecutorSettings,
    ) -> Self {
        let router = PhaseRouter::new(&workflow);
        Self {
            workflow,
            router,
            registry,
            queue,
            node_repo,
            item_repo,
            execution_repo,
            pool,
            recovery,
            events,
            settings,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Run the execution to completion. Returns the final stats, or the
    /// first fatal error (definition problems, cancellation).
    pub async fn run(
        &self,
        execution_id: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionStats, WorkflowError> {
        // Fail fast: every node type and DAG must be sound before any URL
        // is touched
        self.registry.validate_workflow(&self.workflow)?;
        let mut dags: HashMap<String, NodeDag> = HashMap::new();
        for phase in &self.workflow.phases {
            dags.insert(phase.id.clone(), NodeDag::build(&phase.nodes)?);
        }

        let started = Instant::now();
        info!(
            execution_id,
            workflow = %self.workflow.name,
            start_urls = self.workflow.start_urls.len(),
            "starting workflow execution"
        );
        self.execution_repo
            .update_status(execution_id, ExecutionStatus::Running)
            .await?;
        self.publish(
            EventType::ExecutionStarted,
            execution_id,
            json!({ "workflow_id": self.workflow.id }),
        )
        .await;

        for url in &self.workflow.start_urls {
            let item = UrlQueueItem::start_url(execution_id, url);
            self.counters.urls_discovered.fetch_add(1, Ordering::Relaxed);
            self.publish(
                EventType::UrlDiscovered,
                execution_id,
                json!({ "url": url, "depth": 0 }),
            )
            .await;
            self.queue.enqueue(item).await?;
        }

        let ticker = self.spawn_stats_ticker(execution_id, started);

        let loop_result = self.dequeue_loop(execution_id, &dags, &mut cancel).await;
        ticker.abort();

        let stats = self.counters.snapshot(started);
        self.execution_repo.update_stats(execution_id, &stats).await?;

        match loop_result {
            Ok(()) => {
                // The worst unrecovered failure decides the terminal status:
                // an execution where nothing succeeded is a failure
                let failed = stats.urls_processed == 0 && stats.urls_failed > 0;
                let (status, event) = if failed {
                    (ExecutionStatus::Failed, EventType::ExecutionFailed)
                } else {
                    (ExecutionStatus::Completed, EventType::ExecutionCompleted)
                };
                self.execution_repo.update_status(execution_id, status).await?;
                self.publish(event, execution_id, serde_json::to_value(&stats).unwrap_or(Value::Null))
                    .await;
                info!(execution_id, ?stats, "workflow execution finished");
                Ok(stats)
            }
            Err(err) => {
                self.execution_repo
                    .update_status(execution_id, ExecutionStatus::Failed)
                    .await?;
                self.publish(
                    EventType::ExecutionFailed,
                    execution_id,
                    json!({ "error": err.to_string() }),
                )
                .await;
                error!(execution_id, "workflow execution failed: {}", err);
                Err(err)
            }
        }
    }

    async fn dequeue_loop(
        &self,
        execution_id: &str,
        dags: &HashMap<String, NodeDag>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkflowError> {
        let controls = self.recovery.controls();
        loop {
            if *cancel.borrow() {
                return Err(WorkflowError::Canceled);
            }
            if controls.is_paused() {
                tokio::time::sleep(Duration::from_millis(self.settings.idle_poll_ms)).await;
                continue;
            }

            match self.queue.dequeue(execution_id).await? {
                Some(item) => {
                    self.process_item(execution_id, item, dags).await?;
                }
                None => {
                    // Dequeue returning nothing is not completion: failed
                    // items may have been requeued while we were busy
                    if self.queue.pending_count(execution_id).await? == 0 {
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_millis(self.settings.idle_poll_ms)).await;
                }
            }
        }
    }

    /// Process one dequeued item end to end and move it to a terminal
    /// state. Only infrastructure errors propagate; a URL's own failure is
    /// recorded on the item and the loop moves on.
    async fn process_item(
        &self,
        execution_id: &str,
        item: UrlQueueItem,
        dags: &HashMap<String, NodeDag>,
    ) -> Result<(), WorkflowError> {
        let Some(phase) = self.router.route(&self.workflow, &item) else {
            self.queue
                .mark_failed(&item.id, "workflow has no phases", false)
                .await?;
            self.counters.urls_failed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };
        let Some(dag) = dags.get(&phase.id) else {
            // Every phase got a DAG in run(); a miss is a routing bug
            self.queue
                .mark_failed(&item.id, "phase has no execution plan", false)
                .await?;
            self.counters.urls_failed.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        debug!(url = %item.url, phase = %phase.id, depth = item.depth, "processing url");
        self.publish(
            EventType::PhaseStarted,
            execution_id,
            json!({ "phase_id": phase.id, "url": item.url, "url_id": item.id }),
        )
        .await;

        // Recovery's add_delay throttles the whole loop, not one request
        let extra_delay = self.recovery.controls().extra_delay();
        if !extra_delay.is_zero() {
            tokio::time::sleep(extra_delay).await;
        }

        let mut browser = self.pool.acquire().await?;
        let mut ctx = ExecutionContext::new();
        let mut discovered_ids: Vec<String> = Vec::new();
        let mut failure: Option<WorkflowError> = None;

        // A phase without an explicit navigate node still needs the page
        if !phase.has_navigate_node() {
            let auto = auto_navigate_spec();
            if let Err(err) = self
                .run_node(execution_id, &item, &auto, browser.as_mut(), &mut ctx, &mut discovered_ids)
                .await
            {
                failure = Some(err);
            }
        }

        if failure.is_none() {
            for node in dag.ordered(&phase.nodes) {
                match self
                    .run_node(execution_id, &item, node, browser.as_mut(), &mut ctx, &mut discovered_ids)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if node.optional => {
                        warn!(node = %node.id, url = %item.url, "optional node failed, skipping: {}", err);
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
        }

        // Extracted fields persist even when a later node failed
        let extracted = self
            .persist_extracted(execution_id, &item, phase, &ctx)
            .await?;

        if failure.is_none() {
            self.apply_transition(execution_id, phase, extracted, &discovered_ids)
                .await?;
        }

        self.pool.release(browser).await;

        match failure {
            None => {
                self.queue.mark_completed(&item.id).await?;
                self.counters.urls_processed.fetch_add(1, Ordering::Relaxed);
                self.publish(
                    EventType::PhaseCompleted,
                    execution_id,
                    json!({ "phase_id": phase.id, "url": item.url, "url_id": item.id }),
                )
                .await;
            }
            Some(err) => {
                self.queue
                    .mark_failed(&item.id, &err.to_string(), err.is_retryable())
                    .await?;
                self.counters.urls_failed.fetch_add(1, Ordering::Relaxed);
                self.publish(
                    EventType::PhaseFailed,
                    execution_id,
                    json!({
                        "phase_id": phase.id,
                        "url": item.url,
                        "url_id": item.id,
                        "error": err.to_string(),
                        "retryable": err.is_retryable(),
                    }),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Execute one node with its retry policy, recording the execution and
    /// publishing lifecycle events. HTTP errors go through recovery with a
    /// single re-execution; other errors use the node's retry policy.
    async fn run_node(
        &self,
        execution_id: &str,
        item: &UrlQueueItem,
        node: &NodeSpec,
        browser: &mut dyn BrowserContext,
        ctx: &mut ExecutionContext,
        discovered_ids: &mut Vec<String>,
    ) -> Result<(), WorkflowError> {
        let executor = self.registry.get(&node.node_type).ok_or_else(|| {
            WorkflowError::Definition(format!("unknown node type '{}'", node.node_type))
        })?;

        let parent = ctx.lineage_parent();
        let record = NodeExecution::start(
            execution_id,
            &node.id,
            &node.node_type,
            &item.id,
            parent.clone(),
            node.params.clone(),
        );
        let node_exec_id = record.id.clone();
        ctx.set(NODE_EXEC_ID, Value::from(node_exec_id.clone()));
        self.node_repo.create(record).await?;
        self.publish(
            EventType::NodeStarted,
            execution_id,
            json!({
                "node_id": node.id,
                "node_type": node.node_type,
                "node_execution_id": node_exec_id,
                "parent_node_execution_id": parent,
                "url": item.url,
            }),
        )
        .await;

        let mut attempt = 0;
        let outcome = loop {
            let result = executor
                .execute(NodeInput {
                    browser: &mut *browser,
                    ctx: &mut *ctx,
                    params: &node.params,
                    url_item: item,
                    execution_id,
                })
                .await;

            match result {
                Ok(output) => break Ok(output),
                Err(err @ WorkflowError::HttpStatus { .. }) => {
                    // Recovery gets exactly one shot at re-executing the node
                    break self
                        .recover_and_retry(
                            execution_id,
                            item,
                            node,
                            &*executor,
                            &mut *browser,
                            &mut *ctx,
                            err,
                        )
                        .await;
                }
                Err(err) if attempt < node.retry.max_retries => {
                    attempt += 1;
                    warn!(
                        node = %node.id,
                        attempt,
                        max = node.retry.max_retries,
                        "node failed, retrying: {}", err
                    );
                    tokio::time::sleep(Duration::from_millis(node.retry.delay_ms)).await;
                }
                Err(err) => break Err(err),
            }
        };

        // The node is done either way: shift the lineage chain forward
        ctx.set(LAST_NODE_EXEC_ID, Value::from(node_exec_id.clone()));
        ctx.set(NODE_EXEC_ID, Value::Null);

        match outcome {
            Ok(output) => {
                self.recovery.record_success().await;
                let discovered = self
                    .enqueue_discovered(execution_id, item, node, &node_exec_id, &output)
                    .await?;
                discovered_ids.extend(discovered);

                if let Some(key) = &node.output_key {
                    ctx.set(key, Value::Object(output.result.clone()));
                }

                self.node_repo
                    .mark_completed(
                        &node_exec_id,
                        Value::Object(output.result),
                        output.discovered_urls.len() as u64,
                    )
                    .await?;
                self.counters.nodes_executed.fetch_add(1, Ordering::Relaxed);
                self.publish(
                    EventType::NodeCompleted,
                    execution_id,
                    json!({
                        "node_id": node.id,
                        "node_execution_id": node_exec_id,
                        "parent_node_execution_id": parent,
                        "urls_discovered": output.discovered_urls.len(),
                    }),
                )
                .await;
                Ok(())
            }
            Err(err) => {
                self.node_repo
                    .mark_failed(&node_exec_id, &err.to_string())
                    .await?;
                self.counters.nodes_failed.fetch_add(1, Ordering::Relaxed);
                self.publish(
                    EventType::NodeFailed,
                    execution_id,
                    json!({
                        "node_id": node.id,
                        "node_execution_id": node_exec_id,
                        "parent_node_execution_id": parent,
                        "error": err.to_string(),
                    }),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Escalate an HTTP error to the recovery system. On a successful
    /// recovery the node is re-executed exactly once; a second failure is
    /// terminal for the node.
    async fn recover_and_retry(
        &self,
        execution_id: &str,
        item: &UrlQueueItem,
        node: &NodeSpec,
        executor: &dyn crate::nodes::NodeExecutor,
        browser: &mut dyn BrowserContext,
        ctx: &mut ExecutionContext,
        err: WorkflowError,
    ) -> Result<NodeOutput, WorkflowError> {
        let Some(decision) = self.recovery.observe_failure(&err).await else {
            // Transient noise: let the plain failure path handle it
            return Err(err);
        };
        info!(
            url = %item.url,
            node = %node.id,
            reason = %decision.reason,
            "error recovery activated"
        );

        let mut error_ctx = ErrorContext::new(
            execution_id,
            &item.url,
            &err,
            browser.response_info(),
            item.retry_count,
        );
        let solution = match self.recovery.find_solution(&mut error_ctx).await {
            Ok(solution) => solution,
            Err(recovery_err) => {
                warn!(url = %item.url, "recovery found no solution: {}", recovery_err);
                // Surface the original HTTP failure, not the lookup miss
                return Err(err);
            }
        };
        self.recovery.apply(&solution, &mut *browser).await?;

        let retry = executor
            .execute(NodeInput {
                browser: &mut *browser,
                ctx,
                params: &node.params,
                url_item: item,
                execution_id,
            })
            .await;

        match retry {
            Ok(output) => {
                self.recovery
                    .report_outcome(&solution, &error_ctx, true)
                    .await;
                info!(url = %item.url, node = %node.id, "recovery succeeded");
                Ok(output)
            }
            Err(retry_err) => {
                self.recovery
                    .report_outcome(&solution, &error_ctx, false)
                    .await;
                warn!(url = %item.url, node = %node.id, "retry after recovery failed: {}", retry_err);
                Err(retry_err)
            }
        }
    }

    /// Enqueue the URLs a node discovered, linking them back to the
    /// discovering node execution.
    async fn enqueue_discovered(
        &self,
        execution_id: &str,
        item: &UrlQueueItem,
        node: &NodeSpec,
        node_exec_id: &str,
        output: &NodeOutput,
    ) -> Result<Vec<String>, WorkflowError> {
        let mut ids = Vec::with_capacity(output.discovered_urls.len());
        for discovered in &output.discovered_urls {
            let child = UrlQueueItem {
                id: Uuid::new_v4().to_string(),
                execution_id: execution_id.to_string(),
                url: discovered.url.clone(),
                depth: item.depth + 1,
                priority: discovered.priority,
                parent_url_id: Some(item.id.clone()),
                marker: discovered.marker.clone(),
                phase_id: None,
                discovered_by_node: Some(node.id.clone()),
                parent_node_execution_id: Some(node_exec_id.to_string()),
                retry_count: 0,
                status: UrlStatus::Pending,
            };
            ids.push(child.id.clone());
            self.counters.urls_discovered.fetch_add(1, Ordering::Relaxed);
            self.publish(
                EventType::UrlDiscovered,
                execution_id,
                json!({
                    "url": discovered.url,
                    "depth": child.depth,
                    "marker": discovered.marker,
                    "parent_node_execution_id": node_exec_id,
                }),
            )
            .await;
            self.queue.enqueue(child).await?;
        }
        Ok(ids)
    }

    /// Persist the fields extract/transform nodes accumulated during this
    /// pass. Returns whether anything was stored.
    async fn persist_extracted(
        &self,
        execution_id: &str,
        item: &UrlQueueItem,
        phase: &WorkflowPhase,
        ctx: &ExecutionContext,
    ) -> Result<bool, WorkflowError> {
        let Some(fields) = ctx.extracted_fields() else {
            return Ok(false);
        };
        let extracted = ExtractedItem {
            id: Uuid::new_v4().to_string(),
            execution_id: execution_id.to_string(),
            url: item.url.clone(),
            phase_id: phase.id.clone(),
            data: Value::Object(fields.clone()),
            extracted_at: chrono::Utc::now(),
        };
        let id = self.item_repo.create(extracted).await?;
        self.counters.items_extracted.fetch_add(1, Ordering::Relaxed);
        self.publish(
            EventType::ItemExtracted,
            execution_id,
            json!({ "item_id": id, "url": item.url, "phase_id": phase.id }),
        )
        .await;
        Ok(true)
    }

    /// Re-route the URLs discovered in this pass according to the phase's
    /// transition rule.
    async fn apply_transition(
        &self,
        execution_id: &str,
        phase: &WorkflowPhase,
        extracted: bool,
        discovered_ids: &[String],
    ) -> Result<(), WorkflowError> {
        let Some(transition) = &phase.transition else {
            return Ok(());
        };
        let applies = match transition.condition.as_deref() {
            None | Some("always") => true,
            Some("items_extracted") => extracted,
            Some(other) => {
                warn!(
                    phase = %phase.id,
                    condition = other,
                    "unknown transition condition, treating as 'always'"
                );
                true
            }
        };
        if !applies || discovered_ids.is_empty() {
            return Ok(());
        }

        if self.workflow.phase(&transition.next_phase).is_none() {
            return Err(WorkflowError::Definition(format!(
                "phase '{}' transitions to unknown phase '{}'",
                phase.id, transition.next_phase
            )));
        }

        debug!(
            execution_id,
            from = %phase.id,
            to = %transition.next_phase,
            urls = discovered_ids.len(),
            "applying phase transition"
        );
        for id in discovered_ids {
            self.queue.update_phase_id(id, &transition.next_phase).await?;
        }
        Ok(())
    }

    fn spawn_stats_ticker(
        &self,
        execution_id: &str,
        started: Instant,
    ) -> tokio::task::JoinHandle<()> {
        let counters = Arc::clone(&self.counters);
        let repo = Arc::clone(&self.execution_repo);
        let events = self.events.clone();
        let execution_id = execution_id.to_string();
        let interval = Duration::from_secs(self.settings.stats_interval_secs.max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // the first tick is immediate
            loop {
                ticker.tick().await;
                let stats = counters.snapshot(started);
                if let Err(e) = repo.update_stats(&execution_id, &stats).await {
                    warn!("failed to persist execution stats: {}", e);
                }
                events
                    .publish(ExecutionEvent::new(
                        EventType::StatsUpdated,
                        &execution_id,
                        serde_json::to_value(&stats).unwrap_or(Value::Null),
                    ))
                    .await;
            }
        })
    }

    async fn publish(&self, event_type: EventType, execution_id: &str, data: Value) {
        self.events
            .publish(ExecutionEvent::new(event_type, execution_id, data))
            .await;
    }
}

fn auto_navigate_spec() -> NodeSpec {
    NodeSpec {
        id: "auto_navigate".to_string(),
        node_type: "navigate".to_string(),
        name: "Auto navigation".to_string(),
        params: Value::Object(serde_json::Map::new()),
        dependencies: Vec::new(),
        output_key: None,
        optional: false,
        retry: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::AppConfig;
    use crate::recovery::RecoverySystem;
    use crate::storage::{
        MemoryExecutionRepo, MemoryExtractedItemRepo, MemoryNodeExecutionRepo, MemoryUrlQueue,
    };
    use crate::workflow::types::ResponseInfo;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    /// Browser serving canned pages, with optional scripted failures:
    /// the first N navigations to a URL return the scripted status.
    struct ScriptedBrowser {
        pages: StdHashMap<String, String>,
        fail_first: Arc<Mutex<StdHashMap<String, (u16, u32)>>>,
        current: Option<(u16, String)>,
    }

    impl ScriptedBrowser {
        fn new(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(u, b)| (u.to_string(), b.to_string()))
                    .collect(),
                fail_first: Arc::new(Mutex::new(StdHashMap::new())),
                current: None,
            }
        }

        fn fail_first(mut self, url: &str, status: u16, times: u32) -> Self {
            self.fail_first
                .lock()
                .unwrap()
                .insert(url.to_string(), (status, times));
            self
        }
    }

    #[async_trait]
    impl BrowserContext for ScriptedBrowser {
        async fn navigate(&mut self, url: &str) -> Result<(), WorkflowError> {
            let mut failures = self.fail_first.lock().unwrap();
            if let Some((status, remaining)) = failures.get_mut(url) {
                if *remaining > 0 {
                    *remaining -= 1;
                    self.current = Some((*status, String::new()));
                    return Ok(());
                }
            }
            drop(failures);
            let body = self.pages.get(url).cloned().unwrap_or_default();
            self.current = Some((200, body));
            Ok(())
        }

        fn check_http_status(&self) -> Result<(), WorkflowError> {
            match self.current.as_ref().map(|(s, _)| *s) {
                Some(status) => match crate::browser::status_error(status) {
                    Some(err) => Err(err),
                    None => Ok(()),
                },
                None => Err(WorkflowError::Browser("no navigation yet".to_string())),
            }
        }

        fn response_status(&self) -> Option<u16> {
            self.current.as_ref().map(|(s, _)| *s)
        }

        fn response_body(&self) -> &str {
            self.current.as_ref().map(|(_, b)| b.as_str()).unwrap_or("")
        }

        fn response_info(&self) -> ResponseInfo {
            ResponseInfo {
                status_code: self.response_status(),
                headers: Default::default(),
                body: self.response_body().to_string(),
            }
        }

        async fn rotate_fingerprint(&mut self) -> Result<(), WorkflowError> {
            Ok(())
        }

        async fn clear_cookies(&mut self) -> Result<(), WorkflowError> {
            Ok(())
        }
    }

    const LISTING: &str = r#"
<html><body>
  <a class="product" href="/p/1">P1</a>
  <a class="product" href="/p/2">P2</a>
  <a class="product" href="/p/3">P3</a>
  <a class="product" href="/p/4">P4</a>
  <a class="product" href="/p/5">P5</a>
</body></html>
"#;

    const DETAIL: &str = r#"
<html><body>
  <h1>Widget</h1>
  <span class="price">$9.99</span>
</body></html>
"#;

    fn two_phase_workflow() -> Workflow {
        serde_yaml::from_str(
            r#"
id: shop
name: Shop crawl
start_urls:
  - https://shop.test/catalog
phases:
  - id: listing
    name: Listing
    url_filter:
      depth: 0
    nodes:
      - id: nav
        type: navigate
      - id: links
        type: extract
        dependencies: [nav]
        params:
          links:
            selector: a.product
            marker: product
  - id: detail
    name: Detail
    url_filter:
      markers: [product]
    nodes:
      - id: nav
        type: navigate
      - id: fields
        type: extract
        dependencies: [nav]
        params:
          fields:
            title: h1
            price: span.price
      - id: clean
        type: transform
        dependencies: [fields]
        params:
          operations:
            - { field: price, op: parse_number }
"#,
        )
        .unwrap()
    }

    struct Harness {
        executor: WorkflowExecutor,
        queue: Arc<MemoryUrlQueue>,
        node_repo: Arc<MemoryNodeExecutionRepo>,
        item_repo: Arc<MemoryExtractedItemRepo>,
        execution_repo: Arc<MemoryExecutionRepo>,
        events: EventBroadcaster,
    }

    fn harness(workflow: Workflow, browser: ScriptedBrowser) -> Harness {
        let config = AppConfig::default();
        let queue = Arc::new(MemoryUrlQueue::new(config.queue.max_url_retries));
        let node_repo = Arc::new(MemoryNodeExecutionRepo::default());
        let item_repo = Arc::new(MemoryExtractedItemRepo::default());
        let execution_repo = Arc::new(MemoryExecutionRepo::default());
        let pool = Arc::new(BrowserPool::new(vec![Box::new(browser)]));
        let recovery = Arc::new(RecoverySystem::new(config.recovery, None, 1));
        let events = EventBroadcaster::new(1024);

        let executor = WorkflowExecutor::new(
            workflow,
            NodeRegistry::builtin(),
            queue.clone(),
            node_repo.clone(),
            item_repo.clone(),
            execution_repo.clone(),
            pool,
            recovery,
            events.clone(),
            config.executor,
        );
        Harness {
            executor,
            queue,
            node_repo,
            item_repo,
            execution_repo,
            events,
        }
    }

    fn cancel_token() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_phase_crawl_end_to_end() {
        let browser = ScriptedBrowser::new(&[
            ("https://shop.test/catalog", LISTING),
            ("https://shop.test/p/1", DETAIL),
            ("https://shop.test/p/2", DETAIL),
            ("https://shop.test/p/3", DETAIL),
            ("https://shop.test/p/4", DETAIL),
            ("https://shop.test/p/5", DETAIL),
        ]);
        let h = harness(two_phase_workflow(), browser);
        let (_tx, cancel) = cancel_token();

        let (_sub, mut rx) = h.events.subscribe().await.unwrap();
        let stats = h.executor.run("exec-1", cancel).await.unwrap();

        assert_eq!(stats.urls_discovered, 6, "start URL plus 5 product links");
        assert_eq!(stats.urls_processed, 6);
        assert_eq!(stats.urls_failed, 0);
        assert_eq!(stats.items_extracted, 5);
        assert_eq!(stats.nodes_executed, 2 + 5 * 3);
        assert_eq!(stats.nodes_failed, 0);

        assert_eq!(h.item_repo.count("exec-1").await.unwrap(), 5);
        let items = h.item_repo.all("exec-1").await;
        assert!(items.iter().all(|i| i.phase_id == "detail"));
        assert!(items.iter().all(|i| i.data["price"] == json!(9.99)));

        assert_eq!(
            h.execution_repo.status("exec-1").await,
            Some(ExecutionStatus::Completed)
        );
        assert_eq!(h.queue.pending_count("exec-1").await.unwrap(), 0);

        // Let the broadcaster's dispatch task drain before reading events
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Discovered URLs carry the marker and the discovering node's
        // execution id
        let mut discovered_events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.event_type == EventType::UrlDiscovered && event.data["depth"] == json!(1) {
                discovered_events.push(event);
            }
        }
        assert_eq!(discovered_events.len(), 5);
        for event in &discovered_events {
            assert_eq!(event.data["marker"], json!("product"));
            assert!(event.data["parent_node_execution_id"].is_string());
            let parent_id = event.data["parent_node_execution_id"].as_str().unwrap();
            let record = h.node_repo.get(parent_id).await.unwrap().unwrap();
            assert_eq!(record.node_id, "links");
            assert_eq!(record.urls_discovered, 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_recovery_retries_node_once() {
        // First navigation to the catalog is rate limited; recovery matches
        // the 429 rule, waits, and the single retry succeeds
        let browser = ScriptedBrowser::new(&[("https://shop.test/catalog", LISTING)])
            .fail_first("https://shop.test/catalog", 429, 1);
        let workflow: Workflow = serde_yaml::from_str(
            r#"
id: shop
name: Shop crawl
start_urls:
  - https://shop.test/catalog
phases:
  - id: listing
    name: Listing
    nodes:
      - id: nav
        type: navigate
"#,
        )
        .unwrap();
        let h = harness(workflow, browser);
        let (_tx, cancel) = cancel_token();

        let stats = h.executor.run("exec-1", cancel).await.unwrap();
        assert_eq!(stats.urls_processed, 1);
        assert_eq!(stats.urls_failed, 0);
        assert_eq!(stats.nodes_executed, 1);
        assert_eq!(stats.nodes_failed, 0);
        assert_eq!(
            h.execution_repo.status("exec-1").await,
            Some(ExecutionStatus::Completed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_error_is_terminal_without_looping() {
        // 404 matches no recovery rule and AI is disabled: the failure is
        // terminal and non-retryable, and the loop exits
        let browser = ScriptedBrowser::new(&[]).fail_first("https://shop.test/gone", 404, u32::MAX);
        let workflow: Workflow = serde_yaml::from_str(
            r#"
id: shop
name: Shop crawl
start_urls:
  - https://shop.test/gone
phases:
  - id: only
    name: Only
    nodes:
      - id: nav
        type: navigate
"#,
        )
        .unwrap();
        let h = harness(workflow, browser);
        let (_tx, cancel) = cancel_token();

        let stats = h.executor.run("exec-1", cancel).await.unwrap();
        assert_eq!(stats.urls_processed, 0);
        assert_eq!(stats.urls_failed, 1);
        assert_eq!(stats.nodes_failed, 1);
        assert_eq!(
            h.execution_repo.status("exec-1").await,
            Some(ExecutionStatus::Failed)
        );
        assert_eq!(h.queue.pending_count("exec-1").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_navigate_when_phase_lacks_navigate_node() {
        let browser = ScriptedBrowser::new(&[("https://shop.test/page", DETAIL)]);
        let workflow: Workflow = serde_yaml::from_str(
            r#"
id: shop
name: Shop crawl
start_urls:
  - https://shop.test/page
phases:
  - id: only
    name: Only
    nodes:
      - id: fields
        type: extract
        params:
          fields:
            title: h1
"#,
        )
        .unwrap();
        let h = harness(workflow, browser);
        let (_tx, cancel) = cancel_token();

        let stats = h.executor.run("exec-1", cancel).await.unwrap();
        assert_eq!(stats.urls_processed, 1);
        // auto_navigate plus the declared extract node
        assert_eq!(stats.nodes_executed, 2);
        let items = h.item_repo.all("exec-1").await;
        assert_eq!(items[0].data["title"], json!("Widget"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optional_node_failure_continues_phase() {
        let browser = ScriptedBrowser::new(&[("https://shop.test/page", DETAIL)]);
        let workflow: Workflow = serde_yaml::from_str(
            r#"
id: shop
name: Shop crawl
start_urls:
  - https://shop.test/page
phases:
  - id: only
    name: Only
    nodes:
      - id: nav
        type: navigate
      - id: broken
        type: extract
        optional: true
        dependencies: [nav]
        params:
          fields: {}
          links: { selector: a.next }
      - id: fields
        type: extract
        dependencies: [nav]
        params:
          fields:
            title: h1
"#,
        )
        .unwrap();
        let h = harness(workflow, browser);
        let (_tx, cancel) = cancel_token();

        let stats = h.executor.run("exec-1", cancel).await.unwrap();
        assert_eq!(stats.urls_processed, 1);
        assert_eq!(stats.urls_failed, 0);
        assert_eq!(h.item_repo.count("exec-1").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_the_loop() {
        let browser = ScriptedBrowser::new(&[("https://shop.test/catalog", LISTING)]);
        let h = harness(two_phase_workflow(), browser);
        let (tx, cancel) = cancel_token();
        tx.send(true).unwrap();

        match h.executor.run("exec-1", cancel).await {
            Err(WorkflowError::Canceled) => {}
            other => panic!("expected cancellation, got {:?}", other),
        }
        assert_eq!(
            h.execution_repo.status("exec-1").await,
            Some(ExecutionStatus::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_fails_before_any_url_is_touched() {
        let browser = ScriptedBrowser::new(&[]);
        let workflow: Workflow = serde_yaml::from_str(
            r#"
id: shop
name: Shop crawl
start_urls:
  - https://shop.test/catalog
phases:
  - id: only
    name: Only
    nodes:
      - id: a
        type: navigate
        dependencies: [b]
      - id: b
        type: transform
        dependencies: [a]
        params:
          operations: []
"#,
        )
        .unwrap();
        let h = harness(workflow, browser);
        let (_tx, cancel) = cancel_token();

        assert!(matches!(
            h.executor.run("exec-1", cancel).await,
            Err(WorkflowError::CycleDetected(_))
        ));
        assert_eq!(h.queue.pending_count("exec-1").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_phase_transition_reroutes_discovered_urls() {
        let browser = ScriptedBrowser::new(&[
            ("https://shop.test/catalog", LISTING),
            ("https://shop.test/p/1", DETAIL),
            ("https://shop.test/p/2", DETAIL),
            ("https://shop.test/p/3", DETAIL),
            ("https://shop.test/p/4", DETAIL),
            ("https://shop.test/p/5", DETAIL),
        ]);
        // No markers anywhere: routing relies entirely on the transition
        let workflow: Workflow = serde_yaml::from_str(
            r#"
id: shop
name: Shop crawl
start_urls:
  - https://shop.test/catalog
phases:
  - id: listing
    name: Listing
    url_filter:
      depth: 0
    transition:
      condition: always
      next_phase: detail
    nodes:
      - id: nav
        type: navigate
      - id: links
        type: extract
        dependencies: [nav]
        params:
          links:
            selector: a.product
  - id: detail
    name: Detail
    nodes:
      - id: nav
        type: navigate
      - id: fields
        type: extract
        dependencies: [nav]
        params:
          fields:
            title: h1
"#,
        )
        .unwrap();
        let h = harness(workflow, browser);
        let (_tx, cancel) = cancel_token();

        let stats = h.executor.run("exec-1", cancel).await.unwrap();
        assert_eq!(stats.urls_processed, 6);
        // Every product page went through the detail phase
        let items = h.item_repo.all("exec-1").await;
        assert_eq!(items.len(), 5);
        assert!(items.iter().all(|i| i.phase_id == "detail"));
    }
}
