use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::storage::{
    ExecutionRepo, ExtractedItemRepo, NodeExecutionRepo, NodeExecutionStats, UrlQueue,
};
use crate::workflow::types::{
    ExecutionStats, ExecutionStatus, ExtractedItem, NodeExecution, NodeExecutionStatus,
    UrlQueueItem, UrlStatus,
};

struct QueueState {
    /// Pending (priority, item id) per execution, kept in
    /// priority-then-FIFO order
    pending: HashMap<String, VecDeque<(i32, String)>>,
    /// In-flight item ids per execution
    processing: HashMap<String, Vec<String>>,
    /// All items ever enqueued, by id. Items are never deleted mid-execution
    items: HashMap<String, UrlQueueItem>,
}

fn insert_by_priority(queue: &mut VecDeque<(i32, String)>, priority: i32, id: String) {
    let pos = queue
        .iter()
        .position(|(existing, _)| *existing < priority)
        .unwrap_or(queue.len());
    queue.insert(pos, (priority, id));
}

/// In-process URL queue used by tests and standalone runs.
pub struct MemoryUrlQueue {
    state: Arc<Mutex<QueueState>>,
    max_retries: u32,
}

impl MemoryUrlQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                pending: HashMap::new(),
                processing: HashMap::new(),
                items: HashMap::new(),
            })),
            max_retries,
        }
    }

    /// Snapshot of one item, for tests and the CLI status command.
    pub async fn get(&self, id: &str) -> Option<UrlQueueItem> {
        self.state.lock().await.items.get(id).cloned()
    }
}

impl Default for MemoryUrlQueue {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl UrlQueue for MemoryUrlQueue {
    async fn enqueue(&self, mut item: UrlQueueItem) -> Result<(), WorkflowError> {
        let mut state = self.state.lock().await;
        item.status = UrlStatus::Pending;
        let execution_id = item.execution_id.clone();
        let id = item.id.clone();
        let priority = item.priority;
        state.items.insert(id.clone(), item);
        let queue = state.pending.entry(execution_id).or_default();
        insert_by_priority(queue, priority, id);
        Ok(())
    }

    async fn dequeue(&self, execution_id: &str) -> Result<Option<UrlQueueItem>, WorkflowError> {
        let mut state = self.state.lock().await;
        let id = match state
            .pending
            .get_mut(execution_id)
            .and_then(|q| q.pop_front())
        {
            Some((_, id)) => id,
            None => return Ok(None),
        };
        state
            .processing
            .entry(execution_id.to_string())
            .or_default()
            .push(id.clone());
        let item = state.items.get_mut(&id).ok_or_else(|| {
            WorkflowError::Queue(format!("dequeued unknown item id {}", id))
        })?;
        item.status = UrlStatus::Processing;
        debug!(url = %item.url, "dequeued item");
        Ok(Some(item.clone()))
    }

    async fn mark_completed(&self, id: &str) -> Result<(), WorkflowError> {
        let mut state = self.state.lock().await;
        for ids in state.processing.values_mut() {
            ids.retain(|existing| existing != id);
        }
        if let Some(item) = state.items.get_mut(id) {
            item.status = UrlStatus::Completed;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        reason: &str,
        retryable: bool,
    ) -> Result<(), WorkflowError> {
        let mut state = self.state.lock().await;
        for ids in state.processing.values_mut() {
            ids.retain(|existing| existing != id);
        }
        let retry = match state.items.get_mut(id) {
            Some(item) => {
                item.status = UrlStatus::Failed;
                if retryable && item.retry_count < self.max_retries {
                    // Retries produce a new dequeue, never mutate the
                    // finished attempt
                    let mut copy = item.clone();
                    copy.id = Uuid::new_v4().to_string();
                    copy.retry_count += 1;
                    copy.status = UrlStatus::Pending;
                    Some(copy)
                } else {
                    None
                }
            }
            None => None,
        };
        if let Some(copy) = retry {
            debug!(url = %copy.url, retry = copy.retry_count, reason, "re-enqueueing failed item");
            let execution_id = copy.execution_id.clone();
            let copy_id = copy.id.clone();
            let priority = copy.priority;
            state.items.insert(copy_id.clone(), copy);
            let queue = state.pending.entry(execution_id).or_default();
            insert_by_priority(queue, priority, copy_id);
        } else {
            debug!(id, reason, "item failed terminally");
        }
        Ok(())
    }

    async fn pending_count(&self, execution_id: &str) -> Result<usize, WorkflowError> {
        let state = self.state.lock().await;
        let pending = state.pending.get(execution_id).map(|q| q.len()).unwrap_or(0);
        let processing = state
            .processing
            .get(execution_id)
            .map(|v| v.len())
            .unwrap_or(0);
        Ok(pending + processing)
    }

    async fn update_phase_id(&self, id: &str, phase_id: &str) -> Result<(), WorkflowError> {
        let mut state = self.state.lock().await;
        match state.items.get_mut(id) {
            Some(item) => {
                item.phase_id = Some(phase_id.to_string());
                Ok(())
            }
            None => Err(WorkflowError::Queue(format!("unknown item id {}", id))),
        }
    }
}

/// In-memory node execution repository.
#[derive(Default)]
pub struct MemoryNodeExecutionRepo {
    records: Mutex<HashMap<String, NodeExecution>>,
}

#[async_trait]
impl NodeExecutionRepo for MemoryNodeExecutionRepo {
    async fn create(&self, exec: NodeExecution) -> Result<(), WorkflowError> {
        self.records.lock().await.insert(exec.id.clone(), exec);
        Ok(())
    }

    async fn mark_completed(
        &self,
        id: &str,
        output: Value,
        urls_discovered: u64,
    ) -> Result<(), WorkflowError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| WorkflowError::Storage(format!("unknown node execution {}", id)))?;
        record.status = NodeExecutionStatus::Completed;
        record.completed_at = Some(chrono::Utc::now());
        record.output = output;
        record.urls_discovered = urls_discovered;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), WorkflowError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| WorkflowError::Storage(format!("unknown node execution {}", id)))?;
        record.status = NodeExecutionStatus::Failed;
        record.completed_at = Some(chrono::Utc::now());
        record.error = Some(error.to_string());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<NodeExecution>, WorkflowError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn stats_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<NodeExecutionStats, WorkflowError> {
        let records = self.records.lock().await;
        let mut stats = NodeExecutionStats::default();
        for record in records.values() {
            if record.execution_id != execution_id {
                continue;
            }
            match record.status {
                NodeExecutionStatus::Completed => stats.executed += 1,
                NodeExecutionStatus::Failed => {
                    stats.executed += 1;
                    stats.failed += 1;
                }
                NodeExecutionStatus::Running => {}
            }
        }
        Ok(stats)
    }
}

/// In-memory extracted item repository.
#[derive(Default)]
pub struct MemoryExtractedItemRepo {
    items: Mutex<Vec<ExtractedItem>>,
}

impl MemoryExtractedItemRepo {
    pub async fn all(&self, execution_id: &str) -> Vec<ExtractedItem> {
        self.items
            .lock()
            .await
            .iter()
            .filter(|i| i.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExtractedItemRepo for MemoryExtractedItemRepo {
    async fn create(&self, item: ExtractedItem) -> Result<String, WorkflowError> {
        let id = item.id.clone();
        self.items.lock().await.push(item);
        Ok(id)
    }

    async fn count(&self, execution_id: &str) -> Result<u64, WorkflowError> {
        Ok(self
            .items
            .lock()
            .await
            .iter()
            .filter(|i| i.execution_id == execution_id)
            .count() as u64)
    }
}

/// In-memory execution repository.
#[derive(Default)]
pub struct MemoryExecutionRepo {
    stats: Mutex<HashMap<String, ExecutionStats>>,
    status: Mutex<HashMap<String, ExecutionStatus>>,
}

impl MemoryExecutionRepo {
    pub async fn stats(&self, execution_id: &str) -> Option<ExecutionStats> {
        self.stats.lock().await.get(execution_id).cloned()
    }

    pub async fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.status.lock().await.get(execution_id).copied()
    }
}

#[async_trait]
impl ExecutionRepo for MemoryExecutionRepo {
    async fn update_stats(
        &self,
        execution_id: &str,
        stats: &ExecutionStats,
    ) -> Result<(), WorkflowError> {
        self.stats
            .lock()
            .await
            .insert(execution_id.to_string(), stats.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<(), WorkflowError> {
        self.status
            .lock()
            .await
            .insert(execution_id.to_string(), status);
        Ok(())
    }
}
