pub mod memory;
pub mod redis_queue;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::WorkflowError;
use crate::workflow::types::{
    ExecutionStats, ExecutionStatus, ExtractedItem, NodeExecution, UrlQueueItem,
};

// Re-export common types
pub use memory::{
    MemoryExecutionRepo, MemoryExtractedItemRepo, MemoryNodeExecutionRepo, MemoryUrlQueue,
};
pub use redis_queue::RedisUrlQueue;

/// Aggregate node-execution counters for one execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeExecutionStats {
    pub executed: u64,
    pub failed: u64,
}

/// Shared URL queue contract.
///
/// Items reach exactly one terminal state per dequeue; a retryable failure
/// re-enqueues a fresh pending copy with an incremented `retry_count`
/// instead of mutating the in-flight attempt.
#[async_trait]
pub trait UrlQueue: Send + Sync {
    async fn enqueue(&self, item: UrlQueueItem) -> Result<(), WorkflowError>;

    async fn enqueue_batch(&self, items: Vec<UrlQueueItem>) -> Result<(), WorkflowError> {
        for item in items {
            self.enqueue(item).await?;
        }
        Ok(())
    }

    /// Pop the next pending item for an execution, moving it to
    /// `Processing`. `None` does not mean the execution is finished:
    /// callers must re-check `pending_count` to cover in-flight requeues.
    async fn dequeue(&self, execution_id: &str) -> Result<Option<UrlQueueItem>, WorkflowError>;

    async fn mark_completed(&self, id: &str) -> Result<(), WorkflowError>;

    /// Mark an item failed. When `retryable` is set and the item has retry
    /// budget left, a fresh pending copy is enqueued.
    async fn mark_failed(
        &self,
        id: &str,
        reason: &str,
        retryable: bool,
    ) -> Result<(), WorkflowError>;

    /// Pending plus in-flight items for an execution.
    async fn pending_count(&self, execution_id: &str) -> Result<usize, WorkflowError>;

    /// Re-route an item to a different phase (phase transitions).
    async fn update_phase_id(&self, id: &str, phase_id: &str) -> Result<(), WorkflowError>;
}

/// Repository of node execution records.
#[async_trait]
pub trait NodeExecutionRepo: Send + Sync {
    async fn create(&self, exec: NodeExecution) -> Result<(), WorkflowError>;

    async fn mark_completed(
        &self,
        id: &str,
        output: Value,
        urls_discovered: u64,
    ) -> Result<(), WorkflowError>;

    async fn mark_failed(&self, id: &str, error: &str) -> Result<(), WorkflowError>;

    async fn get(&self, id: &str) -> Result<Option<NodeExecution>, WorkflowError>;

    async fn stats_by_execution(
        &self,
        execution_id: &str,
    ) -> Result<NodeExecutionStats, WorkflowError>;
}

/// Repository of extracted items.
#[async_trait]
pub trait ExtractedItemRepo: Send + Sync {
    /// Persist an item and return its id.
    async fn create(&self, item: ExtractedItem) -> Result<String, WorkflowError>;

    async fn count(&self, execution_id: &str) -> Result<u64, WorkflowError>;
}

/// Repository of execution-level state.
#[async_trait]
pub trait ExecutionRepo: Send + Sync {
    async fn update_stats(
        &self,
        execution_id: &str,
        stats: &ExecutionStats,
    ) -> Result<(), WorkflowError>;

    async fn update_status(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
    ) -> Result<(), WorkflowError>;
}
