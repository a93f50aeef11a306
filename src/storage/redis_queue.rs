use redis::{aio::MultiplexedConnection, Client};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::storage::UrlQueue;
use crate::workflow::types::{UrlQueueItem, UrlStatus};

use async_trait::async_trait;

fn queue_err<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> WorkflowError + '_ {
    move |e| WorkflowError::Queue(format!("{}: {}", context, e))
}

/// Redis-backed URL queue for distributed workers.
///
/// Layout per execution: a sorted set of pending item ids (score encodes
/// priority then arrival order), a set of in-flight ids, and one JSON
/// value per item. Everything carries a TTL so abandoned executions age
/// out on their own.
pub struct RedisUrlQueue {
    conn: Arc<Mutex<MultiplexedConnection>>,
    task_ttl: u64,
    max_retries: u32,
}

impl RedisUrlQueue {
    /// Connect to Redis.
    pub async fn new(redis_url: &str, task_ttl: u64, max_retries: u32) -> Result<Self, WorkflowError> {
        let client = Client::open(redis_url)
            .map_err(queue_err(&format!("failed to open Redis at {}", redis_url)))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(queue_err("failed to get Redis connection"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            task_ttl,
            max_retries,
        })
    }

    fn pending_key(execution_id: &str) -> String {
        format!("crawlflow:pending:{}", execution_id)
    }

    fn processing_key(execution_id: &str) -> String {
        format!("crawlflow:processing:{}", execution_id)
    }

    fn item_key(id: &str) -> String {
        format!("crawlflow:item:{}", id)
    }

    fn seq_key(execution_id: &str) -> String {
        format!("crawlflow:seq:{}", execution_id)
    }

    /// Lower score dequeues first: higher priority wins, arrival order
    /// breaks ties.
    fn score(priority: i32, seq: i64) -> f64 {
        (-(priority as i64) as f64) * 1e12 + seq as f64
    }

    async fn touch_ttl(
        &self,
        conn: &mut MultiplexedConnection,
        key: &str,
    ) -> Result<(), WorkflowError> {
        let ttl: i64 = redis::cmd("TTL")
            .arg(key)
            .query_async(conn)
            .await
            .unwrap_or(-1);
        if ttl == -1 {
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(self.task_ttl)
                .query_async::<_, ()>(conn)
                .await
                .map_err(queue_err("failed to set TTL"))?;
        }
        Ok(())
    }

    async fn store_item(
        &self,
        conn: &mut MultiplexedConnection,
        item: &UrlQueueItem,
    ) -> Result<(), WorkflowError> {
        let json = serde_json::to_string(item).map_err(queue_err("failed to serialize item"))?;
        redis::cmd("SET")
            .arg(Self::item_key(&item.id))
            .arg(json)
            .arg("EX")
            .arg(self.task_ttl)
            .query_async::<_, ()>(conn)
            .await
            .map_err(queue_err("failed to store item"))?;
        Ok(())
    }

    async fn load_item(
        &self,
        conn: &mut MultiplexedConnection,
        id: &str,
    ) -> Result<Option<UrlQueueItem>, WorkflowError> {
        let json: Option<String> = redis::cmd("GET")
            .arg(Self::item_key(id))
            .query_async(conn)
            .await
            .map_err(queue_err("failed to load item"))?;
        match json {
            Some(json) => {
                let item =
                    serde_json::from_str(&json).map_err(queue_err("failed to deserialize item"))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }

    async fn push_pending(
        &self,
        conn: &mut MultiplexedConnection,
        item: &UrlQueueItem,
    ) -> Result<(), WorkflowError> {
        let seq: i64 = redis::cmd("INCR")
            .arg(Self::seq_key(&item.execution_id))
            .query_async(conn)
            .await
            .map_err(queue_err("failed to increment sequence"))?;
        let pending_key = Self::pending_key(&item.execution_id);
        redis::cmd("ZADD")
            .arg(&pending_key)
            .arg(Self::score(item.priority, seq))
            .arg(&item.id)
            .query_async::<_, ()>(conn)
            .await
            .map_err(queue_err("failed to push item to pending set"))?;
        self.touch_ttl(conn, &pending_key).await?;
        self.touch_ttl(conn, &Self::seq_key(&item.execution_id))
            .await?;
        Ok(())
    }

    /// Remove an item id from every processing set it could be in. The
    /// execution id is recoverable from the stored item, so look it up.
    async fn remove_processing(
        &self,
        conn: &mut MultiplexedConnection,
        item: &UrlQueueItem,
    ) -> Result<(), WorkflowError> {
        redis::cmd("SREM")
            .arg(Self::processing_key(&item.execution_id))
            .arg(&item.id)
            .query_async::<_, ()>(conn)
            .await
            .map_err(queue_err("failed to remove item from processing set"))?;
        Ok(())
    }
}

#[async_trait]
impl UrlQueue for RedisUrlQueue {
    async fn enqueue(&self, mut item: UrlQueueItem) -> Result<(), WorkflowError> {
        item.status = UrlStatus::Pending;
        let mut conn = self.conn.lock().await;
        self.store_item(&mut conn, &item).await?;
        self.push_pending(&mut conn, &item).await?;
        debug!(url = %item.url, "enqueued item");
        Ok(())
    }

    async fn dequeue(&self, execution_id: &str) -> Result<Option<UrlQueueItem>, WorkflowError> {
        let mut conn = self.conn.lock().await;

        // Atomically pop the lowest-score (highest priority) pending id
        let popped: Vec<String> = redis::cmd("ZPOPMIN")
            .arg(Self::pending_key(execution_id))
            .arg(1)
            .query_async(&mut *conn)
            .await
            .map_err(queue_err("failed to pop pending item"))?;

        let id = match popped.first() {
            Some(id) => id.clone(),
            None => return Ok(None),
        };

        let mut item = match self.load_item(&mut conn, &id).await? {
            Some(item) => item,
            // Item value expired under us; treat as drained
            None => return Ok(None),
        };

        let processing_key = Self::processing_key(execution_id);
        redis::cmd("SADD")
            .arg(&processing_key)
            .arg(&id)
            .query_async::<_, ()>(&mut *conn)
            .await
            .map_err(queue_err("failed to add item to processing set"))?;
        self.touch_ttl(&mut conn, &processing_key).await?;

        item.status = UrlStatus::Processing;
        self.store_item(&mut conn, &item).await?;
        debug!(url = %item.url, "dequeued item");
        Ok(Some(item))
    }

    async fn mark_completed(&self, id: &str) -> Result<(), WorkflowError> {
        let mut conn = self.conn.lock().await;
        let mut item = match self.load_item(&mut conn, id).await? {
            Some(item) => item,
            None => return Ok(()),
        };
        self.remove_processing(&mut conn, &item).await?;
        item.status = UrlStatus::Completed;
        self.store_item(&mut conn, &item).await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        reason: &str,
        retryable: bool,
    ) -> Result<(), WorkflowError> {
        let mut conn = self.conn.lock().await;
        let mut item = match self.load_item(&mut conn, id).await? {
            Some(item) => item,
            None => return Ok(()),
        };
        self.remove_processing(&mut conn, &item).await?;
        item.status = UrlStatus::Failed;
        self.store_item(&mut conn, &item).await?;

        if retryable && item.retry_count < self.max_retries {
            let mut copy = item.clone();
            copy.id = Uuid::new_v4().to_string();
            copy.retry_count += 1;
            copy.status = UrlStatus::Pending;
            debug!(url = %copy.url, retry = copy.retry_count, reason, "re-enqueueing failed item");
            self.store_item(&mut conn, &copy).await?;
            self.push_pending(&mut conn, &copy).await?;
        } else {
            debug!(id, reason, "item failed terminally");
        }
        Ok(())
    }

    async fn pending_count(&self, execution_id: &str) -> Result<usize, WorkflowError> {
        let mut conn = self.conn.lock().await;
        let pending: usize = redis::cmd("ZCARD")
            .arg(Self::pending_key(execution_id))
            .query_async(&mut *conn)
            .await
            .map_err(queue_err("failed to get pending count"))?;
        let processing: usize = redis::cmd("SCARD")
            .arg(Self::processing_key(execution_id))
            .query_async(&mut *conn)
            .await
            .map_err(queue_err("failed to get processing count"))?;
        Ok(pending + processing)
    }

    async fn update_phase_id(&self, id: &str, phase_id: &str) -> Result<(), WorkflowError> {
        let mut conn = self.conn.lock().await;
        let mut item = self
            .load_item(&mut conn, id)
            .await?
            .ok_or_else(|| WorkflowError::Queue(format!("unknown item id {}", id)))?;
        item.phase_id = Some(phase_id.to_string());
        self.store_item(&mut conn, &item).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_orders_priority_then_arrival() {
        // Higher priority always scores lower (dequeues first)
        assert!(RedisUrlQueue::score(5, 100) < RedisUrlQueue::score(0, 1));
        // Same priority: earlier arrival scores lower
        assert!(RedisUrlQueue::score(0, 1) < RedisUrlQueue::score(0, 2));
    }

    #[test]
    fn test_key_layout_is_namespaced() {
        assert_eq!(RedisUrlQueue::pending_key("e1"), "crawlflow:pending:e1");
        assert_eq!(
            RedisUrlQueue::processing_key("e1"),
            "crawlflow:processing:e1"
        );
        assert_eq!(RedisUrlQueue::item_key("abc"), "crawlflow:item:abc");
    }
}
