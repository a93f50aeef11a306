use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// Event types observed at the execution boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ExecutionStarted,
    UrlDiscovered,
    PhaseStarted,
    PhaseCompleted,
    PhaseFailed,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    StatsUpdated,
    ItemExtracted,
    ExecutionCompleted,
    ExecutionFailed,
}

/// One event on the execution stream, suitable for SSE/WebSocket delivery.
///
/// Node-scoped events carry `node_execution_id` and
/// `parent_node_execution_id` inside `data` so consumers can reconstruct
/// the execution tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl ExecutionEvent {
    pub fn new(event_type: EventType, execution_id: &str, data: Value) -> Self {
        Self {
            event_type,
            execution_id: execution_id.to_string(),
            timestamp: Utc::now(),
            data,
        }
    }
}

enum BusCommand {
    Subscribe {
        reply: oneshot::Sender<(Uuid, mpsc::Receiver<ExecutionEvent>)>,
    },
    Unsubscribe(Uuid),
    Publish(ExecutionEvent),
}

/// Handle to the event broadcaster.
///
/// A single dispatch task owns subscriber registration and fan-out. Each
/// subscriber gets a bounded queue; publishing uses `try_send` so a slow or
/// blocked subscriber drops events instead of stalling the publisher.
#[derive(Clone)]
pub struct EventBroadcaster {
    commands: mpsc::Sender<BusCommand>,
}

impl EventBroadcaster {
    /// Spawn the dispatch task. `subscriber_capacity` bounds each
    /// subscriber's queue.
    pub fn new(subscriber_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(dispatch_loop(rx, subscriber_capacity.max(1)));
        Self { commands: tx }
    }

    /// Register a new subscriber and return its event stream.
    pub async fn subscribe(&self) -> Option<(Uuid, mpsc::Receiver<ExecutionEvent>)> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(BusCommand::Subscribe { reply })
            .await
            .ok()?;
        response.await.ok()
    }

    /// Remove a subscriber. Events published afterwards are no longer
    /// delivered to it.
    pub async fn unsubscribe(&self, id: Uuid) {
        let _ = self.commands.send(BusCommand::Unsubscribe(id)).await;
    }

    /// Publish an event to all current subscribers.
    pub async fn publish(&self, event: ExecutionEvent) {
        if self.commands.send(BusCommand::Publish(event)).await.is_err() {
            warn!("event dispatch task is gone, dropping event");
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::Receiver<BusCommand>, capacity: usize) {
    let mut subscribers: Vec<(Uuid, mpsc::Sender<ExecutionEvent>)> = Vec::new();

    while let Some(command) = rx.recv().await {
        match command {
            BusCommand::Subscribe { reply } => {
                let id = Uuid::new_v4();
                let (tx, event_rx) = mpsc::channel(capacity);
                if reply.send((id, event_rx)).is_ok() {
                    subscribers.push((id, tx));
                    debug!("subscriber {} registered", id);
                }
            }
            BusCommand::Unsubscribe(id) => {
                subscribers.retain(|(sub_id, _)| *sub_id != id);
                debug!("subscriber {} removed", id);
            }
            BusCommand::Publish(event) => {
                subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // Slow subscriber: drop this event for it, keep it
                        // registered
                        debug!("subscriber {} queue full, dropping event", id);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_subscribers_receive_in_publish_order() {
        let bus = EventBroadcaster::new(16);
        let (_id, mut rx) = bus.subscribe().await.unwrap();

        for i in 0..3 {
            bus.publish(ExecutionEvent::new(
                EventType::NodeCompleted,
                "exec-1",
                json!({ "seq": i }),
            ))
            .await;
        }

        for i in 0..3 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.data["seq"], i);
            assert_eq!(event.execution_id, "exec-1");
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_publish() {
        let bus = EventBroadcaster::new(1);
        let (_slow_id, mut slow_rx) = bus.subscribe().await.unwrap();
        let (_fast_id, mut fast_rx) = bus.subscribe().await.unwrap();

        // Capacity 1: the second and third events are dropped for the slow
        // subscriber, which never reads. Publishing must not block.
        for i in 0..3 {
            bus.publish(ExecutionEvent::new(
                EventType::StatsUpdated,
                "exec-1",
                json!({ "seq": i }),
            ))
            .await;
        }

        // The fast subscriber drains after each publish has been dispatched
        let first = fast_rx.recv().await.unwrap();
        assert_eq!(first.data["seq"], 0);

        // Slow subscriber only ever got the first event
        let got = slow_rx.recv().await.unwrap();
        assert_eq!(got.data["seq"], 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = EventBroadcaster::new(16);
        let (id, mut rx) = bus.subscribe().await.unwrap();
        bus.unsubscribe(id).await;

        bus.publish(ExecutionEvent::new(
            EventType::ExecutionCompleted,
            "exec-1",
            json!({}),
        ))
        .await;

        // Channel closes once the dispatch task drops the sender
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_event_type_serializes_snake_case() {
        let event = ExecutionEvent::new(EventType::NodeStarted, "exec-1", json!({}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "node_started");
    }
}
