use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::browser::BrowserContext;
use crate::error::WorkflowError;

/// Bounded pool of browser contexts.
///
/// Acquire suspends the calling loop until a context is checked back in,
/// which is the back-pressure point between the executor and the browser
/// layer. Contexts are created up front so capacity never grows.
pub struct BrowserPool {
    checkout: Mutex<mpsc::Receiver<Box<dyn BrowserContext>>>,
    checkin: mpsc::Sender<Box<dyn BrowserContext>>,
    capacity: usize,
}

impl BrowserPool {
    /// Build a pool from pre-created contexts.
    pub fn new(contexts: Vec<Box<dyn BrowserContext>>) -> Self {
        let capacity = contexts.len().max(1);
        let (tx, rx) = mpsc::channel(capacity);
        for context in contexts {
            // Channel was sized to fit every context
            let _ = tx.try_send(context);
        }
        Self {
            checkout: Mutex::new(rx),
            checkin: tx,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Check a context out, waiting until one is free.
    pub async fn acquire(&self) -> Result<Box<dyn BrowserContext>, WorkflowError> {
        let mut rx = self.checkout.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| WorkflowError::Browser("browser pool is closed".to_string()))
    }

    /// Return a context to the pool.
    pub async fn release(&self, context: Box<dyn BrowserContext>) {
        if self.checkin.send(context).await.is_err() {
            debug!("browser pool dropped while releasing context");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::workflow::types::ResponseInfo;

    struct StubBrowser;

    #[async_trait]
    impl BrowserContext for StubBrowser {
        async fn navigate(&mut self, _url: &str) -> Result<(), WorkflowError> {
            Ok(())
        }
        fn check_http_status(&self) -> Result<(), WorkflowError> {
            Ok(())
        }
        fn response_status(&self) -> Option<u16> {
            Some(200)
        }
        fn response_body(&self) -> &str {
            ""
        }
        fn response_info(&self) -> ResponseInfo {
            ResponseInfo::default()
        }
        async fn rotate_fingerprint(&mut self) -> Result<(), WorkflowError> {
            Ok(())
        }
        async fn clear_cookies(&mut self) -> Result<(), WorkflowError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let pool = BrowserPool::new(vec![Box::new(StubBrowser)]);
        let ctx = pool.acquire().await.unwrap();
        pool.release(ctx).await;
        let ctx = pool.acquire().await.unwrap();
        pool.release(ctx).await;
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_release() {
        let pool = Arc::new(BrowserPool::new(vec![Box::new(StubBrowser)]));
        let held = pool.acquire().await.unwrap();

        let acquired = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let pool = pool.clone();
            let acquired = acquired.clone();
            tokio::spawn(async move {
                let ctx = pool.acquire().await.unwrap();
                acquired.store(1, Ordering::SeqCst);
                pool.release(ctx).await;
            })
        };

        // The waiter cannot make progress while the only context is out
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        pool.release(held).await;
        waiter.await.unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }
}
