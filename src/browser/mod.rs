pub mod http;
pub mod pool;
pub mod webdriver;

use async_trait::async_trait;

use crate::error::WorkflowError;
use crate::workflow::types::ResponseInfo;

pub use http::HttpBrowser;
pub use pool::BrowserPool;
pub use webdriver::WebDriverBrowser;

/// Browser collaborator contract consumed by the executor and the
/// navigate node. The workflow core treats the browser as opaque: it can
/// navigate and report status/body/headers, nothing more.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    /// Navigate to a URL and capture a response snapshot.
    async fn navigate(&mut self, url: &str) -> Result<(), WorkflowError>;

    /// Check the last navigation's HTTP status; ≥400 is an error (429 is
    /// labeled "rate limit exceeded" so recovery rules can key off it).
    fn check_http_status(&self) -> Result<(), WorkflowError>;

    /// Status code of the last navigation, if one happened.
    fn response_status(&self) -> Option<u16>;

    /// Body snapshot of the last navigation.
    fn response_body(&self) -> &str;

    /// Full response snapshot for recovery condition evaluation.
    fn response_info(&self) -> ResponseInfo;

    /// Switch to a different browser identity. Recovery action hook.
    async fn rotate_fingerprint(&mut self) -> Result<(), WorkflowError>;

    /// Drop all cookies/session state. Recovery action hook.
    async fn clear_cookies(&mut self) -> Result<(), WorkflowError>;
}

/// Map an HTTP status to the error the recovery system consumes.
/// Returns `None` for non-error statuses.
pub fn status_error(status: u16) -> Option<WorkflowError> {
    if status < 400 {
        return None;
    }
    let message = match status {
        429 => "rate limit exceeded".to_string(),
        403 => "access forbidden".to_string(),
        404 => "not found".to_string(),
        s if s >= 500 => format!("server error {}", s),
        s => format!("client error {}", s),
    };
    Some(WorkflowError::HttpStatus { status, message })
}
