use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thirtyfour::prelude::*;
use tracing::{debug, error};

use crate::browser::{status_error, BrowserContext};
use crate::cli::config::{BrowserSettings, Fingerprint};
use crate::error::WorkflowError;
use crate::workflow::types::ResponseInfo;

/// WebDriver-backed browser for sites that need JavaScript rendering.
///
/// The WebDriver protocol does not expose response metadata directly, so
/// the navigation status is read from the Navigation Timing API after the
/// page settles; headers are not available through this backend.
pub struct WebDriverBrowser {
    settings: BrowserSettings,
    driver: Option<WebDriver>,
    fingerprint_index: usize,
    last_status: Option<u16>,
    last_body: String,
}

impl WebDriverBrowser {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings,
            driver: None,
            fingerprint_index: 0,
            last_status: None,
            last_body: String::new(),
        }
    }

    async fn ensure_driver(&mut self) -> Result<&WebDriver, WorkflowError> {
        if self.driver.is_none() {
            let fingerprint = self
                .settings
                .fingerprints
                .get(self.fingerprint_index)
                .cloned()
                .ok_or_else(|| WorkflowError::Browser("no fingerprints configured".to_string()))?;
            let driver = self.connect(&fingerprint).await?;
            self.driver = Some(driver);
        }
        self.driver
            .as_ref()
            .ok_or_else(|| WorkflowError::Browser("webdriver session not initialized".to_string()))
    }

    async fn connect(&self, fingerprint: &Fingerprint) -> Result<WebDriver, WorkflowError> {
        let mut caps = DesiredCapabilities::chrome();
        caps.add_chrome_arg(&format!("--user-agent={}", fingerprint.user_agent))
            .map_err(|e| WorkflowError::Browser(e.to_string()))?;
        caps.add_chrome_arg(&format!(
            "--lang={}",
            fingerprint
                .accept_language
                .split(',')
                .next()
                .unwrap_or("en-US")
        ))
        .map_err(|e| WorkflowError::Browser(e.to_string()))?;
        caps.add_chrome_arg("--disable-blink-features=AutomationControlled")
            .map_err(|e| WorkflowError::Browser(e.to_string()))?;
        if self.settings.headless {
            caps.set_headless()
                .map_err(|e| WorkflowError::Browser(e.to_string()))?;
        }

        let driver = WebDriver::new(&self.settings.webdriver_url, caps)
            .await
            .map_err(|e| WorkflowError::Browser(format!("failed to connect to WebDriver: {}", e)))?;
        driver
            .set_page_load_timeout(Duration::from_secs(self.settings.request_timeout_secs))
            .await
            .map_err(|e| WorkflowError::Browser(e.to_string()))?;
        debug!(
            "WebDriver session started with fingerprint: {}",
            fingerprint.name
        );
        Ok(driver)
    }

    async fn close_driver(&mut self) {
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.quit().await {
                error!("Error closing WebDriver session: {}", e);
            }
        }
    }
}

#[async_trait]
impl BrowserContext for WebDriverBrowser {
    async fn navigate(&mut self, url: &str) -> Result<(), WorkflowError> {
        let limit = self.settings.body_snapshot_limit;
        let driver = self.ensure_driver().await?;

        debug!("Navigating to: {}", url);
        driver
            .goto(url)
            .await
            .map_err(|e| WorkflowError::Browser(format!("failed to navigate to {}: {}", url, e)))?;

        // Chrome exposes the navigation's HTTP status via the Navigation
        // Timing API; treat an absent value as a rendered 200
        let status = driver
            .execute(
                "const e = performance.getEntriesByType('navigation'); \
                 return e.length ? e[0].responseStatus || 200 : 200;",
                Vec::new(),
            )
            .await
            .ok()
            .and_then(|ret| ret.json().as_u64())
            .map(|s| s as u16)
            .unwrap_or(200);

        let mut body = driver
            .source()
            .await
            .map_err(|e| WorkflowError::Browser(format!("failed to get page source: {}", e)))?;
        if body.len() > limit {
            body.truncate(limit);
        }

        self.last_status = Some(status);
        self.last_body = body;
        Ok(())
    }

    fn check_http_status(&self) -> Result<(), WorkflowError> {
        match self.last_status {
            Some(status) => match status_error(status) {
                Some(err) => Err(err),
                None => Ok(()),
            },
            None => Err(WorkflowError::Browser(
                "no navigation has happened yet".to_string(),
            )),
        }
    }

    fn response_status(&self) -> Option<u16> {
        self.last_status
    }

    fn response_body(&self) -> &str {
        &self.last_body
    }

    fn response_info(&self) -> ResponseInfo {
        ResponseInfo {
            status_code: self.last_status,
            // Headers are not observable over WebDriver
            headers: HashMap::new(),
            body: self.last_body.clone(),
        }
    }

    async fn rotate_fingerprint(&mut self) -> Result<(), WorkflowError> {
        if self.settings.fingerprints.len() > 1 {
            self.fingerprint_index =
                (self.fingerprint_index + 1) % self.settings.fingerprints.len();
        }
        // A new identity needs a new session
        self.close_driver().await;
        Ok(())
    }

    async fn clear_cookies(&mut self) -> Result<(), WorkflowError> {
        if let Some(driver) = &self.driver {
            driver
                .delete_all_cookies()
                .await
                .map_err(|e| WorkflowError::Browser(format!("failed to clear cookies: {}", e)))?;
        }
        Ok(())
    }
}

impl Drop for WebDriverBrowser {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            // Spawn a task to quit the driver
            tokio::spawn(async move {
                if let Err(e) = driver.quit().await {
                    error!("Error closing WebDriver session during drop: {}", e);
                }
            });
        }
    }
}
