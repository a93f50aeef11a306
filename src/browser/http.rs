use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::Client;
use tracing::{debug, warn};

use crate::browser::{status_error, BrowserContext};
use crate::cli::config::{BrowserSettings, Fingerprint};
use crate::error::WorkflowError;
use crate::workflow::types::ResponseInfo;

/// Plain HTTP browser backend.
///
/// Presents one fingerprint from the configured pool per session, applies
/// the politeness delay (with jitter) before every navigation, and keeps a
/// snapshot of the last response for status checks and recovery condition
/// evaluation.
pub struct HttpBrowser {
    settings: BrowserSettings,
    client: Client,
    fingerprint: Fingerprint,
    politeness_delay_ms: u64,
    /// Extra delay added by the recovery `add_delay` action
    extra_delay_ms: u64,
    last_response: Option<ResponseInfo>,
}

impl HttpBrowser {
    pub fn new(settings: BrowserSettings, politeness_delay_ms: u64) -> Result<Self, WorkflowError> {
        let fingerprint = pick_fingerprint(&settings, None)?;
        let client = build_client(&settings, &fingerprint)?;
        Ok(Self {
            settings,
            client,
            fingerprint,
            politeness_delay_ms,
            extra_delay_ms: 0,
            last_response: None,
        })
    }

    /// Bump the per-request delay. Recovery `add_delay` hook.
    pub fn add_delay(&mut self, delay_ms: u64) {
        self.extra_delay_ms += delay_ms;
    }

    pub fn fingerprint_name(&self) -> &str {
        &self.fingerprint.name
    }

    async fn politeness_pause(&self) {
        let base = self.politeness_delay_ms + self.extra_delay_ms;
        if base == 0 {
            return;
        }
        // Jitter so request timing doesn't look mechanical
        let jitter = rand::thread_rng().gen_range(0..=base / 4 + 1);
        tokio::time::sleep(Duration::from_millis(base + jitter)).await;
    }
}

fn pick_fingerprint(
    settings: &BrowserSettings,
    exclude: Option<&str>,
) -> Result<Fingerprint, WorkflowError> {
    let candidates: Vec<&Fingerprint> = settings
        .fingerprints
        .iter()
        .filter(|f| Some(f.name.as_str()) != exclude)
        .collect();
    candidates
        .choose(&mut rand::thread_rng())
        .map(|f| (*f).clone())
        .or_else(|| settings.fingerprints.first().cloned())
        .ok_or_else(|| WorkflowError::Browser("no fingerprints configured".to_string()))
}

fn build_client(
    settings: &BrowserSettings,
    fingerprint: &Fingerprint,
) -> Result<Client, WorkflowError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&fingerprint.user_agent)
            .map_err(|e| WorkflowError::Browser(format!("invalid user agent: {}", e)))?,
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_str(&fingerprint.accept_language)
            .map_err(|e| WorkflowError::Browser(format!("invalid accept-language: {}", e)))?,
    );
    for (name, value) in &fingerprint.extra_headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| WorkflowError::Browser(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| WorkflowError::Browser(format!("invalid header value: {}", e)))?;
        headers.insert(name, value);
    }

    Client::builder()
        .timeout(Duration::from_secs(settings.request_timeout_secs))
        .cookie_store(true)
        .default_headers(headers)
        .build()
        .map_err(|e| WorkflowError::Browser(format!("failed to build HTTP client: {}", e)))
}

#[async_trait]
impl BrowserContext for HttpBrowser {
    async fn navigate(&mut self, url: &str) -> Result<(), WorkflowError> {
        self.politeness_pause().await;

        debug!("Navigating to: {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WorkflowError::Browser(format!("request to {} failed: {}", url, e)))?;

        let status = response.status().as_u16();
        let mut headers: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.to_string())
                    .or_default()
                    .push(value.to_string());
            }
        }

        let mut body = response
            .text()
            .await
            .map_err(|e| WorkflowError::Browser(format!("failed to read body from {}: {}", url, e)))?;
        if body.len() > self.settings.body_snapshot_limit {
            body.truncate(self.settings.body_snapshot_limit);
        }

        self.last_response = Some(ResponseInfo {
            status_code: Some(status),
            headers,
            body,
        });

        Ok(())
    }

    fn check_http_status(&self) -> Result<(), WorkflowError> {
        match self.last_response.as_ref().and_then(|r| r.status_code) {
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
        self.last_response.as_ref().and_then(|r| r.status_code)
    }

    fn response_body(&self) -> &str {
        self.last_response
            .as_ref()
            .map(|r| r.body.as_str())
            .unwrap_or("")
    }

    fn response_info(&self) -> ResponseInfo {
        self.last_response.clone().unwrap_or_default()
    }

    async fn rotate_fingerprint(&mut self) -> Result<(), WorkflowError> {
        let next = pick_fingerprint(&self.settings, Some(self.fingerprint.name.as_str()))?;
        if next.name == self.fingerprint.name {
            warn!("only one fingerprint configured, rotation is a no-op");
        }
        debug!(from = %self.fingerprint.name, to = %next.name, "rotating fingerprint");
        self.client = build_client(&self.settings, &next)?;
        self.fingerprint = next;
        Ok(())
    }

    async fn clear_cookies(&mut self) -> Result<(), WorkflowError> {
        // The cookie store lives inside the client, so rebuilding the
        // client drops every cookie
        self.client = build_client(&self.settings, &self.fingerprint)?;
        debug!("cleared cookie store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::AppConfig;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings() -> BrowserSettings {
        let mut settings = AppConfig::default().browser;
        settings.request_timeout_secs = 5;
        settings
    }

    #[tokio::test]
    async fn test_navigate_snapshots_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body>ok</body></html>")
                    .insert_header("x-test", "yes"),
            )
            .mount(&server)
            .await;

        let mut browser = HttpBrowser::new(test_settings(), 0).unwrap();
        browser
            .navigate(&format!("{}/page", server.uri()))
            .await
            .unwrap();

        assert_eq!(browser.response_status(), Some(200));
        assert!(browser.response_body().contains("ok"));
        assert!(browser.check_http_status().is_ok());
        let info = browser.response_info();
        assert_eq!(info.header("x-test"), Some("yes"));
    }

    #[tokio::test]
    async fn test_429_maps_to_rate_limit_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "30")
                    .set_body_string("slow down"),
            )
            .mount(&server)
            .await;

        let mut browser = HttpBrowser::new(test_settings(), 0).unwrap();
        browser
            .navigate(&format!("{}/limited", server.uri()))
            .await
            .unwrap();

        match browser.check_http_status() {
            Err(WorkflowError::HttpStatus { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "rate limit exceeded");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(browser.response_info().header("retry-after"), Some("30"));
    }

    #[tokio::test]
    async fn test_fingerprint_headers_are_sent() {
        let server = MockServer::start().await;
        let mut settings = test_settings();
        settings.fingerprints = vec![Fingerprint {
            name: "test".to_string(),
            user_agent: "TestAgent/1.0".to_string(),
            accept_language: "en-US".to_string(),
            extra_headers: HashMap::new(),
        }];

        Mock::given(method("GET"))
            .and(path("/ua"))
            .and(header("user-agent", "TestAgent/1.0"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut browser = HttpBrowser::new(settings, 0).unwrap();
        browser.navigate(&format!("{}/ua", server.uri())).await.unwrap();
        assert_eq!(browser.response_status(), Some(200));
    }

    #[tokio::test]
    async fn test_check_before_navigate_is_an_error() {
        let browser = HttpBrowser::new(test_settings(), 0).unwrap();
        assert!(matches!(
            browser.check_http_status(),
            Err(WorkflowError::Browser(_))
        ));
    }
}
