use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub crawler: CrawlerSettings,
    pub browser: BrowserSettings,
    pub queue: QueueSettings,
    pub executor: ExecutorSettings,
    pub recovery: RecoverySettings,
}

/// Crawl-wide limits and politeness settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CrawlerSettings {
    pub max_depth: u32,
    pub max_pages: u32,
    pub politeness_delay_ms: u64,
    pub user_agent: String,
}

/// Browser collaborator settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BrowserSettings {
    /// "http" (plain client) or "webdriver"
    pub backend: String,
    /// Bounded browser pool size; the executor blocks on acquire
    pub pool_size: usize,
    pub webdriver_url: String,
    pub headless: bool,
    /// Request timeout for the HTTP backend
    pub request_timeout_secs: u64,
    /// Maximum body bytes kept in the response snapshot
    pub body_snapshot_limit: usize,
    pub fingerprints: Vec<Fingerprint>,
}

/// One browser identity the HTTP backend can present
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Fingerprint {
    pub name: String,
    pub user_agent: String,
    pub accept_language: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

/// URL queue settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueueSettings {
    /// "memory" or "redis"
    pub backend: String,
    pub redis_url: String,
    /// Time to live for queue entries in seconds (Redis backend)
    pub task_ttl: u64,
    /// How many times a retryable URL failure is re-enqueued
    pub max_url_retries: u32,
}

/// Workflow executor settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ExecutorSettings {
    /// Stats recompute/persist interval in seconds
    pub stats_interval_secs: u64,
    /// Idle sleep between dequeue attempts when the queue is momentarily
    /// empty but items are still in flight, in milliseconds
    pub idle_poll_ms: u64,
}

/// Error recovery settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecoverySettings {
    pub analyzer: AnalyzerSettings,
    pub learning: LearningSettings,
    pub ai: AiSettings,
}

/// Error pattern analyzer thresholds
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AnalyzerSettings {
    /// Sliding window size (outcomes)
    pub window_size: usize,
    /// Error rate over the window that activates recovery
    pub error_rate_threshold: f64,
    /// Consecutive error count that activates recovery
    pub consecutive_error_limit: usize,
    /// Occurrences of a single error signature that activate recovery
    pub same_error_threshold: usize,
    /// Substrings marking an error as critical (immediate activation)
    pub critical_markers: Vec<String>,
}

/// Learning engine thresholds
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LearningSettings {
    /// Minimum tracked uses before a solution can be promoted to a rule
    pub min_usage_count: u64,
    /// Minimum success rate for promotion
    pub min_success_rate: f64,
    /// Learned rules whose success rate falls below this are flagged
    /// deprecated (kept, but skipped during matching)
    pub deprecation_floor: f64,
}

/// AI fallback settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AiSettings {
    pub enabled: bool,
    /// OpenAI-compatible chat completions endpoint
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            crawler: CrawlerSettings {
                max_depth: 3,
                max_pages: 1000,
                politeness_delay_ms: 2000,
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
            },
            browser: BrowserSettings {
                backend: "http".to_string(),
                pool_size: 2,
                webdriver_url: "http://localhost:4444".to_string(),
                headless: true,
                request_timeout_secs: 30,
                body_snapshot_limit: 512 * 1024,
                fingerprints: vec![
                    Fingerprint {
                        name: "windows_chrome".to_string(),
                        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string(),
                        accept_language: "en-US,en;q=0.9".to_string(),
                        extra_headers: HashMap::new(),
                    },
                    Fingerprint {
                        name: "mac_safari".to_string(),
                        user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15".to_string(),
                        accept_language: "en-US,en;q=0.9".to_string(),
                        extra_headers: HashMap::new(),
                    },
                ],
            },
            queue: QueueSettings {
                backend: "memory".to_string(),
                redis_url: "redis://localhost:6379".to_string(),
                task_ttl: 86400,
                max_url_retries: 3,
            },
            executor: ExecutorSettings {
                stats_interval_secs: 5,
                idle_poll_ms: 200,
            },
            recovery: RecoverySettings {
                analyzer: AnalyzerSettings {
                    window_size: 100,
                    error_rate_threshold: 0.10,
                    consecutive_error_limit: 5,
                    same_error_threshold: 10,
                    critical_markers: vec![
                        "bot detection".to_string(),
                        "captcha".to_string(),
                        "access denied".to_string(),
                    ],
                },
                learning: LearningSettings {
                    min_usage_count: 5,
                    min_success_rate: 0.90,
                    deprecation_floor: 0.30,
                },
                ai: AiSettings {
                    enabled: false,
                    base_url: "https://api.openai.com/v1".to_string(),
                    model: "gpt-4o-mini".to_string(),
                    api_key_env: "CRAWLFLOW_AI_API_KEY".to_string(),
                    request_timeout_secs: 60,
                },
            },
        }
    }
}

impl AppConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        let mut path = if let Some(proj_dirs) =
            directories::ProjectDirs::from("com", "crawlflow", "crawlflow")
        {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        };

        // Create the profiles directory if it doesn't exist
        path.push("profiles");
        if !path.exists() {
            if let Err(e) = fs::create_dir_all(&path) {
                error!("Failed to create config directory: {}", e);
            }
        }

        // Move back up to the config directory
        path.pop();
        path
    }

    /// Load the default configuration
    pub fn load_default() -> Result<Self> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        if config_path.exists() {
            Self::load_from_file(&config_path)
        } else {
            // Create and save the default configuration
            info!("Default configuration not found. Creating...");
            let config = Self::default();
            config.save_as_default()?;
            Ok(config)
        }
    }

    /// Load a configuration profile
    pub fn load_profile(profile: &str) -> Result<Self> {
        let config_dir = Self::config_dir();
        let profile_path = config_dir.join("profiles").join(format!("{}.yaml", profile));

        if profile_path.exists() {
            Self::load_from_file(&profile_path)
        } else {
            anyhow::bail!("Profile '{}' not found", profile)
        }
    }

    /// Load configuration from a file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Save the configuration as the default
    pub fn save_as_default(&self) -> Result<()> {
        let config_dir = Self::config_dir();
        let config_path = config_dir.join("default.yaml");

        self.save_to_file(&config_path)
    }

    /// Save the configuration as a profile
    pub fn save_as_profile(&self, profile: &str) -> Result<()> {
        let config_dir = Self::config_dir();
        let profiles_dir = config_dir.join("profiles");

        if !profiles_dir.exists() {
            fs::create_dir_all(&profiles_dir).context(format!(
                "Failed to create profiles directory: {}",
                profiles_dir.display()
            ))?;
        }

        let profile_path = profiles_dir.join(format!("{}.yaml", profile));
        self.save_to_file(&profile_path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents =
            serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }

    /// List all available profiles
    pub fn list_profiles() -> Result<Vec<String>> {
        let config_dir = Self::config_dir();
        let profiles_dir = config_dir.join("profiles");

        if !profiles_dir.exists() {
            return Ok(vec![]);
        }

        let mut profiles = Vec::new();

        for entry in fs::read_dir(profiles_dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_file() && path.extension().map_or(false, |ext| ext == "yaml") {
                if let Some(stem) = path.file_stem() {
                    if let Some(name) = stem.to_str() {
                        profiles.push(name.to_string());
                    }
                }
            }
        }

        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrips_through_yaml() {
        let config = AppConfig::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: AppConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.queue.backend, "memory");
        assert_eq!(parsed.recovery.analyzer.window_size, 100);
        assert_eq!(parsed.recovery.learning.min_usage_count, 5);
    }

    #[test]
    fn test_default_thresholds_match_documented_values() {
        let config = AppConfig::default();
        assert!((config.recovery.analyzer.error_rate_threshold - 0.10).abs() < f64::EPSILON);
        assert_eq!(config.recovery.analyzer.consecutive_error_limit, 5);
        assert_eq!(config.recovery.analyzer.same_error_threshold, 10);
        assert!((config.recovery.learning.min_success_rate - 0.90).abs() < f64::EPSILON);
        assert_eq!(config.executor.stats_interval_secs, 5);
    }
}
