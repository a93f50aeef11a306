use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::cli::config::AnalyzerSettings;

/// Classification of a detected failure pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Critical,
    RateSpike,
    Consecutive,
    Systematic,
}

/// Transient classification of recent failures, handed to the rules
/// engine alongside the triggering error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPattern {
    pub pattern_type: PatternType,
    pub error_rate: f64,
    pub consecutive_count: usize,
    pub dominant_error: Option<String>,
}

/// The analyzer's verdict: why recovery should activate, and what the
/// failure pattern looks like.
#[derive(Debug, Clone)]
pub struct ActivationDecision {
    pub reason: String,
    pub pattern: ErrorPattern,
}

/// Sliding-window failure analyzer, scoped to one execution.
///
/// Keeps a fixed-size ring of recent outcomes (`None` = success,
/// `Some(signature)` = failure) and decides whether a new error is part of
/// a systemic pattern worth recovering from, or just noise the plain
/// retry path should absorb.
pub struct PatternAnalyzer {
    window: VecDeque<Option<String>>,
    settings: AnalyzerSettings,
}

impl PatternAnalyzer {
    pub fn new(settings: AnalyzerSettings) -> Self {
        Self {
            window: VecDeque::with_capacity(settings.window_size.max(1)),
            settings,
        }
    }

    fn push(&mut self, outcome: Option<String>) {
        if self.window.len() == self.settings.window_size.max(1) {
            self.window.pop_front();
        }
        self.window.push_back(outcome);
    }

    pub fn record_success(&mut self) {
        self.push(None);
    }

    pub fn record_failure(&mut self, signature: &str) {
        self.push(Some(signature.to_string()));
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|o| o.is_some()).count();
        failures as f64 / self.window.len() as f64
    }

    fn consecutive_failures(&self) -> usize {
        self.window
            .iter()
            .rev()
            .take_while(|o| o.is_some())
            .count()
    }

    /// Most frequent failure signature in the window and its count.
    fn dominant_error(&self) -> Option<(String, usize)> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for outcome in self.window.iter().flatten() {
            *counts.entry(outcome.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(sig, count)| (sig.to_string(), count))
    }

    /// Decide whether the recovery system should activate for this error.
    ///
    /// `None` means the failure looks transient/random: the caller should
    /// fall through to plain retry/backoff instead of running recovery.
    pub fn should_activate(&self, error_message: &str) -> Option<ActivationDecision> {
        let lowered = error_message.to_lowercase();
        let error_rate = self.error_rate();
        let consecutive_count = self.consecutive_failures();
        let dominant = self.dominant_error();
        let dominant_error = dominant.as_ref().map(|(sig, _)| sig.clone());

        // Critical error classes bypass the statistics entirely
        if let Some(marker) = self
            .settings
            .critical_markers
            .iter()
            .find(|m| lowered.contains(&m.to_lowercase()))
        {
            return Some(ActivationDecision {
                reason: format!("critical error detected ('{}')", marker),
                pattern: ErrorPattern {
                    pattern_type: PatternType::Critical,
                    error_rate,
                    consecutive_count,
                    dominant_error,
                },
            });
        }

        if error_rate >= self.settings.error_rate_threshold && !self.window.is_empty() {
            return Some(ActivationDecision {
                reason: format!(
                    "error rate {:.1}% over last {} outcomes exceeds {:.1}%",
                    error_rate * 100.0,
                    self.window.len(),
                    self.settings.error_rate_threshold * 100.0
                ),
                pattern: ErrorPattern {
                    pattern_type: PatternType::RateSpike,
                    error_rate,
                    consecutive_count,
                    dominant_error,
                },
            });
        }

        if consecutive_count >= self.settings.consecutive_error_limit {
            return Some(ActivationDecision {
                reason: format!("{} consecutive errors", consecutive_count),
                pattern: ErrorPattern {
                    pattern_type: PatternType::Consecutive,
                    error_rate,
                    consecutive_count,
                    dominant_error,
                },
            });
        }

        if let Some((signature, count)) = dominant {
            if count >= self.settings.same_error_threshold {
                return Some(ActivationDecision {
                    reason: format!("error '{}' repeated {} times", signature, count),
                    pattern: ErrorPattern {
                        pattern_type: PatternType::Systematic,
                        error_rate,
                        consecutive_count,
                        dominant_error: Some(signature),
                    },
                });
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::AppConfig;

    fn analyzer() -> PatternAnalyzer {
        PatternAnalyzer::new(AppConfig::default().recovery.analyzer)
    }

    #[test]
    fn test_rate_activation_at_threshold() {
        // 15 errors in the last 100 outcomes
        let mut a = analyzer();
        for _ in 0..15 {
            a.record_failure("http_500");
        }
        for _ in 0..85 {
            a.record_success();
        }
        let decision = a.should_activate("server error 500").unwrap();
        assert_eq!(decision.pattern.pattern_type, PatternType::RateSpike);
        assert!((decision.pattern.error_rate - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_low_rate_does_not_activate() {
        let mut a = analyzer();
        for _ in 0..5 {
            a.record_failure("http_500");
        }
        for _ in 0..95 {
            a.record_success();
        }
        // 5% rate, 0 consecutive, dominant count 5: all below thresholds
        assert!(a.should_activate("server error 500").is_none());
    }

    #[test]
    fn test_consecutive_activation() {
        let mut a = analyzer();
        // Keep the overall rate below 10% with a long success prefix...
        for _ in 0..95 {
            a.record_success();
        }
        // ...then five consecutive failures of distinct kinds
        a.record_failure("http_500");
        a.record_failure("http_502");
        a.record_failure("http_503");
        a.record_failure("browser");
        a.record_failure("queue");
        let decision = a.should_activate("mixed failures").unwrap();
        assert_eq!(decision.pattern.pattern_type, PatternType::Consecutive);
        assert_eq!(decision.pattern.consecutive_count, 5);
    }

    #[test]
    fn test_dominant_error_activation() {
        let mut settings = AppConfig::default().recovery.analyzer;
        // Raise the rate threshold so the dominant check is what fires
        settings.error_rate_threshold = 0.5;
        let mut a = PatternAnalyzer::new(settings);
        for _ in 0..10 {
            a.record_failure("http_429");
            a.record_success();
            a.record_success();
            a.record_success();
        }
        let decision = a.should_activate("rate limit exceeded").unwrap();
        assert_eq!(decision.pattern.pattern_type, PatternType::Systematic);
        assert_eq!(decision.pattern.dominant_error.as_deref(), Some("http_429"));
    }

    #[test]
    fn test_critical_marker_activates_immediately() {
        let mut a = analyzer();
        a.record_success();
        a.record_failure("bot");
        let decision = a.should_activate("Bot Detection triggered").unwrap();
        assert_eq!(decision.pattern.pattern_type, PatternType::Critical);
    }

    #[test]
    fn test_first_error_activates_on_rate() {
        // A lone failure is 100% of a 1-outcome window, so a first 429
        // activates recovery straight away
        let mut a = analyzer();
        a.record_failure("http_429");
        let decision = a.should_activate("rate limit exceeded").unwrap();
        assert_eq!(decision.pattern.pattern_type, PatternType::RateSpike);
        assert!((decision.pattern.error_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_slides() {
        let mut a = analyzer();
        for _ in 0..100 {
            a.record_failure("http_500");
        }
        // Push the failures out of the window
        for _ in 0..100 {
            a.record_success();
        }
        assert!(a.should_activate("server error 500").is_none());
    }
}
