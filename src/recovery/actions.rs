use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::browser::BrowserContext;
use crate::error::WorkflowError;
use crate::recovery::rules::{to_f64, ActionSpec};

/// A fully-resolved recovery action, ready to run. Parsed from an
/// [`ActionSpec`] after variable substitution.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    PauseExecution,
    Wait { duration_ms: u64 },
    ReduceWorkers { target: usize },
    AddDelay { delay_ms: u64 },
    Resume,
    RotateFingerprint,
    ClearCookies,
}

impl RecoveryAction {
    /// Parse an action spec whose parameters have already had variables
    /// substituted. Unknown action names and missing/invalid parameters
    /// are definition errors.
    pub fn parse(spec: &ActionSpec) -> Result<Self, WorkflowError> {
        match spec.action.as_str() {
            "pause_execution" => Ok(Self::PauseExecution),
            "resume" => Ok(Self::Resume),
            "rotate_fingerprint" => Ok(Self::RotateFingerprint),
            "clear_cookies" => Ok(Self::ClearCookies),
            "wait" => Ok(Self::Wait {
                duration_ms: numeric_param(spec, "duration_ms")?,
            }),
            "add_delay" => Ok(Self::AddDelay {
                delay_ms: numeric_param(spec, "delay_ms")?,
            }),
            "reduce_workers" => {
                let target = numeric_param(spec, "target")? as usize;
                Ok(Self::ReduceWorkers {
                    target: target.max(1),
                })
            }
            other => Err(WorkflowError::Definition(format!(
                "unknown recovery action '{}'",
                other
            ))),
        }
    }
}

fn numeric_param(spec: &ActionSpec, key: &str) -> Result<u64, WorkflowError> {
    let value = spec.params.get(key).ok_or_else(|| {
        WorkflowError::Definition(format!(
            "recovery action '{}' is missing parameter '{}'",
            spec.action, key
        ))
    })?;
    match to_f64(value) {
        Some(n) if n >= 0.0 => Ok(n as u64),
        _ => Err(WorkflowError::Definition(format!(
            "recovery action '{}' parameter '{}' is not a non-negative number: {}",
            spec.action, key, value
        ))),
    }
}

/// Shared knobs the actions turn and the executor reads. The worker
/// budget and extra delay are advisory: they shape this process's own
/// crawl loop and nothing beyond it.
pub struct RecoveryControls {
    paused: AtomicBool,
    extra_delay_ms: AtomicU64,
    worker_budget: AtomicUsize,
}

impl RecoveryControls {
    pub fn new(initial_workers: usize) -> Self {
        Self {
            paused: AtomicBool::new(false),
            extra_delay_ms: AtomicU64::new(0),
            worker_budget: AtomicUsize::new(initial_workers.max(1)),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn extra_delay(&self) -> Duration {
        Duration::from_millis(self.extra_delay_ms.load(Ordering::SeqCst))
    }

    pub fn worker_budget(&self) -> usize {
        self.worker_budget.load(Ordering::SeqCst)
    }
}

/// Run an ordered action list against the shared controls and the browser
/// context the failing navigation used.
pub async fn apply_actions(
    actions: &[RecoveryAction],
    controls: &RecoveryControls,
    browser: &mut dyn BrowserContext,
) -> Result<(), WorkflowError> {
    for action in actions {
        debug!(?action, "applying recovery action");
        match action {
            RecoveryAction::PauseExecution => {
                controls.paused.store(true, Ordering::SeqCst);
                info!("execution paused by recovery");
            }
            RecoveryAction::Resume => {
                controls.paused.store(false, Ordering::SeqCst);
                info!("execution resumed by recovery");
            }
            RecoveryAction::Wait { duration_ms } => {
                tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
            }
            RecoveryAction::AddDelay { delay_ms } => {
                controls.extra_delay_ms.fetch_add(*delay_ms, Ordering::SeqCst);
            }
            RecoveryAction::ReduceWorkers { target } => {
                controls.worker_budget.store((*target).max(1), Ordering::SeqCst);
                info!(target = target, "worker budget reduced by recovery");
            }
            RecoveryAction::RotateFingerprint => {
                browser.rotate_fingerprint().await?;
            }
            RecoveryAction::ClearCookies => {
                browser.clear_cookies().await?;
            }
        }
    }
    Ok(())
}
