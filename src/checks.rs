//! Progress notifications for long-running checks
//!
//! Trigger creation reports each precondition it evaluates and each DDL step
//! it takes to a [`CheckNotifier`] so that callers (CLI, UI, batch runner) can
//! surface progress without the trigger code knowing how.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Outcome of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckResult {
    Success,
    Warning,
    Fail,
}

/// One reported step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckEvent {
    pub message: String,
    pub result: CheckResult,
}

impl CheckEvent {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            result: CheckResult::Success,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            result: CheckResult::Warning,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            result: CheckResult::Fail,
        }
    }
}

/// Receives check events
pub trait CheckNotifier {
    fn on_check(&self, event: CheckEvent);
}

/// Forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl CheckNotifier for TracingNotifier {
    fn on_check(&self, event: CheckEvent) {
        match event.result {
            CheckResult::Success => tracing::info!(check = %event.message, "check passed"),
            CheckResult::Warning => tracing::warn!(check = %event.message, "check warning"),
            CheckResult::Fail => tracing::warn!(check = %event.message, "check failed"),
        }
    }
}

/// Keeps every event, for tests and for callers that render a report afterwards
#[derive(Debug, Default)]
pub struct CollectingNotifier {
    events: Mutex<Vec<CheckEvent>>,
}

impl CollectingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CheckEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    /// Whether any reported check failed
    pub fn has_failures(&self) -> bool {
        self.events()
            .iter()
            .any(|e| e.result == CheckResult::Fail)
    }
}

impl CheckNotifier for CollectingNotifier {
    fn on_check(&self, event: CheckEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
