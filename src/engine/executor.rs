use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;

use crate::engine::definition::{StepInput, StepSpec};

/// Result of one step attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// Runs a single step attempt and turns whatever happens into an [`Outcome`].
///
/// Errors, panics and timeouts inside the step closure all become
/// `Outcome::Failure`; nothing escapes to the caller.
#[derive(Debug, Clone, Default)]
pub struct StepExecutor {
    default_timeout: Option<Duration>,
}

impl StepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied to steps that declare no timeout of their own.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
        }
    }

    pub async fn execute(&self, step: &StepSpec, input: StepInput) -> Outcome {
        let attempt = AssertUnwindSafe(step.invoke(input)).catch_unwind();

        let result = match step.timeout.or(self.default_timeout) {
            Some(timeout) => match tokio::time::timeout(timeout, attempt).await {
                Ok(r) => r,
                Err(_) => {
                    return Outcome::Failure(format!(
                        "Step '{}' timed out after {}s",
                        step.name,
                        timeout.as_secs_f64()
                    ));
                }
            },
            None => attempt.await,
        };

        match result {
            Ok(Ok(value)) => Outcome::Success(value),
            Ok(Err(e)) => Outcome::Failure(format!("{:#}", e)),
            Err(panic) => Outcome::Failure(format!(
                "Step '{}' panicked: {}",
                step.name,
                panic_message(panic.as_ref())
            )),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
