//! Observability middleware for model calls.
//!
//! An observer is handed to a model wrapper at construction time and is told
//! when each call starts and finishes. Nothing is hooked in implicitly: a
//! model built without an observer is not instrumented.

use std::time::Duration;

/// Description of a single observed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Operation name (e.g. "query")
    pub operation: &'static str,
    /// Model or provider the call targets
    pub target: String,
    /// Size of the prompt in characters
    pub input_chars: usize,
}

/// Result summary passed to [`ModelObserver::on_finish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { output_chars: usize },
    Failure { error: String },
}

/// Receives start/finish notifications for wrapped calls.
pub trait ModelObserver: Send + Sync {
    /// Called before the wrapped call runs.
    fn on_start(&self, observation: &Observation);

    /// Called after the wrapped call returns.
    fn on_finish(&self, observation: &Observation, elapsed: Duration, outcome: &Outcome);
}

/// Observer that emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ModelObserver for TracingObserver {
    fn on_start(&self, observation: &Observation) {
        tracing::debug!(
            operation = observation.operation,
            target = %observation.target,
            input_chars = observation.input_chars,
            "Model call started"
        );
    }

    fn on_finish(&self, observation: &Observation, elapsed: Duration, outcome: &Outcome) {
        let duration_ms = elapsed.as_millis() as u64;
        match outcome {
            Outcome::Success { output_chars } => tracing::info!(
                operation = observation.operation,
                target = %observation.target,
                duration_ms,
                output_chars,
                "Model call completed"
            ),
            Outcome::Failure { error } => tracing::warn!(
                operation = observation.operation,
                target = %observation.target,
                duration_ms,
                error = %error,
                "Model call failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_observer_accepts_both_outcomes() {
        let observer = TracingObserver;
        let observation = Observation {
            operation: "query",
            target: "gpt-4o-mini".into(),
            input_chars: 12,
        };
        observer.on_start(&observation);
        observer.on_finish(
            &observation,
            Duration::from_millis(5),
            &Outcome::Success { output_chars: 3 },
        );
        observer.on_finish(
            &observation,
            Duration::from_millis(5),
            &Outcome::Failure { error: "boom".into() },
        );
    }
}
