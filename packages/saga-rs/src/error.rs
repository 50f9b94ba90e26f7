//! Structured error types for the saga runtime.
//!
//! `SagaError` provides pattern-matchable errors instead of opaque strings.
//! Effect methods return `anyhow::Result`, so a saga can freely mix its own
//! errors with runtime ones and propagate both with `?`. The scheduler
//! recovers the runtime variants with `downcast_ref`.
//!
//! # Classification
//!
//! ```ignore
//! use saga::SagaError;
//!
//! match err.downcast_ref::<SagaError>() {
//!     Some(SagaError::Cancelled) => { /* superseded - not a failure */ }
//!     Some(SagaError::Timeout { action_type, .. }) => {
//!         eprintln!("gave up waiting for {}", action_type);
//!     }
//!     _ => { /* genuine failure, routed to the error handler */ }
//! }
//! ```

use std::time::Duration;

use thiserror::Error;

// =============================================================================
// Saga Error
// =============================================================================

/// Errors raised by the saga runtime itself.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The effect was refused because the environment's token is cancelled.
    ///
    /// Always classified as a cancellation by the scheduler, never reported
    /// to the error handler.
    #[error("saga cancelled")]
    Cancelled,

    /// A `take` gave up before a matching action was dispatched.
    #[error("timed out after {duration:?} waiting for action {action_type}")]
    Timeout {
        /// Type tag of the action that was being waited for.
        action_type: &'static str,
        /// How long we waited.
        duration: Duration,
    },

    /// The saga body panicked.
    #[error("saga panicked: {message}")]
    Panicked {
        /// The panic payload, if it was a string.
        message: String,
    },

    /// An invocation was triggered with no tokio runtime to run it on.
    #[error("no tokio runtime available to run saga")]
    NoRuntime,

    /// An effect produced a value of a different type than the caller asked for.
    ///
    /// Seen when a test mock returns the wrong type for the effect it replaces.
    #[error("effect {effect} returned a value of an unexpected type")]
    ResultTypeMismatch {
        /// Name of the effect.
        effect: &'static str,
    },

    /// A spawned child task could not be joined.
    #[error("spawned task failed to join: {message}")]
    TaskJoin {
        /// The join error description.
        message: String,
    },
}

impl SagaError {
    /// Whether this error marks a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SagaError::Cancelled)
    }

    /// Build a `Panicked` error from a `catch_unwind` payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        SagaError::Panicked { message }
    }
}

/// Returns `true` if `err` is (or wraps) a [`SagaError::Cancelled`].
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SagaError>()
        .is_some_and(SagaError::is_cancelled)
}

// =============================================================================
// Harness Error
// =============================================================================

/// Failures reported by the test harness.
///
/// A harness failure means the saga did not behave as the test declared.
/// Every kind is its own variant so tests can assert on the exact mismatch.
#[cfg(any(test, feature = "testing"))]
#[derive(Debug, Error)]
pub enum HarnessError {
    /// An effect needed a mock (or state) and none was supplied.
    #[error("effect {effect} has no mock and no fallback")]
    MissingMock {
        /// Name of the effect.
        effect: &'static str,
    },

    /// `select` ran with no select mock, no reducer and no fixed state.
    #[error("select requires a mock, or state via with_reducer/with_state")]
    MissingState,

    /// A declared mock was never used by the saga.
    #[error("mock for {effect} was never used")]
    UnusedMock {
        /// Name of the mocked effect.
        effect: &'static str,
    },

    /// The saga finished with expectations left unconsumed.
    #[error("saga performed fewer effects than expected; remaining: {remaining:?}")]
    UnmetExpectations {
        /// Descriptions of the expectations that were never met.
        remaining: Vec<String>,
    },

    /// An effect matched the next expectation by kind and target, but not by arguments.
    #[error("effect mismatch: expected {expected}, got {actual}")]
    EffectMismatch {
        /// The expected effect.
        expected: String,
        /// The effect that happened.
        actual: String,
    },

    /// A dispatched action differed from the expected one of the same type.
    #[error("dispatch mismatch: expected {expected}, got {actual}")]
    DispatchMismatch {
        /// The expected action.
        expected: String,
        /// The dispatched action.
        actual: String,
    },

    /// The saga called `take` but the next expectation is not a matching take.
    #[error("unexpected take of {requested}; next expectation: {next}")]
    UnexpectedTake {
        /// Type tag the saga waited for.
        requested: &'static str,
        /// Description of the next expectation, or "none".
        next: String,
    },

    /// The saga did not settle within the harness timeout.
    #[error("saga did not finish within {duration:?}")]
    Timeout {
        /// The timeout that elapsed.
        duration: Duration,
    },

    /// `run()` was called without configuring a triggering action.
    #[error("no triggering action configured; call dispatch() before run()")]
    NoAction,

    /// The triggering action does not match the saga under test.
    #[error("action {action_type} does not trigger the saga under test")]
    ActionNotMatched {
        /// Type tag of the configured action.
        action_type: &'static str,
    },

    /// The final state differs from the expected one.
    #[error("final state mismatch: expected {expected}, got {actual}")]
    FinalStateMismatch {
        /// The expected state.
        expected: String,
        /// The state after the saga finished.
        actual: String,
    },

    /// The saga itself failed with an error that is not a harness mismatch.
    #[error("saga failed: {0}")]
    SagaFailed(#[source] anyhow::Error),
}
