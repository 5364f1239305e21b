//! Reconcile step outcomes and the shared error policy
//!
//! Every step of the access loops resolves to an [`Outcome`]. Requeue
//! intervals are fixed; there is no exponential backoff so health reporting
//! latency stays bounded.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{error, warn};

use fleet_common::Error;

use crate::context::Context;

/// Result of one reconcile pass or step
#[derive(Debug)]
pub enum Outcome {
    /// Converged; come back at the steady-state interval
    Done,
    /// Not finished (waiting on deletion, a machine join, or a transient
    /// failure); come back after the given delay
    RetryAfter(Duration),
    /// Programmer or configuration error; do not retry blindly
    Fatal(Error),
}

impl Outcome {
    /// Classify an error: retryable errors requeue after `retry`, others are fatal
    pub fn from_error(error: Error, retry: Duration) -> Self {
        if error.is_retryable() {
            Outcome::RetryAfter(retry)
        } else {
            Outcome::Fatal(error)
        }
    }

    /// Short label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Done => "done",
            Outcome::RetryAfter(_) => "retry",
            Outcome::Fatal(_) => "fatal",
        }
    }

    /// Map to a controller action at the loop boundary
    pub fn into_action(self, steady: Duration) -> Result<Action, Error> {
        match self {
            Outcome::Done => Ok(Action::requeue(steady)),
            Outcome::RetryAfter(delay) => Ok(Action::requeue(delay)),
            Outcome::Fatal(error) => Err(error),
        }
    }
}

/// Error policy shared by all access controllers
///
/// Retryable errors requeue at the fixed error interval; anything else waits
/// for the object to change.
pub fn error_policy<K>(obj: Arc<K>, error: &Error, ctx: Arc<Context>) -> Action
where
    K: Resource,
{
    if error.is_retryable() {
        warn!(
            %error,
            object = %obj.name_any(),
            "reconciliation failed, retrying"
        );
        Action::requeue(ctx.config.error_requeue_interval)
    } else {
        error!(
            ?error,
            object = %obj.name_any(),
            "reconciliation failed with a non-retryable error"
        );
        Action::await_change()
    }
}
