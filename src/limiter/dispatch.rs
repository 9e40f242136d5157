//! Callback dispatch handoff.
//!
//! Dispatched callbacks run on a separate executor so a slow consumer cannot
//! stall the scheduler's admission decisions.

use std::sync::Arc;

use super::{Callback, InvocationError};

/// A single dispatch: delivers success, or the limiter's recorded
/// cancellation error.
pub struct DispatchTask {
    callback: Arc<dyn Callback>,
    error: Option<InvocationError>,
}

impl DispatchTask {
    pub(crate) fn new(callback: Arc<dyn Callback>, error: Option<InvocationError>) -> Self {
        Self { callback, error }
    }

    /// Invoke the callback with the outcome this task was built with.
    pub fn run(self) {
        match self.error {
            None => self.callback.on_success(),
            Some(error) => self.callback.on_error(error),
        }
    }

    /// Route the callback to its error path with `error`, regardless of the
    /// outcome this task was built with.
    pub(crate) fn fail(self, error: InvocationError) {
        self.callback.on_error(error);
    }
}

/// A task the dispatcher refused to accept, returned to the caller for
/// synchronous fallback delivery.
pub struct RejectedTask {
    /// The refused task.
    pub task: DispatchTask,
    /// Why the handoff failed.
    pub reason: String,
}

/// Executes dispatched callbacks away from the scheduler.
///
/// A panicking callback is isolated by whatever execution context the
/// dispatcher hands it to; it must never be able to take down the caller.
pub trait Dispatcher: Send + Sync + 'static {
    /// Hand a task off for execution. On refusal the task is handed back so
    /// the caller can deliver it synchronously as a last resort.
    fn dispatch(&self, task: DispatchTask) -> std::result::Result<(), RejectedTask>;
}

/// Default dispatcher: one Tokio task per callback invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioDispatcher;

impl Dispatcher for TokioDispatcher {
    fn dispatch(&self, task: DispatchTask) -> std::result::Result<(), RejectedTask> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { task.run() });
                Ok(())
            }
            Err(e) => Err(RejectedTask {
                task,
                reason: e.to_string(),
            }),
        }
    }
}
