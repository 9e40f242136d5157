//! Admission-limiting contracts and implementations.

pub mod dispatch;
pub mod engine;
pub mod ramp;
pub mod rate;

use std::sync::Arc;

use crate::buffer::{Empty, ExpiringCircularBuffer};
use crate::error::Result;

use self::rate::Rate;

/// Terminal error recorded by [`AsyncRateLimiter::cancel_all`] and delivered
/// to every queued and future callback.
pub type InvocationError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Completion callback representing one unit of admitted work.
///
/// Callbacks are held behind `Arc` and invoked by shared reference: a
/// [`ReadMode::Retain`](crate::buffer::ReadMode) store may deliver the same
/// callback more than once, so implementations must tolerate repeated
/// invocation.
pub trait Callback: Send + Sync + 'static {
    /// The work was admitted and dispatched.
    fn on_success(&self);

    /// The work will never be admitted; `error` is the cancellation cause.
    fn on_error(&self, error: InvocationError);
}

impl<F> Callback for F
where
    F: Fn(std::result::Result<(), InvocationError>) + Send + Sync + 'static,
{
    fn on_success(&self) {
        self(Ok(()))
    }

    fn on_error(&self, error: InvocationError) {
        self(Err(error))
    }
}

/// Asynchronous admission limiter contract.
///
/// Every method is non-blocking and safe to call from any thread: callers
/// only enqueue work or swap shared references, then wake the limiter's
/// internal single-threaded scheduler. Consumed by HTTP client throttling
/// layers and traffic-duplication tooling.
pub trait AsyncRateLimiter: Send + Sync + 'static {
    /// Queue a callback for dispatch under the current rate.
    fn submit(&self, callback: Arc<dyn Callback>);

    /// Snapshot of the currently configured rate. No side effects.
    fn rate(&self) -> Rate;

    /// Replace the rate. Takes effect at the next scheduler tick; permits
    /// already consumed in the current period are carried over rather than
    /// reset, so a live change does not double-issue.
    fn set_rate(&self, events_per_period: f64, period_ms: u64, burst: u32) -> Result<()>;

    /// Irreversibly cancel the limiter. The backlog is drained at unlimited
    /// speed and every affected callback, including any submitted later,
    /// receives `on_error(error)`. Only the first call has effect.
    fn cancel_all(&self, error: InvocationError);
}

/// An admission limiter that can also grow toward a target rate gradually.
pub trait RampUpRateLimiter: AsyncRateLimiter {
    /// Like [`AsyncRateLimiter::set_rate`], but a rate increase is applied
    /// in steps of at most `ramp_permits_per_second` permits per second, one
    /// step per second, until the target is reached. Decreases still apply
    /// immediately.
    fn set_rate_ramped(
        &self,
        events_per_period: f64,
        period_ms: u64,
        burst: u32,
        ramp_permits_per_second: f64,
    ) -> Result<()>;
}

/// Holding area for not-yet-dispatched callbacks.
///
/// This is the seam between the engine and its backlog. The expiring ring is
/// the provided implementation; a bounded blocking queue can be swapped in
/// for consumers that prefer backpressure over loss.
pub trait CallbackStore: Send + Sync + 'static {
    /// Store a callback. Always succeeds; lossy stores may drop older work.
    fn put(&self, callback: Arc<dyn Callback>);

    /// Pull the next pending callback, or signal that the store is drained.
    fn take(&self) -> std::result::Result<Arc<dyn Callback>, Empty>;

    /// Number of callbacks currently held.
    fn len(&self) -> usize;
}

impl CallbackStore for ExpiringCircularBuffer<Arc<dyn Callback>> {
    fn put(&self, callback: Arc<dyn Callback>) {
        self.add(callback);
    }

    fn take(&self) -> std::result::Result<Arc<dyn Callback>, Empty> {
        ExpiringCircularBuffer::take(self)
    }

    fn len(&self) -> usize {
        ExpiringCircularBuffer::len(self)
    }
}
