//! Ramp-up decorator: smooth rate increases, immediate decreases.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{FloodgateError, Result};

use super::rate::Rate;
use super::{AsyncRateLimiter, Callback, InvocationError, RampUpRateLimiter};

/// Interval between successive ramp steps.
const STEP_INTERVAL: Duration = Duration::from_millis(1000);

/// Ramp used by the plain `set_rate` path: one step that jumps straight to
/// the target.
const UNBOUNDED_RAMP: f64 = f64::INFINITY;

/// One pending ramp transaction.
#[derive(Debug, Clone, Copy)]
struct Step {
    txn: u64,
    events: f64,
    period_ms: u64,
    burst: u32,
    ramp_per_second: f64,
}

struct RampShared {
    /// Latest issued transaction id; a step carrying an older id aborts.
    latest_txn: AtomicU64,
    /// Set by cancel_all: queued and delayed steps are discarded.
    cancelled: AtomicBool,
}

/// Decorates any [`AsyncRateLimiter`] so that rate increases are applied in
/// per-second increments while decreases take effect immediately. Racing
/// configuration changes resolve to last-writer-wins through monotonically
/// increasing transaction ids; a preempted ramp stops silently without
/// forcing the rate back down.
///
/// All step execution is serialized on one internal worker task, so the
/// decorator adds no locking to the wrapped engine. Construction must
/// happen inside a Tokio runtime.
pub struct RampedRateLimiter {
    delegate: Arc<dyn AsyncRateLimiter>,
    shared: Arc<RampShared>,
    steps: mpsc::UnboundedSender<Step>,
}

impl RampedRateLimiter {
    /// Wrap `delegate` with ramped rate changes.
    pub fn new(delegate: Arc<dyn AsyncRateLimiter>) -> Self {
        let shared = Arc::new(RampShared {
            latest_txn: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        });

        let (steps, receiver) = mpsc::unbounded_channel();
        let worker = StepWorker {
            delegate: Arc::clone(&delegate),
            shared: Arc::clone(&shared),
            steps: receiver,
            delayed: None,
        };
        tokio::spawn(worker.run());

        Self {
            delegate,
            shared,
            steps,
        }
    }
}

impl AsyncRateLimiter for RampedRateLimiter {
    fn submit(&self, callback: Arc<dyn Callback>) {
        self.delegate.submit(callback);
    }

    fn rate(&self) -> Rate {
        self.delegate.rate()
    }

    fn set_rate(&self, events_per_period: f64, period_ms: u64, burst: u32) -> Result<()> {
        // An instant jump, but still a transaction: it must preempt any
        // in-flight ramp or the old ramp would keep overriding the rate.
        self.set_rate_ramped(events_per_period, period_ms, burst, UNBOUNDED_RAMP)
    }

    fn cancel_all(&self, error: InvocationError) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.delegate.cancel_all(error);
    }
}

impl RampUpRateLimiter for RampedRateLimiter {
    fn set_rate_ramped(
        &self,
        events_per_period: f64,
        period_ms: u64,
        burst: u32,
        ramp_permits_per_second: f64,
    ) -> Result<()> {
        if !events_per_period.is_finite() || events_per_period < 0.0 {
            return Err(FloodgateError::InvalidArgument(
                "events_per_period",
                format!("must be finite and non-negative, got {}", events_per_period),
            ));
        }
        if period_ms == 0 {
            return Err(FloodgateError::InvalidArgument(
                "period_ms",
                "must be positive".to_string(),
            ));
        }
        if burst == 0 {
            return Err(FloodgateError::InvalidArgument(
                "burst",
                "must be positive".to_string(),
            ));
        }
        if ramp_permits_per_second.is_nan() || ramp_permits_per_second <= 0.0 {
            return Err(FloodgateError::InvalidArgument(
                "ramp_permits_per_second",
                format!("must be positive, got {}", ramp_permits_per_second),
            ));
        }

        let txn = self.shared.latest_txn.fetch_add(1, Ordering::AcqRel) + 1;
        let step = Step {
            txn,
            events: events_per_period,
            period_ms,
            burst,
            ramp_per_second: ramp_permits_per_second,
        };
        trace!(
            txn,
            target = events_per_period,
            period_ms,
            "Ramp transaction issued"
        );

        if self.steps.send(step).is_err() {
            debug!("Ramp worker is gone; step dropped");
        }
        Ok(())
    }
}

/// Worker serializing ramp steps. Holds at most one delayed re-step and
/// races it against the incoming queue, so a sleeping re-step never blocks a
/// newer configuration change.
struct StepWorker {
    delegate: Arc<dyn AsyncRateLimiter>,
    shared: Arc<RampShared>,
    steps: mpsc::UnboundedReceiver<Step>,
    delayed: Option<(Instant, Step)>,
}

impl StepWorker {
    async fn run(mut self) {
        loop {
            let step = if let Some((at, delayed)) = self.delayed {
                tokio::select! {
                    incoming = self.steps.recv() => match incoming {
                        Some(step) => step,
                        None => break,
                    },
                    _ = tokio::time::sleep_until(at) => {
                        self.delayed = None;
                        delayed
                    }
                }
            } else {
                match self.steps.recv().await {
                    Some(step) => step,
                    None => break,
                }
            };

            self.execute(step);
        }
    }

    fn execute(&mut self, step: Step) {
        if self.shared.cancelled.load(Ordering::Acquire) {
            trace!(txn = step.txn, "Limiter cancelled; ramp step discarded");
            return;
        }

        let current = self.delegate.rate();
        let current_per_ms = current.per_ms();
        let target_per_ms = step.events / step.period_ms as f64;

        // Decreases and already-reached targets apply in one shot.
        if target_per_ms <= current_per_ms {
            self.apply(&step, step.events);
            return;
        }

        // A newer transaction owns the rate now.
        if self.shared.latest_txn.load(Ordering::Acquire) != step.txn {
            trace!(txn = step.txn, "Ramp step preempted");
            return;
        }

        let next_per_ms = target_per_ms.min(current_per_ms + step.ramp_per_second / 1000.0);
        self.apply(&step, next_per_ms * step.period_ms as f64);

        if next_per_ms < target_per_ms {
            self.delayed = Some((Instant::now() + STEP_INTERVAL, step));
            trace!(txn = step.txn, next = next_per_ms, "Next ramp step scheduled");
        } else {
            debug!(txn = step.txn, target = step.events, "Ramp converged");
        }
    }

    fn apply(&self, step: &Step, events: f64) {
        if let Err(e) = self.delegate.set_rate(events, step.period_ms, step.burst) {
            // Arguments were validated at submission; a delegate refusal
            // here is unexpected but must not kill the worker.
            warn!(txn = step.txn, error = %e, "Delegate rejected ramp step");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::{Mutex, RwLock};

    /// Delegate that records every applied rate.
    struct RecordingLimiter {
        rate: RwLock<Rate>,
        applied: Mutex<Vec<f64>>,
        cancelled: AtomicBool,
    }

    impl RecordingLimiter {
        fn new() -> Self {
            Self {
                rate: RwLock::new(Rate::ZERO),
                applied: Mutex::new(Vec::new()),
                cancelled: AtomicBool::new(false),
            }
        }

        fn applied(&self) -> Vec<f64> {
            self.applied.lock().clone()
        }
    }

    impl AsyncRateLimiter for RecordingLimiter {
        fn submit(&self, _callback: Arc<dyn Callback>) {}

        fn rate(&self) -> Rate {
            *self.rate.read()
        }

        fn set_rate(&self, events_per_period: f64, period_ms: u64, burst: u32) -> Result<()> {
            let rate = Rate::new(events_per_period, period_ms as f64, burst)?;
            *self.rate.write() = rate;
            self.applied.lock().push(events_per_period);
            Ok(())
        }

        fn cancel_all(&self, _error: InvocationError) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    fn assert_monotonic_with_max_step(applied: &[f64], max_step: f64) {
        for window in applied.windows(2) {
            assert!(window[1] >= window[0], "ramp decreased: {:?}", applied);
            assert!(
                window[1] - window[0] <= max_step + 1e-6,
                "ramp step too large: {:?}",
                applied
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_increase_ramps_in_per_second_steps() {
        let delegate = Arc::new(RecordingLimiter::new());
        let ramped = RampedRateLimiter::new(delegate.clone());

        ramped.set_rate_ramped(100.0, 1000, 100, 10.0).unwrap();
        settle().await;

        // First step applies immediately.
        assert_eq!(delegate.applied().len(), 1);
        assert!((delegate.applied()[0] - 10.0).abs() < 1e-6);

        // Halfway there after four more seconds.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        settle().await;
        assert_eq!(delegate.applied().len(), 5);
        assert!(delegate.rate().events() < 100);

        // Converged after ten steps in total, never stepping by more than
        // the ramp amount.
        tokio::time::sleep(Duration::from_millis(5500)).await;
        settle().await;
        let applied = delegate.applied();
        assert_eq!(applied.len(), 10);
        assert_monotonic_with_max_step(&applied, 10.0);
        assert_eq!(delegate.rate().events(), 100);

        // No further steps once converged.
        tokio::time::sleep(Duration::from_millis(3000)).await;
        settle().await;
        assert_eq!(delegate.applied().len(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decrease_applies_immediately() {
        let delegate = Arc::new(RecordingLimiter::new());
        let ramped = RampedRateLimiter::new(delegate.clone());
        delegate.set_rate(100.0, 1000, 100).unwrap();

        ramped.set_rate_ramped(10.0, 1000, 10, 5.0).unwrap();
        settle().await;

        assert_eq!(delegate.rate().events(), 10);
        // One application beyond the direct seed call, no stepping.
        assert_eq!(delegate.applied().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_transaction_preempts_older_ramp() {
        let delegate = Arc::new(RecordingLimiter::new());
        let ramped = RampedRateLimiter::new(delegate.clone());

        ramped.set_rate_ramped(50.0, 1000, 50, 10.0).unwrap();
        ramped.set_rate_ramped(100.0, 1000, 100, 20.0).unwrap();

        tokio::time::sleep(Duration::from_millis(10_000)).await;
        settle().await;

        // Only the newer ramp ever applied: 20/s steps, converging on 100.
        let applied = delegate.applied();
        assert_eq!(applied.len(), 5);
        assert_monotonic_with_max_step(&applied, 20.0);
        assert_eq!(delegate.rate().events(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_set_rate_jumps_and_preempts() {
        let delegate = Arc::new(RecordingLimiter::new());
        let ramped = RampedRateLimiter::new(delegate.clone());

        ramped.set_rate_ramped(100.0, 1000, 100, 1.0).unwrap();
        settle().await;
        assert_eq!(delegate.rate().events(), 1);

        ramped.set_rate(40.0, 1000, 40).unwrap();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        settle().await;

        // The jump landed and the slow ramp stopped stepping past it.
        assert_eq!(delegate.rate().events(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_discards_pending_steps() {
        let delegate = Arc::new(RecordingLimiter::new());
        let ramped = RampedRateLimiter::new(delegate.clone());

        ramped.set_rate_ramped(100.0, 1000, 100, 10.0).unwrap();
        settle().await;
        assert_eq!(delegate.applied().len(), 1);

        let error: InvocationError =
            Arc::new(FloodgateError::Config("shutting down".to_string()));
        ramped.cancel_all(error);

        tokio::time::sleep(Duration::from_millis(5000)).await;
        settle().await;

        assert_eq!(delegate.applied().len(), 1);
        assert!(delegate.cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_argument_validation() {
        let delegate = Arc::new(RecordingLimiter::new());
        let ramped = RampedRateLimiter::new(delegate.clone());

        assert!(ramped.set_rate_ramped(-1.0, 1000, 1, 1.0).is_err());
        assert!(ramped.set_rate_ramped(1.0, 0, 1, 1.0).is_err());
        assert!(ramped.set_rate_ramped(1.0, 1000, 0, 1.0).is_err());
        assert!(ramped.set_rate_ramped(1.0, 1000, 1, 0.0).is_err());
        assert!(ramped.set_rate_ramped(1.0, 1000, 1, -2.0).is_err());
        assert!(ramped
            .set_rate_ramped(1.0, 1000, 1, f64::NAN)
            .is_err());

        settle().await;
        assert!(delegate.applied().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ramps_compose_with_the_engine() {
        use crate::limiter::engine::SteadyRateLimiter;

        let engine = Arc::new(
            SteadyRateLimiter::new(16, Duration::from_secs(60)).unwrap(),
        );
        let ramped = RampedRateLimiter::new(engine.clone());

        ramped.set_rate_ramped(20.0, 1000, 20, 10.0).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;

        assert_eq!(ramped.rate().events(), 20);
        assert_eq!(engine.rate().events(), 20);
    }
}
