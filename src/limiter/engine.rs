//! Single-threaded event-loop engine issuing permits at the configured rate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::buffer::{ExpiringCircularBuffer, ReadMode};
use crate::config::FloodgateConfig;
use crate::error::{FloodgateError, Result};

use super::dispatch::{DispatchTask, Dispatcher, TokioDispatcher};
use super::rate::Rate;
use super::{AsyncRateLimiter, Callback, CallbackStore, InvocationError};

/// Commands delivered to the scheduler worker.
enum Command {
    /// Work was submitted while the loop was idle.
    Wake,
    /// The shared rate was swapped; permit accounting must be recomputed.
    RateChanged,
}

/// State shared between caller threads and the scheduler worker. Callers
/// only swap references and bump counters here; permit accounting is owned
/// exclusively by the worker.
struct Shared {
    rate: RwLock<Rate>,
    invocation_error: OnceLock<InvocationError>,
    pending: AtomicUsize,
    store: Arc<dyn CallbackStore>,
}

/// An [`AsyncRateLimiter`] that dispatches queued callbacks at a steady,
/// dynamically adjustable rate and guarantees eventual delivery: after
/// [`cancel_all`](AsyncRateLimiter::cancel_all) the entire backlog, plus
/// anything submitted later, is drained at unlimited speed through each
/// callback's error path.
///
/// The engine owns a dedicated scheduler task fed by a command channel, so
/// the single-writer discipline over permit state is structural rather than
/// a usage convention. Construction must therefore happen inside a Tokio
/// runtime.
pub struct SteadyRateLimiter {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SteadyRateLimiter {
    /// Engine backed by an expiring ring store in [`ReadMode::Consume`]
    /// (each callback dispatched at most once) and the Tokio dispatcher.
    ///
    /// The initial rate is [`Rate::ZERO`]: nothing dispatches until
    /// [`set_rate`](AsyncRateLimiter::set_rate) is called.
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self> {
        let store: Arc<ExpiringCircularBuffer<Arc<dyn Callback>>> =
            Arc::new(ExpiringCircularBuffer::with_mode(
                capacity,
                ttl,
                ReadMode::Consume,
            )?);
        Ok(Self::with_parts(store, Arc::new(TokioDispatcher)))
    }

    /// Engine configured from a [`FloodgateConfig`].
    pub fn from_config(config: &FloodgateConfig) -> Result<Self> {
        let limiter = Self::new(
            config.buffer.capacity,
            Duration::from_millis(config.buffer.ttl_ms),
        )?;
        limiter.set_rate(
            config.rate.events_per_period,
            config.rate.period_ms,
            config.rate.burst,
        )?;
        Ok(limiter)
    }

    /// Engine over an explicit store and dispatcher.
    pub fn with_parts(store: Arc<dyn CallbackStore>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let shared = Arc::new(Shared {
            rate: RwLock::new(Rate::ZERO),
            invocation_error: OnceLock::new(),
            pending: AtomicUsize::new(0),
            store,
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let worker = Worker::new(Arc::clone(&shared), dispatcher, receiver);
        tokio::spawn(worker.run());

        Self { shared, commands }
    }

    /// Callbacks counted as buffered but not yet dispatched. Best-effort:
    /// TTL expiry and overwrite in a lossy store can make this an estimate.
    pub fn pending_tasks(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    fn send(&self, command: Command) {
        // The worker only exits once every sender is dropped, so a failed
        // send means the runtime itself is tearing down.
        if self.commands.send(command).is_err() {
            debug!("Scheduler worker is gone; command dropped");
        }
    }
}

impl AsyncRateLimiter for SteadyRateLimiter {
    fn submit(&self, callback: Arc<dyn Callback>) {
        self.shared.store.put(callback);
        // Wake the loop only on the idle -> busy transition.
        if self.shared.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            self.send(Command::Wake);
        }
    }

    fn rate(&self) -> Rate {
        *self.shared.rate.read()
    }

    fn set_rate(&self, events_per_period: f64, period_ms: u64, burst: u32) -> Result<()> {
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
        let rate = Rate::new(events_per_period, period_ms as f64, burst)?;

        debug!(
            events = rate.events_raw(),
            period_ms = rate.period_raw(),
            "Applying rate"
        );
        *self.shared.rate.write() = rate;
        self.send(Command::RateChanged);
        Ok(())
    }

    fn cancel_all(&self, error: InvocationError) {
        if self.shared.invocation_error.set(error).is_err() {
            error!("cancel_all invoked more than once; subsequent calls have no effect");
            return;
        }

        // Error delivery is not rate limited: drain at unlimited speed.
        *self.shared.rate.write() = Rate::MAX;
        self.send(Command::RateChanged);
    }
}

/// The scheduler worker: sole owner of permit accounting. Runs until every
/// command sender has been dropped.
struct Worker {
    shared: Arc<Shared>,
    dispatcher: Arc<dyn Dispatcher>,
    commands: mpsc::UnboundedReceiver<Command>,

    permit_time: Instant,
    permits_available: u32,
    permits_in_frame: u32,
    wake_at: Option<Instant>,
    running: bool,
}

impl Worker {
    fn new(
        shared: Arc<Shared>,
        dispatcher: Arc<dyn Dispatcher>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let rate = *shared.rate.read();
        Self {
            shared,
            dispatcher,
            commands,
            permit_time: Instant::now(),
            permits_available: rate.events(),
            permits_in_frame: rate.events(),
            wake_at: None,
            running: false,
        }
    }

    async fn run(mut self) {
        loop {
            let command = if self.running {
                // Busy: interleave pending commands without blocking.
                match self.commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(mpsc::error::TryRecvError::Empty) => None,
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                }
            } else if let Some(wake_at) = self.wake_at {
                // Waiting for the next period boundary.
                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(command) => Some(command),
                        None => break,
                    },
                    _ = tokio::time::sleep_until(wake_at) => {
                        self.wake_at = None;
                        self.running = true;
                        None
                    }
                }
            } else {
                // Idle until someone wakes us.
                match self.commands.recv().await {
                    Some(command) => Some(command),
                    None => break,
                }
            };

            match command {
                Some(Command::Wake) => self.running = true,
                Some(Command::RateChanged) => self.apply_rate_change(),
                None => {}
            }

            if self.running {
                self.tick();
                if self.running {
                    // Cooperative: let submissions and rate changes land
                    // between dispatches.
                    tokio::task::yield_now().await;
                }
            }
        }

        debug!(
            pending = self.shared.pending.load(Ordering::Acquire),
            "Scheduler worker exiting"
        );
    }

    /// Recompute permit accounting after the shared rate was swapped.
    /// Permits already used in the current period are carried over so a live
    /// change never double-issues within one period.
    fn apply_rate_change(&mut self) {
        let rate = *self.shared.rate.read();
        let new_events = rate.events();

        let used = self.permits_in_frame.saturating_sub(self.permits_available);
        self.permits_available = new_events.saturating_sub(used);
        self.permits_in_frame = new_events;
        self.running = true;

        trace!(
            available = self.permits_available,
            frame = new_events,
            "Rate change applied"
        );
    }

    /// One scheduler tick. Refills permits at period boundaries, dispatches
    /// while permits remain, and otherwise parks the loop (idle on an empty
    /// backlog, waiting on permit exhaustion).
    fn tick(&mut self) {
        let now = Instant::now();
        let rate = *self.shared.rate.read();
        let period = Duration::from_millis(rate.period());

        if now.duration_since(self.permit_time) >= period {
            self.permit_time = now;
            self.permits_available = rate.events();
            self.permits_in_frame = rate.events();
        }

        // Nothing buffered: idle until the next submission wakes us.
        if self.shared.pending.load(Ordering::Acquire) == 0 {
            self.running = false;
            return;
        }

        if self.permits_available > 0 {
            self.permits_available -= 1;
            match self.shared.store.take() {
                Ok(callback) => self.dispatch(callback),
                Err(_) => {
                    // The store drained ahead of the counter (TTL expiry or
                    // overwrite); resync and idle.
                    self.shared.pending.store(0, Ordering::Release);
                    self.running = false;
                }
            }
        } else {
            // Out of permits: wake at the next period boundary unless an
            // earlier wake is already scheduled.
            let boundary = self.permit_time + period;
            let wake_at = boundary.max(now);
            if self.wake_at.map_or(true, |at| at > wake_at || at <= now) {
                self.wake_at = Some(wake_at);
            }
            self.running = false;
        }
    }

    fn dispatch(&mut self, callback: Arc<dyn Callback>) {
        let outcome = self.shared.invocation_error.get().cloned();
        let task = DispatchTask::new(callback, outcome);

        if let Err(rejected) = self.dispatcher.dispatch(task) {
            // Last resort: deliver on the scheduler itself rather than lose
            // the callback. This also keeps the loop from outpacing a
            // refusing executor.
            warn!(
                reason = %rejected.reason,
                "Dispatch handoff failed; invoking callback on the scheduler"
            );
            let error: InvocationError =
                Arc::new(FloodgateError::DispatchRejected(rejected.reason));
            rejected.task.fail(error);
        }

        // pending > 0 was checked in this tick; only the worker decrements.
        if self.shared.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.running = false;
        }
    }
}
