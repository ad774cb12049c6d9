//! Cancellable periodic tasks and reentrancy guards.
//!
//! Every timer in the engine (offer poll, location ping, countdown) is a
//! [`PeriodicTask`] owned by the component that drives it.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// First tick fires right away.
    Immediate,
    /// First tick fires one period after start.
    AfterPeriod,
}

#[derive(Debug)]
struct Running {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

/// A tokio task that calls a tick closure on a fixed period until stopped.
///
/// Start and stop are idempotent. Ticks that fall behind are skipped rather
/// than bunched. After [`PeriodicTask::stop`] returns no new tick starts, and
/// a tick in progress is aborted at its next await point.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl PeriodicTask {
    #[must_use]
    pub fn new(name: &'static str, period: Duration) -> Self {
        Self {
            name,
            period: period.max(Duration::from_millis(1)),
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Starts the task. Returns `false` if it was already running.
    ///
    /// The tick closure returns [`ControlFlow::Break`] to end the task from
    /// the inside.
    pub fn start<F, Fut>(&self, mode: StartMode, tick: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = self.period;
        let name = self.name;
        let handle = tokio::spawn(async move {
            let start = match mode {
                StartMode::Immediate => Instant::now(),
                StartMode::AfterPeriod => Instant::now() + period,
            };
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = interval.tick() => {
                        if tick().await.is_break() {
                            debug!(task = name, "periodic task finished itself");
                            break;
                        }
                    }
                }
            }
        });

        debug!(task = name, period_ms = period.as_millis(), ?mode, "periodic task started");
        *running = Some(Running {
            stop_tx: Some(stop_tx),
            handle,
        });
        true
    }

    /// Stops the task. Returns `false` if it was not running.
    ///
    /// Safe to call from inside the tick closure.
    pub fn stop(&self) -> bool {
        let Some(mut running) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return false;
        };
        if let Some(stop_tx) = running.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        running.handle.abort();
        debug!(task = self.name, "periodic task stopped");
        true
    }

    /// Stops the task and waits until it has fully unwound. Must not be
    /// called from inside the tick closure.
    pub async fn stop_and_wait(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut running) = running {
            if let Some(stop_tx) = running.stop_tx.take() {
                let _ = stop_tx.send(());
            }
            running.handle.abort();
            // A cancelled join error is the expected outcome here.
            let _ = running.handle.await;
            debug!(task = self.name, "periodic task stopped and joined");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// At most one operation in flight. A second caller is turned away rather
/// than queued.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

#[must_use = "the flight ends when the guard is dropped"]
#[derive(Debug)]
pub struct FlightGuard<'a> {
    busy: &'a AtomicBool,
}

impl SingleFlight {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    pub fn try_begin(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { busy: &self.busy })
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
