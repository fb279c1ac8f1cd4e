//! Coalescing long-poll waiter with exponential backoff.
//!
//! At most one wait is outstanding at a time. A new `wait()` releases the
//! previous one immediately, so a client that re-polls never leaves a stale
//! request parked on the server. Successive uncontested waits grow
//! geometrically from `base` up to `max`:
//!
//! ```text
//! wait #1 ─ base ─┐
//! wait #2 ─ base·m ──────┐
//! wait #3 ─ base·m² ───────────────┐   (capped at max)
//! pulse() ─► completes the outstanding wait now
//! reset() ─► next wait starts at base again
//! ```
//!
//! Registration happens when `wait()` is called; the returned future only
//! sleeps. All state changes serialize on one lock; the delay runs outside it.

use log::debug;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaiterConfig {
    /// First wait duration, and the duration after a reset (default: 10ms).
    pub base: Duration,
    /// Growth factor between uncontested waits (default: 2).
    pub multiplier: f64,
    /// Upper bound on a single wait (default: 5 minutes).
    pub max: Duration,
}

impl Default for WaiterConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(10),
            multiplier: 2.0,
            max: Duration::from_secs(5 * 60),
        }
    }
}

impl WaiterConfig {
    /// Short waits for tests.
    pub fn for_testing() -> Self {
        Self {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(2),
        }
    }

    /// Fixed-duration waits.
    pub fn constant(duration: Duration) -> Self {
        Self {
            base: duration,
            multiplier: 1.0,
            max: duration,
        }
    }

    pub fn validate(&self) -> Result<(), WaiterError> {
        if self.base.is_zero() {
            return Err(WaiterError::InvalidConfig("base duration must be positive".into()));
        }
        if !(self.multiplier >= 1.0) {
            return Err(WaiterError::InvalidConfig("multiplier must be at least 1".into()));
        }
        if self.max < self.base {
            return Err(WaiterError::InvalidConfig(
                "max duration must not be smaller than the base duration".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaiterError {
    InvalidConfig(String),
}

impl std::fmt::Display for WaiterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaiterError::InvalidConfig(e) => write!(f, "Invalid waiter configuration: {e}"),
        }
    }
}

impl std::error::Error for WaiterError {}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Released by `pulse`, `reset` or a newer `wait`.
    Signaled,
    TimedOut,
}

struct Pending {
    ticket: u64,
    tx: oneshot::Sender<()>,
}

struct WaiterState {
    duration: Duration,
    pending: Option<Pending>,
    next_ticket: u64,
}

impl WaiterState {
    fn release(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                let _ = pending.tx.send(());
                true
            }
            None => false,
        }
    }
}

pub struct AtMostOneAwaiter {
    config: WaiterConfig,
    state: Arc<Mutex<WaiterState>>,
}

impl std::fmt::Debug for AtMostOneAwaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtMostOneAwaiter")
            .field("config", &self.config)
            .field("current_duration", &self.current_duration())
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

impl AtMostOneAwaiter {
    pub fn new(config: WaiterConfig) -> Result<Self, WaiterError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(WaiterState {
                duration: config.base,
                pending: None,
                next_ticket: 0,
            })),
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: WaiterConfig::default(),
            state: Arc::new(Mutex::new(WaiterState {
                duration: WaiterConfig::default().base,
                pending: None,
                next_ticket: 0,
            })),
        }
    }

    pub fn config(&self) -> &WaiterConfig {
        &self.config
    }

    /// Register a wait, releasing any outstanding one.
    ///
    /// The returned future resolves when this wait is released or its
    /// duration elapses.
    pub fn wait(&self) -> impl Future<Output = WaitOutcome> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let (ticket, duration) = {
            let mut state = self.lock();
            let duration = if state.release() {
                // The previous caller was pulsed out; this one starts over.
                state.duration = self.config.base;
                self.config.base
            } else {
                let current = state.duration;
                state.duration = self.next_duration(current);
                current
            };
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.pending = Some(Pending { ticket, tx });
            (ticket, duration)
        };
        debug!("Waiting up to {duration:?} for changes");

        let state = self.state.clone();
        async move {
            tokio::select! {
                _ = rx => WaitOutcome::Signaled,
                _ = tokio::time::sleep(duration) => {
                    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                    if state.pending.as_ref().map(|p| p.ticket) == Some(ticket) {
                        state.pending = None;
                    }
                    WaitOutcome::TimedOut
                }
            }
        }
    }

    /// Complete the outstanding wait, if any. Returns whether one was released.
    pub fn pulse(&self) -> bool {
        self.lock().release()
    }

    /// Restart the backoff at the base duration and release the outstanding
    /// wait, if any.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.duration = self.config.base;
        state.release();
    }

    /// Duration the next uncontested wait would use.
    pub fn current_duration(&self) -> Duration {
        self.lock().duration
    }

    pub fn is_waiting(&self) -> bool {
        self.lock().pending.is_some()
    }

    fn next_duration(&self, current: Duration) -> Duration {
        let micros = (current.as_micros() as f64 * self.config.multiplier).round();
        Duration::from_micros(micros as u64).min(self.config.max)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, WaiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
