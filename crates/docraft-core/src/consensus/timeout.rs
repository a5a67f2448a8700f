//! Election timeout
//!
//! A deferrable deadline. While started, a timer thread sleeps until
//! `last_deferred + timeout`; if nobody deferred in the meantime it stops
//! and runs the expiry callback once. Restarting or stopping bumps a
//! generation counter so stale timer threads exit without firing.

use crate::Result;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

struct TimerState {
    last_deferred: Instant,
    running: bool,
    generation: u64,
    deferrals: u64,
}

struct Shared {
    state: Mutex<TimerState>,
    signal: Condvar,
    timeout: Duration,
}

/// Deferrable election timeout
#[derive(Clone)]
pub struct TimeoutEvent {
    inner: Arc<Shared>,
}

impl TimeoutEvent {
    /// Create a stopped timer
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Shared {
                state: Mutex::new(TimerState {
                    last_deferred: Instant::now(),
                    running: false,
                    generation: 0,
                    deferrals: 0,
                }),
                signal: Condvar::new(),
                timeout,
            }),
        }
    }

    /// Configured timeout
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Push the deadline back by a full timeout
    pub fn defer(&self) {
        let mut state = self.inner.state.lock();
        state.last_deferred = Instant::now();
        state.deferrals += 1;
    }

    /// Number of deferrals so far
    pub fn deferrals(&self) -> u64 {
        self.inner.state.lock().deferrals
    }

    /// Whether a timer thread is armed
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Arm the timer, replacing any previous one. `on_expire` runs on the
    /// timer thread.
    pub fn start<F>(&self, on_expire: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let generation = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            state.running = true;
            state.last_deferred = Instant::now();
            state.generation
        };
        self.inner.signal.notify_all();

        let shared = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("election-timeout".to_string())
            .spawn(move || {
                let mut state = shared.state.lock();
                loop {
                    if !state.running || state.generation != generation {
                        return;
                    }
                    let deadline = state.last_deferred + shared.timeout;
                    let now = Instant::now();
                    if now >= deadline {
                        state.running = false;
                        break;
                    }
                    shared.signal.wait_for(&mut state, deadline - now);
                }
                drop(state);

                tracing::debug!("Election timeout expired after {:?}", shared.timeout);
                on_expire();
            })?;
        Ok(())
    }

    /// Disarm the timer without firing
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.running = false;
            state.generation += 1;
        }
        self.inner.signal.notify_all();
    }
}
