//! Monotonic time and the sleep-to-deadline primitive shared by the
//! worker threads.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Monotonic clock with microsecond resolution, anchored at an epoch so
/// every time value inside the transport is a plain `u64` of microseconds.
/// Wall time is never sampled on the packet path.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Microseconds elapsed since this clock was created.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Converts a microsecond reading back to an `Instant` for condvar
    /// deadlines.
    pub fn instant_at(&self, time_us: u64) -> Instant {
        self.epoch + Duration::from_micros(time_us)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

struct EventState {
    signaled: bool,
    interrupted: bool,
}

/// Condvar-backed event used by the send and receive workers to sleep
/// until a deadline. Another thread can cut the sleep short at any time
/// by calling [`SyncEvent::notify`] (new work, a sooner deadline) or
/// permanently with [`SyncEvent::interrupt`] (shutdown).
pub struct SyncEvent {
    state: Mutex<EventState>,
    cond: Condvar,
}

impl SyncEvent {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EventState {
                signaled: false,
                interrupted: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Sleeps until `deadline` passes or a notification arrives.
    /// Returns `true` if woken by a notification, `false` on timeout.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.interrupted {
                return true;
            }
            if state.signaled {
                state.signaled = false;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, timeout) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            if timeout.timed_out() && !state.signaled && !state.interrupted {
                return false;
            }
        }
    }

    /// Sleeps for at most `timeout`. Same return contract as
    /// [`SyncEvent::wait_until`].
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.wait_until(Instant::now() + timeout)
    }

    /// Wakes one sleeping thread. The wakeup is sticky: if nobody is
    /// waiting right now, the next wait returns immediately.
    pub fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        state.signaled = true;
        self.cond.notify_one();
    }

    /// Wakes everyone permanently; used for shutdown.
    pub fn interrupt(&self) {
        let mut state = self.state.lock().unwrap();
        state.interrupted = true;
        self.cond.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().unwrap().interrupted
    }
}

impl Default for SyncEvent {
    fn default() -> Self {
        Self::new()
    }
}
