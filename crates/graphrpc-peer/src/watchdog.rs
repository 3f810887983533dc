use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

struct TimerState {
    // `None` while disarmed: after expiry, until the next feed.
    deadline: Option<Instant>,
    stopped: bool,
    // Set while `on_expire` runs outside the lock.
    firing: bool,
}

struct Timer {
    state: Mutex<TimerState>,
    changed: Condvar,
}

impl Timer {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A single-deadline liveness timer running on its own thread.
///
/// Every [`Watchdog::feed`] pushes the deadline `timeout` into the future.
/// When the deadline passes, `on_expire` runs once on the timer thread and
/// the watchdog stays disarmed until fed again.
///
/// Stopping never waits on `on_expire`: if the callback is running, the
/// thread is detached and exits once it returns.
pub(crate) struct Watchdog {
    timer: Arc<Timer>,
    timeout: Duration,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn start(
        timeout: Duration,
        on_expire: impl Fn(Duration) + Send + 'static,
    ) -> std::io::Result<Self> {
        let timer = Arc::new(Timer {
            state: Mutex::new(TimerState {
                deadline: Some(Instant::now() + timeout),
                stopped: false,
                firing: false,
            }),
            changed: Condvar::new(),
        });

        let thread_timer = Arc::clone(&timer);
        let thread = thread::Builder::new()
            .name("graphrpc-watchdog".to_string())
            .spawn(move || run(thread_timer, timeout, on_expire))?;

        debug!(?timeout, "watchdog started");
        Ok(Self {
            timer,
            timeout,
            thread: Some(thread),
        })
    }

    pub fn feed(&self) {
        self.timer.lock().deadline = Some(Instant::now() + self.timeout);
        self.timer.changed.notify_all();
    }

    pub fn stop(&mut self) {
        let firing = {
            let mut state = self.timer.lock();
            state.stopped = true;
            state.firing
        };
        self.timer.changed.notify_all();

        if let Some(handle) = self.thread.take() {
            if firing || handle.thread().id() == thread::current().id() {
                debug!("watchdog detached while expiring");
            } else {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(timer: Arc<Timer>, timeout: Duration, on_expire: impl Fn(Duration)) {
    let mut state = timer.lock();
    loop {
        if state.stopped {
            break;
        }
        let now = Instant::now();
        match state.deadline {
            Some(deadline) if now >= deadline => {
                state.deadline = None;
                state.firing = true;
                drop(state);
                on_expire(timeout);
                state = timer.lock();
                state.firing = false;
            }
            Some(deadline) => {
                state = timer
                    .changed
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            None => {
                state = timer
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }
    debug!("watchdog stopped");
}
