//! Single-shot request expiration timers.
//!
//! One dedicated thread sleeps until the earliest pending deadline and
//! invokes the expiration callback with the request id. Callbacks carry only
//! the id: the receiver re-resolves the request through its own maps and
//! no-ops when it is already gone, so timers never extend a request's
//! lifetime. A timer fires at most once and is cancelled idempotently.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

type ExpirationCallback = Box<dyn Fn(&str) + Send + Sync>;

struct State {
    deadlines: HashMap<String, Instant>,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    callback: ExpirationCallback,
}

pub struct ExpiryService {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl ExpiryService {
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State { deadlines: HashMap::new(), shutdown: false }),
            cv: Condvar::new(),
            callback: Box::new(callback),
        });
        let worker = Arc::clone(&inner);
        let thread = std::thread::Builder::new()
            .name("request-expiry".to_string())
            .spawn(move || run(&worker))
            .ok();
        Self { inner, thread }
    }

    /// Arm (or re-arm) the timer of a request. A later `schedule` for the
    /// same id replaces the earlier deadline.
    pub fn schedule(&self, id: &str, timeout: Duration) {
        trace!(id, timeout_sec = timeout.as_secs(), "scheduling expiration");
        let mut state = lock(&self.inner.state);
        state.deadlines.insert(id.to_string(), Instant::now() + timeout);
        drop(state);
        self.inner.cv.notify_all();
    }

    /// Disarm the timer of a request. Safe to call any number of times.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = lock(&self.inner.state);
        let removed = state.deadlines.remove(id).is_some();
        drop(state);
        if removed {
            self.inner.cv.notify_all();
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn num_pending(&self) -> usize {
        lock(&self.inner.state).deadlines.len()
    }
}

impl Drop for ExpiryService {
    fn drop(&mut self) {
        {
            let mut state = lock(&self.inner.state);
            state.shutdown = true;
        }
        self.inner.cv.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn lock(mutex: &Mutex<State>) -> std::sync::MutexGuard<'_, State> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn run(inner: &Arc<Inner>) {
    let mut state = lock(&inner.state);
    loop {
        if state.shutdown {
            return;
        }
        let now = Instant::now();
        let next = state.deadlines.values().min().copied();
        match next {
            Some(deadline) if deadline <= now => {
                // Collect everything due, fire outside the lock.
                let due: Vec<String> = state
                    .deadlines
                    .iter()
                    .filter(|(_, d)| **d <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in &due {
                    state.deadlines.remove(id);
                }
                drop(state);
                for id in &due {
                    debug!(id, "request expired");
                    (inner.callback)(id);
                }
                state = lock(&inner.state);
            }
            Some(deadline) => {
                let wait = deadline.duration_since(now);
                state = match inner.cv.wait_timeout(state, wait) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }
            None => {
                state = match inner.cv.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
            }
        }
    }
}
