use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const WAIT_SLICE: Duration = Duration::from_secs(1);

/// Ownership token passed back and forth between two cooperating workers.
///
/// Only the worker whose tag matches the current owner may touch the shared
/// output tree. The token is not reentrant and is never taken back: a worker
/// that does not call [`HandoffToken::release_to`] stalls its peer.
#[derive(Debug)]
pub struct HandoffToken {
    owner: Mutex<String>,
    changed: Condvar,
}

impl HandoffToken {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: Mutex::new(owner.to_string()),
            changed: Condvar::new(),
        }
    }

    pub fn owner(&self) -> String {
        self.owner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Blocks until `tag` owns the token. Returns false if `timeout` elapses first.
    pub fn acquire(&self, tag: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut owner = self.owner.lock().unwrap_or_else(|e| e.into_inner());
        while *owner != tag {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            owner = match self.changed.wait_timeout(owner, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Like [`HandoffToken::acquire`] but gives up as soon as `stop` fires.
    pub fn acquire_or_stop(&self, tag: &str, stop: &Receiver<()>) -> bool {
        loop {
            if self.acquire(tag, WAIT_SLICE) {
                return true;
            }
            if stop_requested(stop) {
                return false;
            }
        }
    }

    pub fn release_to(&self, tag: &str) {
        let mut owner = self.owner.lock().unwrap_or_else(|e| e.into_inner());
        *owner = tag.to_string();
        self.changed.notify_all();
    }
}

/// True when a stop message arrived or every sender is gone.
pub fn stop_requested(stop: &Receiver<()>) -> bool {
    !matches!(stop.try_recv(), Err(crossbeam_channel::TryRecvError::Empty))
}

/// Sleeps for `total` in slices of at most one second. Returns true if stopped.
pub fn sleep_or_stop(stop: &Receiver<()>, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        match stop.recv_timeout((deadline - now).min(WAIT_SLICE)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return true,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}
