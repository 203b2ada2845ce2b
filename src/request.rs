//! # Completion Futures
//!
//! A small utility pairing completion flags with the progress/trigger loop
//! that resolves them. The [`RequestClass`] is constructed with two
//! closures: a progress function that drives the transport for a bounded
//! slice of time, and a trigger function that drains the completion queue.
//! [`RequestClass::wait`] alternates the two until the future completes or
//! the caller's budget runs out.
//!
//! The same future works in two driving modes: the waiter can drive
//! progress itself (single-threaded), or a dedicated thread can drive
//! progress while waiters merely observe completion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, ReturnCode};

/// Bound on a single progress call inside a wait loop, so a waiter
/// re-checks its flag at a reasonable rate even when nothing completes.
const PROGRESS_SLICE: Duration = Duration::from_millis(100);

/// Drives the transport for up to the given duration. A `TIMEOUT` return
/// means no event was handled, which is not an error for the wait loop.
pub type ProgressFn = Box<dyn Fn(Duration) -> Result<()> + Send + Sync>;

/// Drains completion callbacks for up to the given duration; returns
/// whether any callback ran.
pub type TriggerFn = Box<dyn Fn(Duration) -> Result<bool> + Send + Sync>;

struct FutureShared {
    completed: Mutex<bool>,
    cond: Condvar,
}

/// A one-shot completion future resolved by the progress loop.
///
/// Cloning is cheap; all clones observe the same completion.
#[derive(Clone)]
pub struct RequestFuture {
    shared: Arc<FutureShared>,
}

impl RequestFuture {
    /// Whether the future has completed.
    pub fn is_complete(&self) -> bool {
        *self.shared.completed.lock()
    }

    /// Mark the future complete and wake any waiter.
    pub fn complete(&self) {
        let mut completed = self.shared.completed.lock();
        *completed = true;
        self.shared.cond.notify_all();
    }
}

/// Factory tying futures to a progress/trigger pair.
pub struct RequestClass {
    progress: ProgressFn,
    trigger: TriggerFn,
}

impl RequestClass {
    pub fn new(progress: ProgressFn, trigger: TriggerFn) -> Arc<RequestClass> {
        Arc::new(RequestClass { progress, trigger })
    }

    /// Create a fresh, incomplete future.
    pub fn request(&self) -> RequestFuture {
        RequestFuture {
            shared: Arc::new(FutureShared {
                completed: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    /// Wait until the future completes or `timeout` elapses.
    ///
    /// Returns `Ok(true)` when the future completed, `Ok(false)` on
    /// timeout. A zero timeout performs exactly one completion check. The
    /// loop calls progress on a bounded slice of the remaining budget, then
    /// drains the completion queue, then re-checks the flag, so completions
    /// produced by other threads are observed promptly.
    pub fn wait(&self, request: &RequestFuture, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if request.is_complete() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let slice = (deadline - now).min(PROGRESS_SLICE);
            match (self.progress)(slice) {
                Ok(()) | Err(ReturnCode::Timeout) => {}
                Err(e) => return Err(e),
            }
            (self.trigger)(Duration::ZERO)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn idle_class() -> Arc<RequestClass> {
        RequestClass::new(
            Box::new(|_| Err(ReturnCode::Timeout)),
            Box::new(|_| Ok(false)),
        )
    }

    #[test]
    fn test_wait_zero_timeout_reports_current_state() {
        let class = idle_class();
        let future = class.request();
        assert!(!class.wait(&future, Duration::ZERO).unwrap());
        future.complete();
        assert!(class.wait(&future, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_wait_times_out_without_completion() {
        let class = idle_class();
        let future = class.request();
        let start = Instant::now();
        assert!(!class.wait(&future, Duration::from_millis(30)).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_progress_driven_completion() {
        // Progress "discovers" the event on its third call; trigger
        // resolves the future, mimicking a callback drain.
        let future_slot: Arc<Mutex<Option<RequestFuture>>> = Arc::new(Mutex::new(None));
        let polls = Arc::new(AtomicU32::new(0));

        let polls2 = polls.clone();
        let polls3 = polls.clone();
        let slot2 = future_slot.clone();
        let class = RequestClass::new(
            Box::new(move |_| {
                if polls2.fetch_add(1, Ordering::SeqCst) >= 2 {
                    Ok(())
                } else {
                    Err(ReturnCode::Timeout)
                }
            }),
            Box::new(move |_| {
                // The "event" only exists once progress discovered it.
                if polls3.load(Ordering::SeqCst) >= 3 {
                    if let Some(f) = slot2.lock().as_ref() {
                        f.complete();
                        return Ok(true);
                    }
                }
                Ok(false)
            }),
        );

        let future = class.request();
        *future_slot.lock() = Some(future.clone());
        assert!(class.wait(&future, Duration::from_secs(5)).unwrap());
        assert!(polls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_externally_driven_completion() {
        let class = idle_class();
        let future = class.request();
        let remote = future.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.complete();
        });
        assert!(class.wait(&future, Duration::from_secs(5)).unwrap());
        handle.join().unwrap();
    }
}
