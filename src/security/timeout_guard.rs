//! Wall-clock timeout enforcement via watchdog thread.
//!
//! The guard spawns a watchdog thread that raises the isolate's
//! termination signal if Phase 2 script execution outlives the timeout.
//! It is armed only around user-script execution, never around marshaling
//! work. A zero timeout disables the guard entirely (no thread).
//!
//! ## How it works
//!
//! 1. Guard spawns a watchdog thread with a timeout duration
//! 2. Thread sleeps until timeout or cancellation
//! 3. On timeout: raises the termination signal; running script observes
//!    it at the next interrupt check and unwinds
//! 4. On drop: sends cancellation, joins the thread, and clears the
//!    termination signal if it fired so the isolate stays usable

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::engine::isolate::IsolateHandle;

/// RAII guard bounding script execution to a wall-clock duration.
pub(crate) struct TimeoutGuard {
    /// Channel to send cancellation signal to the watchdog
    cancel_tx: Option<mpsc::Sender<()>>,
    /// Handle to join the watchdog thread
    thread_handle: Option<thread::JoinHandle<()>>,
    /// Flag set when the timeout fired
    triggered: Arc<AtomicBool>,
    handle: IsolateHandle,
}

impl TimeoutGuard {
    /// Arm a watchdog for `timeout_ms` milliseconds. Zero disables the
    /// guard (no watchdog thread).
    pub(crate) fn new(handle: IsolateHandle, timeout_ms: u32) -> Self {
        let triggered = Arc::new(AtomicBool::new(false));

        if timeout_ms == 0 {
            return Self {
                cancel_tx: None,
                thread_handle: None,
                triggered,
                handle,
            };
        }

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let watchdog_triggered = Arc::clone(&triggered);
        let watchdog_handle = handle.clone();

        let thread_handle = thread::Builder::new()
            .name("timeout-watchdog".into())
            .spawn(move || {
                let timeout = Duration::from_millis(u64::from(timeout_ms));

                match cancel_rx.recv_timeout(timeout) {
                    // Cancelled before timeout - normal completion
                    Ok(()) => {}
                    // Timeout expired - interrupt execution
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        tracing::warn!(timeout_ms, "wall-clock timeout, terminating script");
                        watchdog_triggered.store(true, Ordering::SeqCst);
                        watchdog_handle.terminate_execution();
                    }
                    // Guard dropped without explicit cancel
                    Err(mpsc::RecvTimeoutError::Disconnected) => {}
                }
            })
            .expect("failed to spawn timeout watchdog thread");

        Self {
            cancel_tx: Some(cancel_tx),
            thread_handle: Some(thread_handle),
            triggered,
            handle,
        }
    }

    /// Whether the timeout fired. Use after execution to decide whether a
    /// termination unwound because of this guard.
    pub(crate) fn was_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            // Ignore error if the watchdog already exited.
            let _ = cancel_tx.send(());
        }

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::warn!("timeout watchdog thread panicked");
            }
        }

        // Leave the isolate usable for the next task.
        if self.was_triggered() {
            self.handle.clear_termination();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{IsolateOptions, Scheduler};

    #[test]
    fn test_disabled_guard_has_no_watchdog() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        let guard = TimeoutGuard::new(isolate.handle(), 0);
        assert!(!guard.was_triggered());
        assert!(guard.cancel_tx.is_none());
        assert!(guard.thread_handle.is_none());
    }

    #[test]
    fn test_guard_fires_and_clears_on_drop() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        let guard = TimeoutGuard::new(isolate.handle(), 10);
        while !guard.was_triggered() {
            std::thread::sleep(Duration::from_millis(1));
        }
        isolate.with_lock(|scope| {
            assert!(scope.check_interrupt().is_err());
        });
        drop(guard);
        isolate.with_lock(|scope| {
            assert!(scope.check_interrupt().is_ok());
        });
    }

    #[test]
    fn test_guard_cancelled_before_timeout() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        let guard = TimeoutGuard::new(isolate.handle(), 60_000);
        drop(guard);
        isolate.with_lock(|scope| {
            assert!(scope.check_interrupt().is_ok());
        });
    }
}
