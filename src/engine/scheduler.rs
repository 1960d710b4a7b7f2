//! Process-wide scheduler: one worker thread and FIFO queue per isolate.
//!
//! Work for a given isolate is funneled through its queue and executed
//! under its lock in submission order. Parallelism exists only across
//! isolates. Disposing an isolate closes its queue; tasks already queued
//! are cancelled with `"Isolate is disposed"` and the worker exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use crate::error::Error;

use super::isolate::{Isolate, IsolateHolder, IsolateOptions, QueueTask, TaskRun};
use super::value::IsolateId;

static NEXT_ISOLATE_ID: AtomicU64 = AtomicU64::new(1);

pub struct Scheduler {
    isolates: Mutex<Vec<Weak<IsolateHolder>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            isolates: Mutex::new(Vec::new()),
        }
    }

    /// Spawn an isolate with its own heap, queue, and worker thread.
    pub fn spawn(&self, options: IsolateOptions) -> Isolate {
        let id = IsolateId(NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed));
        let name = options.name.unwrap_or_else(|| id.to_string());
        let (sender, receiver) = mpsc::unbounded_channel();
        let holder = Arc::new(IsolateHolder::new(id, name.clone(), sender));

        let worker_holder = Arc::clone(&holder);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || isolate_worker(worker_holder, receiver))
            .expect("failed to spawn isolate worker thread");

        tracing::debug!(isolate = %id, name = %name, "spawned isolate");

        let mut isolates = self.isolates.lock().expect("scheduler registry poisoned");
        isolates.push(Arc::downgrade(&holder));
        Isolate { holder }
    }

    /// Number of live (undisposed) isolates.
    pub fn isolate_count(&self) -> usize {
        let isolates = self.isolates.lock().expect("scheduler registry poisoned");
        isolates
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|holder| !holder.is_disposed())
            .count()
    }

    /// Dispose every isolate spawned by this scheduler.
    pub fn shutdown(&self) {
        let holders: Vec<_> = {
            let isolates = self.isolates.lock().expect("scheduler registry poisoned");
            isolates.iter().filter_map(Weak::upgrade).collect()
        };
        for holder in holders {
            Isolate { holder }.dispose();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn isolate_worker(holder: Arc<IsolateHolder>, mut receiver: mpsc::UnboundedReceiver<QueueTask>) {
    while let Some(task) = receiver.blocking_recv() {
        if holder.is_disposed() {
            task(TaskRun::Cancel(Error::disposed()));
            continue;
        }
        let mut scope = holder.lock();
        task(TaskRun::Run(&mut scope));
    }
    tracing::debug!(isolate = %holder.id(), "isolate worker exiting");
}

/// A one-shot wait object a caller thread blocks on while the target
/// isolate works. Woken by task completion, promise settlement, or not at
/// all (in which case `wait_deadline` reports the expiry).
pub(crate) struct AsyncWait {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl AsyncWait {
    pub(crate) fn new() -> Self {
        Self {
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn wake(&self) {
        let mut woken = self.woken.lock().expect("wait state poisoned");
        *woken = true;
        self.condvar.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut woken = self.woken.lock().expect("wait state poisoned");
        while !*woken {
            woken = self.condvar.wait(woken).expect("wait state poisoned");
        }
    }

    /// Block until woken or until `timeout` elapses. Returns `true` if
    /// woken, `false` on expiry.
    pub(crate) fn wait_deadline(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut woken = self.woken.lock().expect("wait state poisoned");
        while !*woken {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _timeout_result) = self
                .condvar
                .wait_timeout(woken, deadline - now)
                .expect("wait state poisoned");
            woken = guard;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Value;

    #[test]
    fn test_posted_tasks_run_in_order() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        for i in 0..4 {
            isolate.post(move |scope| {
                let log = match scope.global_get("log") {
                    Value::String(s) => s.to_string(),
                    _ => String::new(),
                };
                scope.global_set("log", Value::string(format!("{}{}", log, i)));
            });
        }
        let wait = Arc::new(AsyncWait::new());
        let wake = Arc::clone(&wait);
        isolate.post(move |_scope| wake.wake());
        wait.wait();
        let log = isolate.with_lock(|scope| scope.global_get("log").as_str().map(str::to_string));
        assert_eq!(log.as_deref(), Some("0123"));
    }

    #[test]
    fn test_dispose_cancels_queue_and_rejects_posts() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        assert_eq!(scheduler.isolate_count(), 1);
        isolate.dispose();
        assert!(!isolate.post(|_scope| {}));
        assert_eq!(scheduler.isolate_count(), 0);
        // Idempotent.
        isolate.dispose();
    }

    #[test]
    fn test_wait_deadline_expires() {
        let wait = AsyncWait::new();
        assert!(!wait.wait_deadline(Duration::from_millis(20)));
        wait.wake();
        assert!(wait.wait_deadline(Duration::from_millis(20)));
    }
}
