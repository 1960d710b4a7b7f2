//! The three-phase task driver.
//!
//! A cross-isolate operation runs as: Phase 1 on the caller (the task
//! constructor marshals inputs), Phase 2 on the target isolate via its
//! queue, Phase 3 back on the caller (unmarshal outputs). The driver is a
//! set of routines parameterized over a task capability set (phase 2,
//! phase 3, and an optional suspending phase 2 for the async-promise
//! bridge), not a base class.
//!
//! Four modes:
//!
//! | mode        | phase 2                      | phase 3           | result  |
//! |-------------|------------------------------|-------------------|---------|
//! | async       | target, via queue            | caller queue      | pending |
//! | sync        | target, caller blocks        | caller, inline    | value   |
//! | ignored     | target, fire-and-forget      | -                 | none    |
//! | syncPromise | target, may suspend          | caller, inline    | value   |
//!
//! Errors raised in Phase 2 are captured and surface on the caller when
//! it resumes. A sync operation whose target is the caller's own isolate
//! runs inline under the held lock; blocking on the own queue would
//! deadlock a single-threaded isolate.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::engine::isolate::{Isolate, Scope, TaskRun};
use crate::engine::scheduler::AsyncWait;
use crate::engine::value::Value;
use crate::error::Error;

/// Capability set of a three-phase task. Phase 1 is the constructor.
pub(crate) trait CrossIsolateTask: Send + 'static {
    /// Runs under the target isolate's lock.
    fn phase2(&mut self, scope: &mut Scope<'_>) -> crate::Result<()>;

    /// Suspending variant used by the syncPromise mode. `Suspended` means
    /// the task parked itself and [`PendingPhase::settle`] will complete
    /// it later on the target's thread.
    fn phase2_async(
        &mut self,
        scope: &mut Scope<'_>,
        pending: PendingPhase,
    ) -> crate::Result<Phase2Flow> {
        drop(pending);
        self.phase2(scope).map(|()| Phase2Flow::Done)
    }

    /// Deliver a promise outcome to a suspended task, under the target
    /// isolate's lock. Only tasks that can return `Suspended` need this.
    fn settle(&mut self, scope: &mut Scope<'_>, outcome: Result<Value, Value>) {
        let _ = (scope, outcome);
    }

    /// Runs under the caller isolate's lock after Phase 2 completed.
    fn phase3(&mut self, scope: &mut Scope<'_>) -> crate::Result<Value>;
}

pub(crate) enum Phase2Flow {
    Done,
    Suspended,
}

struct TaskSlot {
    task: Option<Box<dyn CrossIsolateTask>>,
    result: Option<crate::Result<()>>,
}

/// State shared between the blocked caller, the target's queue task, and
/// (for the promise bridge) the installed settle hook.
struct SyncShared {
    slot: Mutex<TaskSlot>,
    wait: AsyncWait,
    /// Coordination bit between the timeout path and the settlement path:
    /// whichever flips it first wins and the loser becomes a no-op.
    did_finish: AtomicBool,
}

impl SyncShared {
    fn new(task: Box<dyn CrossIsolateTask>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(TaskSlot {
                task: Some(task),
                result: None,
            }),
            wait: AsyncWait::new(),
            did_finish: AtomicBool::new(false),
        })
    }

    fn complete(&self, task: Box<dyn CrossIsolateTask>, result: crate::Result<()>) {
        {
            let mut slot = self.slot.lock().expect("task slot poisoned");
            slot.task = Some(task);
            slot.result = Some(result);
        }
        self.did_finish.store(true, Ordering::SeqCst);
        self.wait.wake();
    }

    fn cancel(&self, error: Error) {
        {
            let mut slot = self.slot.lock().expect("task slot poisoned");
            slot.result = Some(Err(error));
        }
        self.did_finish.store(true, Ordering::SeqCst);
        self.wait.wake();
    }

    fn take(&self) -> (Option<Box<dyn CrossIsolateTask>>, Option<crate::Result<()>>) {
        let mut slot = self.slot.lock().expect("task slot poisoned");
        (slot.task.take(), slot.result.take())
    }
}

/// Handed to `phase2_async`; completes a suspended task when the awaited
/// promise settles.
pub(crate) struct PendingPhase {
    shared: Arc<SyncShared>,
}

impl PendingPhase {
    /// Deliver the promise outcome. If the caller already timed out this
    /// is a no-op; otherwise the outcome is marshaled into the task and
    /// the caller is woken.
    pub(crate) fn settle(self, scope: &mut Scope<'_>, outcome: Result<Value, Value>) {
        if self.shared.did_finish.load(Ordering::SeqCst) {
            tracing::trace!("promise settled after caller finished; ignoring");
            return;
        }
        let mut slot = self.shared.slot.lock().expect("task slot poisoned");
        if self.shared.did_finish.load(Ordering::SeqCst) {
            return;
        }
        if let Some(task) = slot.task.as_mut() {
            task.settle(scope, outcome);
        }
        slot.result = Some(Ok(()));
        drop(slot);
        self.shared.did_finish.store(true, Ordering::SeqCst);
        self.shared.wait.wake();
    }
}

fn finish_on_caller(
    caller: &mut Scope<'_>,
    task: Option<Box<dyn CrossIsolateTask>>,
    result: Option<crate::Result<()>>,
) -> crate::Result<Value> {
    result.unwrap_or_else(|| Err(Error::disposed()))?;
    let mut task = task.ok_or_else(|| Error::Internal("cross-isolate task was lost".to_string()))?;
    task.phase3(caller)
}

/// Sync mode: block the caller until Phase 2 completes on the target.
pub(crate) fn run_sync(
    caller: &mut Scope<'_>,
    target: &Isolate,
    task: impl CrossIsolateTask,
) -> crate::Result<Value> {
    let mut task: Box<dyn CrossIsolateTask> = Box::new(task);
    if target.id() == caller.isolate_id() {
        task.phase2(caller)?;
        return task.phase3(caller);
    }

    let shared = SyncShared::new(task);
    let queued = Arc::clone(&shared);
    let posted = target.post_task(Box::new(move |run| match run {
        TaskRun::Run(scope) => {
            let taken = {
                let mut slot = queued.slot.lock().expect("task slot poisoned");
                slot.task.take()
            };
            if let Some(mut task) = taken {
                let result = task.phase2(scope);
                queued.complete(task, result);
            }
        }
        TaskRun::Cancel(error) => queued.cancel(error),
    }));
    if posted.is_err() {
        return Err(Error::disposed());
    }

    shared.wait.wait();
    let (task, result) = shared.take();
    finish_on_caller(caller, task, result)
}

/// SyncPromise mode: like sync, but Phase 2 may suspend on a promise in
/// the target isolate. The caller keeps blocking while the target is free
/// to process other tasks, including the settlement. A timeout bounds the
/// whole wait; if it fires first, the later settlement is a no-op.
pub(crate) fn run_sync_promise(
    caller: &mut Scope<'_>,
    target: &Isolate,
    task: impl CrossIsolateTask,
    timeout_ms: u32,
) -> crate::Result<Value> {
    if target.id() == caller.isolate_id() {
        // The caller would block the only thread able to settle the
        // promise it is waiting on.
        return Err(Error::Type(
            "`applySyncPromise` is not available on the caller's own isolate".into(),
        ));
    }

    let task: Box<dyn CrossIsolateTask> = Box::new(task);
    let shared = SyncShared::new(task);
    let queued = Arc::clone(&shared);
    let posted = target.post_task(Box::new(move |run| match run {
        TaskRun::Run(scope) => {
            let taken = {
                let mut slot = queued.slot.lock().expect("task slot poisoned");
                slot.task.take()
            };
            if let Some(mut task) = taken {
                let pending = PendingPhase {
                    shared: Arc::clone(&queued),
                };
                match task.phase2_async(scope, pending) {
                    Ok(Phase2Flow::Done) => queued.complete(task, Ok(())),
                    Ok(Phase2Flow::Suspended) => {
                        // Park the task for the settle hook.
                        let mut slot = queued.slot.lock().expect("task slot poisoned");
                        slot.task = Some(task);
                    }
                    Err(error) => queued.complete(task, Err(error)),
                }
            }
        }
        TaskRun::Cancel(error) => queued.cancel(error),
    }));
    if posted.is_err() {
        return Err(Error::disposed());
    }

    let woken = if timeout_ms > 0 {
        shared
            .wait
            .wait_deadline(Duration::from_millis(u64::from(timeout_ms)))
    } else {
        shared.wait.wait();
        true
    };

    if !woken && !shared.did_finish.swap(true, Ordering::SeqCst) {
        return Err(Error::timed_out());
    }

    let (task, result) = shared.take();
    finish_on_caller(caller, task, result)
}

/// Ignored mode: fire-and-forget. Phase 2 errors are logged and
/// swallowed; there is no Phase 3.
pub(crate) fn run_ignored(target: &Isolate, task: impl CrossIsolateTask) {
    let mut task = task;
    let posted = target.post_task(Box::new(move |run| match run {
        TaskRun::Run(scope) => {
            if let Err(error) = task.phase2(scope) {
                tracing::warn!(error = %error, "error in fire-and-forget cross-isolate task");
            }
        }
        TaskRun::Cancel(_) => {}
    }));
    if posted.is_err() {
        tracing::warn!("fire-and-forget task dropped: target isolate is disposed");
    }
}

/// Async mode: Phase 2 is queued on the target; on completion Phase 3 is
/// queued back on the caller isolate, which fulfills the returned
/// [`PendingValue`].
pub(crate) fn run_async(
    caller: &mut Scope<'_>,
    target: &Isolate,
    task: impl CrossIsolateTask,
) -> PendingValue {
    let (sender, receiver) = oneshot::channel();
    let caller_isolate = caller.isolate();
    let mut task: Box<dyn CrossIsolateTask> = Box::new(task);

    let posted = target.post_task(Box::new(move |run| match run {
        TaskRun::Run(scope) => {
            let phase2 = task.phase2(scope);
            let send_back = caller_isolate.post_task(Box::new(move |run| match run {
                TaskRun::Run(caller_scope) => {
                    let out = phase2.and_then(|()| task.phase3(caller_scope));
                    let _ = sender.send(out);
                }
                TaskRun::Cancel(error) => {
                    let _ = sender.send(Err(error));
                }
            }));
            if send_back.is_err() {
                tracing::trace!("caller isolate disposed before phase 3; result dropped");
            }
        }
        TaskRun::Cancel(error) => {
            let _ = sender.send(Err(error));
        }
    }));
    if posted.is_err() {
        // Receiver observes the dropped sender and reports disposal.
    }

    PendingValue { receiver }
}

/// The pending result of an async-mode operation. Resolves once Phase 3
/// has run on the caller isolate's queue.
///
/// Do not block on this while holding the caller isolate's lock: Phase 3
/// needs that lock to run.
pub struct PendingValue {
    receiver: oneshot::Receiver<crate::Result<Value>>,
}

impl PendingValue {
    /// Block the current thread until the operation completes.
    pub fn wait(self) -> crate::Result<Value> {
        match self.receiver.blocking_recv() {
            Ok(result) => result,
            Err(_) => Err(Error::disposed()),
        }
    }
}

impl Future for PendingValue {
    type Output = crate::Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(Error::disposed())))
    }
}
