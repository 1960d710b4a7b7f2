//! Isolates, locks, and scopes.
//!
//! Each isolate owns a heap, a default context (its globals object), a
//! FIFO task queue, and a deferred release queue. At most one thread may
//! hold an isolate's lock at a time; locking yields a [`Scope`], the only
//! capability for touching that isolate's heap. Acquiring a scope first
//! drains the deferred release queue, so remote handles dropped on
//! foreign threads are cleaned up before any new work runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

use crate::error::Error;
use crate::gc::DeferredReleaseQueue;

use super::copy::{deep_copy, CopiedValue};
use super::heap::{
    CallArgs, Heap, HeapCell, NativeFn, PromiseState, ScriptException, ScriptObject, ScriptResult,
    SettleHook,
};
use super::value::{HeapRef, IsolateId, Value};

/// Options applied when spawning an isolate.
#[derive(Debug, Clone, Default)]
pub struct IsolateOptions {
    /// Name used in thread names and log events.
    pub name: Option<String>,
}

/// A task on an isolate's queue. Exactly one variant is delivered: `Run`
/// under the isolate's lock in submission order, or `Cancel` when the
/// isolate was disposed before the task could run.
pub(crate) enum TaskRun<'a, 'b> {
    Run(&'a mut Scope<'b>),
    Cancel(Error),
}

pub(crate) type QueueTask = Box<dyn FnOnce(TaskRun<'_, '_>) + Send>;

pub(crate) struct IsolateState {
    pub(crate) heap: Heap,
    default_context: u32,
    context_stack: Vec<u32>,
}

impl IsolateState {
    fn new() -> Self {
        let mut heap = Heap::new();
        let default_context = heap.alloc(HeapCell::Object(ScriptObject::plain()));
        Self {
            heap,
            default_context,
            context_stack: Vec::new(),
        }
    }
}

pub(crate) struct IsolateHolder {
    id: IsolateId,
    name: String,
    state: Mutex<IsolateState>,
    deferred: DeferredReleaseQueue,
    queue: Mutex<Option<mpsc::UnboundedSender<QueueTask>>>,
    disposed: AtomicBool,
    terminate: AtomicBool,
}

impl IsolateHolder {
    pub(crate) fn new(
        id: IsolateId,
        name: String,
        sender: mpsc::UnboundedSender<QueueTask>,
    ) -> Self {
        Self {
            id,
            name,
            state: Mutex::new(IsolateState::new()),
            deferred: DeferredReleaseQueue::new(),
            queue: Mutex::new(Some(sender)),
            disposed: AtomicBool::new(false),
            terminate: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> IsolateId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub(crate) fn deferred(&self) -> &DeferredReleaseQueue {
        &self.deferred
    }

    /// Acquire the isolate lock. Pending deferred releases are processed
    /// before the scope is handed out.
    pub(crate) fn lock(self: &Arc<Self>) -> Scope<'_> {
        let mut state = self.state.lock().expect("isolate state poisoned");
        self.deferred.process_all(&mut state.heap);
        Scope {
            holder: self,
            state,
        }
    }

    pub(crate) fn post_task(&self, task: QueueTask) -> Result<(), QueueTask> {
        let queue = self.queue.lock().expect("isolate queue poisoned");
        match queue.as_ref() {
            Some(sender) => sender.send(task).map_err(|err| err.0),
            None => Err(task),
        }
    }

    /// Post an empty task so the worker acquires the lock and drains the
    /// deferred release queue.
    pub(crate) fn nudge(&self) {
        let _ = self.post_task(Box::new(|_run| {}));
    }
}

/// A cloneable handle to an isolate.
#[derive(Clone)]
pub struct Isolate {
    pub(crate) holder: Arc<IsolateHolder>,
}

impl Isolate {
    pub fn id(&self) -> IsolateId {
        self.holder.id()
    }

    pub fn name(&self) -> &str {
        self.holder.name()
    }

    pub fn is_disposed(&self) -> bool {
        self.holder.is_disposed()
    }

    /// Thread-safe termination handle.
    pub fn handle(&self) -> IsolateHandle {
        IsolateHandle {
            holder: Arc::downgrade(&self.holder),
        }
    }

    /// Lock the isolate on the current thread and run `f` under the lock.
    pub fn with_lock<T>(&self, f: impl FnOnce(&mut Scope<'_>) -> T) -> T {
        let mut scope = self.holder.lock();
        f(&mut scope)
    }

    /// Enqueue work on the isolate's queue. Returns `false` if the
    /// isolate is disposed.
    pub fn post(&self, f: impl FnOnce(&mut Scope<'_>) + Send + 'static) -> bool {
        self.holder
            .post_task(Box::new(move |run| {
                if let TaskRun::Run(scope) = run {
                    f(scope);
                }
            }))
            .is_ok()
    }

    pub(crate) fn post_task(&self, task: QueueTask) -> Result<(), QueueTask> {
        self.holder.post_task(task)
    }

    /// Dispose the isolate: queued tasks are cancelled with
    /// `"Isolate is disposed"` and the worker thread exits. Remote
    /// handles released after this point are abandoned without touching
    /// the heap.
    pub fn dispose(&self) {
        if self.holder.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(isolate = %self.id(), name = self.name(), "disposing isolate");
        let mut queue = self.holder.queue.lock().expect("isolate queue poisoned");
        *queue = None;
    }
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Thread-safe handle used to interrupt script running in an isolate,
/// modeled on the engine-level isolate handle the timeout watchdog uses.
#[derive(Clone)]
pub struct IsolateHandle {
    holder: Weak<IsolateHolder>,
}

impl IsolateHandle {
    /// Raise the termination signal. Running native script observes it at
    /// the next [`Scope::check_interrupt`] and unwinds. Returns `false`
    /// if the isolate is gone.
    pub fn terminate_execution(&self) -> bool {
        match self.holder.upgrade() {
            Some(holder) => {
                holder.terminate.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear_termination(&self) {
        if let Some(holder) = self.holder.upgrade() {
            holder.terminate.store(false, Ordering::SeqCst);
        }
    }
}

/// Settles a promise allocated with [`Scope::alloc_promise`]. Settling is
/// one-shot; later calls are ignored.
#[derive(Clone)]
pub struct PromiseResolver {
    isolate: IsolateId,
    slot: u32,
}

impl PromiseResolver {
    pub fn resolve(&self, scope: &mut Scope<'_>, value: Value) {
        self.settle(scope, Ok(value));
    }

    pub fn reject(&self, scope: &mut Scope<'_>, value: Value) {
        self.settle(scope, Err(value));
    }

    fn settle(&self, scope: &mut Scope<'_>, outcome: Result<Value, Value>) {
        if scope.isolate_id() != self.isolate {
            tracing::warn!(
                isolate = %self.isolate,
                "promise settled under the wrong isolate lock; ignored"
            );
            return;
        }
        scope.settle_promise(self.slot, outcome);
    }
}

/// Exclusive access to a locked isolate's heap.
pub struct Scope<'a> {
    holder: &'a Arc<IsolateHolder>,
    state: MutexGuard<'a, IsolateState>,
}

impl<'a> Scope<'a> {
    pub fn isolate(&self) -> Isolate {
        Isolate {
            holder: Arc::clone(self.holder),
        }
    }

    pub fn isolate_id(&self) -> IsolateId {
        self.holder.id()
    }

    pub fn handle(&self) -> IsolateHandle {
        IsolateHandle {
            holder: Arc::downgrade(self.holder),
        }
    }

    /// Surface the termination signal to running script.
    pub fn check_interrupt(&self) -> ScriptResult<()> {
        if self.holder.terminate.load(Ordering::SeqCst) {
            Err(ScriptException::Terminated)
        } else {
            Ok(())
        }
    }

    fn is_local(&self, r: HeapRef) -> bool {
        r.isolate() == self.isolate_id()
    }

    // ---- allocation ----

    pub fn alloc_object(&mut self) -> Value {
        let slot = self.state.heap.alloc(HeapCell::Object(ScriptObject::plain()));
        Value::Object(HeapRef::new(self.isolate_id(), slot))
    }

    /// Allocate a dense array-like object with keys `"0"..` plus a
    /// `length` property.
    pub fn alloc_array(&mut self, items: Vec<Value>) -> Value {
        let mut object = ScriptObject::plain();
        let length = items.len();
        for (index, item) in items.into_iter().enumerate() {
            object.props.insert(index.to_string(), item);
        }
        object.props.insert("length".to_string(), Value::Number(length as f64));
        let slot = self.state.heap.alloc(HeapCell::Object(object));
        Value::Object(HeapRef::new(self.isolate_id(), slot))
    }

    pub fn alloc_error(&mut self, name: &str, message: &str) -> Value {
        self.alloc_error_with_stack(name, message, None)
    }

    pub(crate) fn alloc_error_with_stack(
        &mut self,
        name: &str,
        message: &str,
        stack: Option<&str>,
    ) -> Value {
        let mut object = ScriptObject::error();
        object.props.insert("name".to_string(), Value::string(name));
        object
            .props
            .insert("message".to_string(), Value::string(message));
        if let Some(stack) = stack {
            object.props.insert("stack".to_string(), Value::string(stack));
        }
        let slot = self.state.heap.alloc(HeapCell::Object(object));
        Value::Object(HeapRef::new(self.isolate_id(), slot))
    }

    pub fn alloc_function<F>(&mut self, f: F) -> Value
    where
        F: Fn(&mut Scope<'_>, &CallArgs) -> ScriptResult<Value> + Send + Sync + 'static,
    {
        self.alloc_native(Arc::new(f))
    }

    pub fn alloc_native(&mut self, f: NativeFn) -> Value {
        let slot = self.state.heap.alloc(HeapCell::Function(f));
        Value::Function(HeapRef::new(self.isolate_id(), slot))
    }

    pub fn alloc_promise(&mut self) -> (Value, PromiseResolver) {
        let slot = self
            .state
            .heap
            .alloc(HeapCell::Promise(PromiseState::Pending { hooks: Vec::new() }));
        let value = Value::Promise(HeapRef::new(self.isolate_id(), slot));
        let resolver = PromiseResolver {
            isolate: self.isolate_id(),
            slot,
        };
        (value, resolver)
    }

    pub(crate) fn alloc_boxed(&mut self, value: Value) -> u32 {
        self.state.heap.alloc(HeapCell::Boxed(value))
    }

    pub(crate) fn alloc_host(&mut self, object: Arc<dyn std::any::Any + Send + Sync>) -> Value {
        let slot = self.state.heap.alloc(HeapCell::Host(object));
        Value::Host(HeapRef::new(self.isolate_id(), slot))
    }

    pub(crate) fn host_object(
        &self,
        value: &Value,
    ) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        match value {
            Value::Host(r) if self.is_local(*r) => match self.state.heap.cell(r.slot) {
                HeapCell::Host(object) => Some(Arc::clone(object)),
                _ => None,
            },
            _ => None,
        }
    }

    pub(crate) fn heap_cell(&self, slot: u32) -> &HeapCell {
        self.state.heap.cell(slot)
    }

    pub(crate) fn boxed_value(&self, slot: u32) -> Option<Value> {
        match self.state.heap.cell(slot) {
            HeapCell::Boxed(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn pin(&mut self, slot: u32) {
        self.state.heap.pin(slot);
    }

    // ---- properties ----

    fn object_ref(&self, target: &Value) -> crate::Result<u32> {
        match target {
            Value::Object(r) if self.is_local(*r) => Ok(r.slot),
            Value::Object(_) => Err(Error::Type(
                "value is owned by another isolate".into(),
            )),
            _ => Err(Error::Type("value is not an object".into())),
        }
    }

    pub fn get_property(&self, target: &Value, key: &str) -> crate::Result<Value> {
        let slot = self.object_ref(target)?;
        match self.state.heap.cell(slot) {
            HeapCell::Object(object) => Ok(object
                .props
                .get(key)
                .cloned()
                .unwrap_or(Value::Undefined)),
            _ => Err(Error::Internal("object slot does not hold an object".to_string())),
        }
    }

    /// Returns whether the set was accepted.
    pub fn set_property(&mut self, target: &Value, key: &str, value: Value) -> crate::Result<bool> {
        let slot = self.object_ref(target)?;
        match self.state.heap.cell_mut(slot) {
            HeapCell::Object(object) => {
                object.props.insert(key.to_string(), value);
                Ok(true)
            }
            _ => Err(Error::Internal("object slot does not hold an object".to_string())),
        }
    }

    /// Returns whether the key existed.
    pub fn delete_property(&mut self, target: &Value, key: &str) -> crate::Result<bool> {
        let slot = self.object_ref(target)?;
        match self.state.heap.cell_mut(slot) {
            HeapCell::Object(object) => Ok(object.props.shift_remove(key).is_some()),
            _ => Err(Error::Internal("object slot does not hold an object".to_string())),
        }
    }

    /// Own enumerable keys in insertion order.
    pub fn own_keys(&self, target: &Value) -> crate::Result<Vec<String>> {
        let slot = self.object_ref(target)?;
        match self.state.heap.cell(slot) {
            HeapCell::Object(object) => Ok(object.props.keys().cloned().collect()),
            _ => Err(Error::Internal("object slot does not hold an object".to_string())),
        }
    }

    // ---- contexts and globals ----

    pub(crate) fn current_context(&self) -> HeapRef {
        let slot = self
            .state
            .context_stack
            .last()
            .copied()
            .unwrap_or(self.state.default_context);
        HeapRef::new(self.isolate_id(), slot)
    }

    /// Run `f` with `context` as the current context.
    pub(crate) fn with_context<T>(&mut self, context: HeapRef, f: impl FnOnce(&mut Self) -> T) -> T {
        debug_assert!(self.is_local(context));
        self.state.context_stack.push(context.slot);
        let out = f(self);
        self.state.context_stack.pop();
        out
    }

    /// The current context's globals object.
    pub fn global(&self) -> Value {
        Value::Object(self.current_context())
    }

    pub fn global_get(&self, key: &str) -> Value {
        let global = self.global();
        self.get_property(&global, key).unwrap_or(Value::Undefined)
    }

    pub fn global_set(&mut self, key: &str, value: Value) {
        let global = self.global();
        let _ = self.set_property(&global, key, value);
    }

    // ---- invocation ----

    /// Invoke a function value with the given receiver and arguments.
    pub fn call(&mut self, callee: &Value, recv: Value, args: Vec<Value>) -> ScriptResult<Value> {
        let r = match callee {
            Value::Function(r) if self.is_local(*r) => *r,
            _ => {
                let error = self.alloc_error("TypeError", "value is not a function");
                return Err(ScriptException::Thrown(error));
            }
        };
        let function = match self.state.heap.cell(r.slot) {
            HeapCell::Function(f) => Arc::clone(f),
            _ => {
                let error = self.alloc_error("TypeError", "function slot is not callable");
                return Err(ScriptException::Thrown(error));
            }
        };
        self.check_interrupt()?;
        let out = function.as_ref()(self, &CallArgs { recv, args });
        match out {
            Ok(value) => {
                self.check_interrupt()?;
                Ok(value)
            }
            Err(exception) => Err(exception),
        }
    }

    // ---- promises ----

    /// The settled outcome of a promise, or `None` while pending.
    pub(crate) fn promise_outcome(
        &self,
        promise: &Value,
    ) -> crate::Result<Option<Result<Value, Value>>> {
        let r = match promise {
            Value::Promise(r) if self.is_local(*r) => *r,
            _ => return Err(Error::Type("value is not a promise".into())),
        };
        match self.state.heap.cell(r.slot) {
            HeapCell::Promise(PromiseState::Pending { .. }) => Ok(None),
            HeapCell::Promise(PromiseState::Fulfilled(value)) => Ok(Some(Ok(value.clone()))),
            HeapCell::Promise(PromiseState::Rejected(value)) => Ok(Some(Err(value.clone()))),
            _ => Err(Error::Internal(
                "promise slot does not hold a promise".to_string(),
            )),
        }
    }

    /// Install a settle hook on a promise. Runs immediately if the
    /// promise has already settled.
    pub(crate) fn promise_then(&mut self, promise: &Value, hook: SettleHook) -> crate::Result<()> {
        let r = match promise {
            Value::Promise(r) if self.is_local(*r) => *r,
            _ => return Err(Error::Type("value is not a promise".into())),
        };
        let outcome = match self.state.heap.cell_mut(r.slot) {
            HeapCell::Promise(state) => match state {
                PromiseState::Pending { hooks } => {
                    hooks.push(hook);
                    return Ok(());
                }
                PromiseState::Fulfilled(value) => Ok(value.clone()),
                PromiseState::Rejected(value) => Err(value.clone()),
            },
            _ => {
                return Err(Error::Internal(
                    "promise slot does not hold a promise".to_string(),
                ))
            }
        };
        hook(self, outcome);
        Ok(())
    }

    pub(crate) fn settle_promise(&mut self, slot: u32, outcome: Result<Value, Value>) {
        let hooks = match self.state.heap.cell_mut(slot) {
            HeapCell::Promise(state) => {
                if !matches!(state, PromiseState::Pending { .. }) {
                    tracing::trace!(slot, "promise already settled; ignoring");
                    return;
                }
                let next = match &outcome {
                    Ok(value) => PromiseState::Fulfilled(value.clone()),
                    Err(value) => PromiseState::Rejected(value.clone()),
                };
                match std::mem::replace(state, next) {
                    PromiseState::Pending { hooks } => hooks,
                    _ => Vec::new(),
                }
            }
            _ => {
                tracing::warn!(slot, "settle target is not a promise");
                return;
            }
        };
        for hook in hooks {
            hook(self, outcome.clone());
        }
    }

    // ---- copying ----

    pub fn deep_copy(&self, value: &Value) -> crate::Result<CopiedValue> {
        deep_copy(self, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Scheduler;

    #[test]
    fn test_object_properties() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let object = scope.alloc_object();
            assert!(scope.set_property(&object, "a", Value::Number(1.0)).unwrap());
            assert_eq!(scope.get_property(&object, "a").unwrap().as_number(), Some(1.0));
            assert!(matches!(
                scope.get_property(&object, "missing").unwrap(),
                Value::Undefined
            ));
            assert!(scope.delete_property(&object, "a").unwrap());
            assert!(!scope.delete_property(&object, "a").unwrap());
        });
    }

    #[test]
    fn test_array_shape() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let array = scope.alloc_array(vec![Value::Number(1.0), Value::string("x")]);
            let keys = scope.own_keys(&array).unwrap();
            assert_eq!(keys, vec!["0", "1", "length"]);
            assert!(matches!(scope.global_get("nothing"), Value::Undefined));
        });
    }

    #[test]
    fn test_call_native_function() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let double = scope.alloc_function(|_scope: &mut Scope<'_>, args: &CallArgs| {
                let n = args.args.first().and_then(Value::as_number).unwrap_or(0.0);
                Ok(Value::Number(n * 2.0))
            });
            let out = scope
                .call(&double, Value::Undefined, vec![Value::Number(21.0)])
                .unwrap();
            assert_eq!(out.as_number(), Some(42.0));
        });
    }

    #[test]
    fn test_call_non_function_throws() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let out = scope.call(&Value::Number(1.0), Value::Undefined, Vec::new());
            assert!(matches!(out, Err(ScriptException::Thrown(_))));
        });
    }

    #[test]
    fn test_promise_settles_hooks() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            let (promise, resolver) = scope.alloc_promise();
            scope
                .promise_then(
                    &promise,
                    Box::new(|scope: &mut Scope<'_>, outcome| {
                        let value = outcome.expect("fulfilled");
                        scope.global_set("seen", value);
                    }),
                )
                .unwrap();
            resolver.resolve(scope, Value::Number(5.0));
            assert_eq!(scope.global_get("seen").as_number(), Some(5.0));
            // Settling twice is a no-op.
            resolver.resolve(scope, Value::Number(9.0));
            assert_eq!(scope.global_get("seen").as_number(), Some(5.0));
        });
    }

    #[test]
    fn test_termination_signal() {
        let scheduler = Scheduler::new();
        let isolate = scheduler.spawn(IsolateOptions::default());
        isolate.with_lock(|scope| {
            assert!(scope.check_interrupt().is_ok());
            scope.handle().terminate_execution();
            assert!(matches!(
                scope.check_interrupt(),
                Err(ScriptException::Terminated)
            ));
            scope.handle().clear_termination();
            assert!(scope.check_interrupt().is_ok());
        });
    }
}
