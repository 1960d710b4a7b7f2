//! Function invocation across isolates, including the async-promise
//! bridge behind `applySyncPromise`.

use crate::engine::copy::{rejection_to_error, thrown_to_error};
use crate::engine::isolate::Scope;
use crate::engine::heap::ScriptException;
use crate::engine::value::Value;
use crate::error::{
    Error, ARGUMENTS_MUST_BE_OBJECT, INVALID_ARGUMENTS, NOT_A_FUNCTION, RETURN_MUST_BE_OBJECT,
    RETURN_NOT_AVAILABLE, TIMEOUT_MUST_BE_INTEGER,
};
use crate::remote::RemoteHandle;
use crate::security::TimeoutGuard;
use crate::three_phase::{CrossIsolateTask, PendingPhase, Phase2Flow};
use crate::transfer::{transfer_out, TransferFallback, TransferOptions, Transferable};

use super::ops::{context_on_owner, deref_on_owner};
use super::ReferenceData;

/// Invokes the referenced function: receiver and arguments transfer in,
/// the call runs under the timeout guard, and the result transfers out
/// (defaulting to a reference).
///
/// For `applySyncPromise`, a promise result suspends the task: settle
/// hooks deliver the outcome later on the target's thread, guarded by the
/// driver's `did_finish` flag so a timed-out caller wins over a late
/// settlement.
pub(super) struct ApplyRunner {
    context: RemoteHandle,
    reference: RemoteHandle,
    recv: Option<Transferable>,
    argv: Vec<Transferable>,
    timeout: u32,
    return_options: TransferOptions,
    ret: Option<Transferable>,
    async_error: Option<Error>,
}

impl ApplyRunner {
    pub(super) fn new(
        data: &ReferenceData,
        scope: &mut Scope<'_>,
        recv: Option<&Value>,
        args: Option<&Value>,
        options: Option<&Value>,
    ) -> crate::Result<Self> {
        let recv = match recv {
            Some(value) => Some(transfer_out(
                scope,
                value,
                TransferOptions::default(),
                TransferFallback::None,
            )?),
            None => None,
        };

        let (timeout, argument_options, return_options) = parse_apply_options(scope, options)?;
        let argv = marshal_arguments(scope, args, argument_options)?;

        Ok(Self {
            context: data.context.clone(),
            reference: data.value.clone(),
            recv,
            argv,
            timeout,
            return_options,
            ret: None,
            async_error: None,
        })
    }

    pub(super) fn timeout(&self) -> u32 {
        self.timeout
    }

    /// Transfer receiver and arguments in, then call under the guard.
    fn invoke(&mut self, scope: &mut Scope<'_>) -> crate::Result<Value> {
        let function = deref_on_owner(&self.reference, scope)?;
        if !matches!(function, Value::Function(_)) {
            return Err(Error::Type(NOT_A_FUNCTION.into()));
        }

        let recv = match self.recv.take() {
            Some(transferable) => transferable.transfer_in(scope)?,
            None => Value::Undefined,
        };
        let mut args = Vec::with_capacity(self.argv.len());
        for transferable in self.argv.drain(..) {
            args.push(transferable.transfer_in(scope)?);
        }

        let guard = TimeoutGuard::new(scope.handle(), self.timeout);
        let called = scope.call(&function, recv, args);
        let timed_out = guard.was_triggered();
        drop(guard);

        match called {
            Ok(value) => Ok(value),
            Err(ScriptException::Terminated) if timed_out => Err(Error::timed_out()),
            Err(ScriptException::Terminated) => {
                Err(Error::Internal("script execution was terminated".to_string()))
            }
            Err(ScriptException::Thrown(thrown)) => Err(thrown_to_error(scope, &thrown)),
        }
    }
}

impl CrossIsolateTask for ApplyRunner {
    fn phase2(&mut self, scope: &mut Scope<'_>) -> crate::Result<()> {
        let context = context_on_owner(&self.context, scope)?;
        scope.with_context(context, |scope| {
            let value = self.invoke(scope)?;
            self.ret = Some(transfer_out(
                scope,
                &value,
                self.return_options,
                TransferFallback::Reference,
            )?);
            Ok(())
        })
    }

    fn phase2_async(
        &mut self,
        scope: &mut Scope<'_>,
        pending: PendingPhase,
    ) -> crate::Result<Phase2Flow> {
        // The bridge marshals the resolved value under default policy
        // only.
        if !self.return_options.is_default() {
            return Err(Error::Type(RETURN_NOT_AVAILABLE.into()));
        }
        let context = context_on_owner(&self.context, scope)?;
        scope.with_context(context, |scope| {
            let value = self.invoke(scope)?;
            if matches!(value, Value::Promise(_)) {
                // An already-settled promise is absorbed here, while the
                // task is still on this stack; only genuinely pending
                // promises park the task for the settle hook.
                if let Some(outcome) = scope.promise_outcome(&value)? {
                    self.settle(scope, outcome);
                    return Ok(Phase2Flow::Done);
                }
                scope.promise_then(
                    &value,
                    Box::new(move |scope, outcome| pending.settle(scope, outcome)),
                )?;
                Ok(Phase2Flow::Suspended)
            } else {
                self.ret = Some(transfer_out(
                    scope,
                    &value,
                    TransferOptions::default(),
                    TransferFallback::Reference,
                )?);
                Ok(Phase2Flow::Done)
            }
        })
    }

    fn settle(&mut self, scope: &mut Scope<'_>, outcome: Result<Value, Value>) {
        match outcome {
            Ok(value) => {
                match transfer_out(
                    scope,
                    &value,
                    TransferOptions::default(),
                    TransferFallback::Reference,
                ) {
                    Ok(transferable) => self.ret = Some(transferable),
                    Err(error) => self.async_error = Some(error),
                }
            }
            Err(rejection) => {
                self.async_error = Some(rejection_to_error(scope, &rejection));
            }
        }
    }

    fn phase3(&mut self, scope: &mut Scope<'_>) -> crate::Result<Value> {
        if let Some(error) = self.async_error.take() {
            return Err(error);
        }
        match self.ret.take() {
            Some(ret) => ret.transfer_in(scope),
            None => Ok(Value::Undefined),
        }
    }
}

fn parse_apply_options(
    scope: &Scope<'_>,
    options: Option<&Value>,
) -> crate::Result<(u32, TransferOptions, TransferOptions)> {
    let mut timeout = 0u32;
    let mut argument_options = TransferOptions::default();
    let mut return_options = TransferOptions::default();

    let options = match options {
        Some(value) if !matches!(value, Value::Undefined) => value,
        _ => return Ok((timeout, argument_options, return_options)),
    };
    if !matches!(options, Value::Object(_)) {
        return Err(Error::Type("`options` must be object".into()));
    }

    match scope.get_property(options, "timeout")? {
        Value::Undefined => {}
        Value::Number(n) if n >= 0.0 && n.fract() == 0.0 && n <= f64::from(u32::MAX) => {
            timeout = n as u32;
        }
        _ => return Err(Error::Type(TIMEOUT_MUST_BE_INTEGER.into())),
    }

    match scope.get_property(options, "arguments")? {
        Value::Undefined => {}
        value @ Value::Object(_) => {
            argument_options = TransferOptions::from_value(scope, &value)?;
        }
        _ => return Err(Error::Type(ARGUMENTS_MUST_BE_OBJECT.into())),
    }

    match scope.get_property(options, "return")? {
        Value::Undefined => {}
        value @ Value::Object(_) => {
            return_options = TransferOptions::from_value(scope, &value)?;
        }
        _ => return Err(Error::Type(RETURN_MUST_BE_OBJECT.into())),
    }

    Ok((timeout, argument_options, return_options))
}

/// Transfer out every argument. `args` must be an index-dense array-like
/// object: own keys exactly `0..N-1`, in order.
fn marshal_arguments(
    scope: &mut Scope<'_>,
    args: Option<&Value>,
    options: TransferOptions,
) -> crate::Result<Vec<Transferable>> {
    let args = match args {
        Some(value) if !matches!(value, Value::Undefined) => value,
        _ => return Ok(Vec::new()),
    };
    let keys = scope
        .own_keys(args)
        .map_err(|_| Error::Type(INVALID_ARGUMENTS.into()))?;

    let mut argv = Vec::with_capacity(keys.len());
    for (index, key) in keys.iter().enumerate() {
        if key == "length" && index == keys.len() - 1 {
            // Arrays built by the engine carry a trailing `length`.
            break;
        }
        if key.parse::<u32>().ok() != Some(index as u32) {
            return Err(Error::Type(INVALID_ARGUMENTS.into()));
        }
        let value = scope.get_property(args, key)?;
        argv.push(transfer_out(scope, &value, options, TransferFallback::None)?);
    }
    Ok(argv)
}
