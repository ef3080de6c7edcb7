//! Request dispatcher.
//!
//! Turns one host request `(name[|correlation], raw_args)` into exactly one
//! [`Envelope`]. Resolution, argument binding, and the sync/async split happen
//! here; every failure is converted into an `ERROR` envelope at this boundary.

use std::sync::Arc;

use extcall_core::{codec, Envelope, ASYNC_CANCEL};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::observer::{LifecycleEvent, ObserverSet};
use super::operation::{Args, DispatchError, InvocationContext, OperationDescriptor, Outcome};
use super::registry::OperationRegistry;
use super::worker::{call_guarded, resolve, run, AsyncTaskManager, StartedTask};

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Routes host requests to registered operations.
///
/// [`invoke`](Self::invoke) must be called from a thread that is not driving
/// the worker runtime: the synchronous path blocks on deferred results.
pub struct Dispatcher {
    registry: Arc<OperationRegistry>,
    tasks: AsyncTaskManager,
    observers: Arc<ObserverSet>,
    handle: Handle,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<OperationRegistry>,
        tasks: AsyncTaskManager,
        observers: Arc<ObserverSet>,
        handle: Handle,
    ) -> Self {
        Self {
            registry,
            tasks,
            observers,
            handle,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn tasks(&self) -> &AsyncTaskManager {
        &self.tasks
    }

    /// Dispatches one request and returns its reply. Never fails.
    pub fn invoke<S: AsRef<str>>(&self, request: &str, raw_args: &[S]) -> Envelope {
        if !self.observers.is_empty() {
            self.observers.notify(LifecycleEvent::MethodCalled {
                function: request.to_string(),
                args: raw_args.iter().map(|a| a.as_ref().to_string()).collect(),
            });
        }

        let envelope = self.try_invoke(request, raw_args).unwrap_or_else(|err| {
            debug!(request, error = %err, "request failed");
            self.observers.error(err.to_string());
            Envelope::error(err.to_string(), err.return_code())
        });

        if !self.observers.is_empty() {
            self.observers.notify(LifecycleEvent::MethodResponse {
                function: request.to_string(),
                envelope: envelope.clone(),
            });
        }
        envelope
    }

    /// Handles an `ASYNC_CANCEL` request for `token`.
    pub fn cancel(&self, token: &str) -> Envelope {
        match self.tasks.cancel(token) {
            Ok(()) => Envelope::cancel_outcome(true),
            Err(_) => {
                let failure = DispatchError::CancellationFailure {
                    token: token.to_string(),
                };
                debug!(error = %failure, "cancellation refused");
                Envelope::cancel_outcome(false)
            }
        }
    }

    fn try_invoke<S: AsRef<str>>(
        &self,
        request: &str,
        raw_args: &[S],
    ) -> Result<Envelope, DispatchError> {
        let (name, correlation) = match request.split_once('|') {
            Some((name, correlation)) => (name, Some(correlation)),
            None => (request, None),
        };

        if name.eq_ignore_ascii_case(ASYNC_CANCEL) {
            return Ok(self.cancel(correlation.unwrap_or_default().trim()));
        }
        if name.is_empty() {
            return Err(DispatchError::InvalidMethod);
        }

        let descriptor = self
            .registry
            .resolve(name)
            .map_err(|_| DispatchError::InvalidMethod)?;
        let args = bind_arguments(&descriptor, raw_args)?;

        match correlation.and_then(correlation_key) {
            Some(key) => Ok(self.start_async(descriptor, args, key)),
            None => self.invoke_sync(descriptor, args),
        }
    }

    fn start_async(&self, descriptor: Arc<OperationDescriptor>, args: Args, key: i64) -> Envelope {
        let operation = descriptor.name_arc();
        match self.tasks.start(descriptor, args, key) {
            Ok(StartedTask { token: Some(token) }) => Envelope::async_sent(&token),
            Ok(StartedTask { token: None }) => Envelope::async_sent_void(),
            Err(err) => {
                warn!(operation = %operation, key, error = %err, "async invocation refused");
                self.observers.error(err.to_string());
                Envelope::async_failed(err.to_string())
            }
        }
    }

    fn invoke_sync(
        &self,
        descriptor: Arc<OperationDescriptor>,
        args: Args,
    ) -> Result<Envelope, DispatchError> {
        let ctx = InvocationContext::detached(descriptor.name_arc());

        if descriptor.is_void() {
            let observers = Arc::clone(&self.observers);
            self.handle.spawn(async move {
                if let Err(err) = run(&descriptor, args, ctx).await {
                    warn!(operation = descriptor.name(), error = %err, "void invocation failed");
                    observers.error(err.to_string());
                }
            });
            return Ok(Envelope::success_void());
        }

        let value = match call_guarded(&descriptor, args, ctx)? {
            Outcome::Ready(value) => value,
            deferred @ Outcome::Deferred(_) => {
                if Handle::try_current().is_ok() {
                    return Err(DispatchError::InvocationFailure(format!(
                        "'{}' cannot be awaited synchronously from inside the runtime",
                        descriptor.name()
                    )));
                }
                let join = self.handle.spawn(resolve(deferred));
                self.handle
                    .block_on(join)
                    .map_err(|err| DispatchError::InvocationFailure(err.to_string()))??
            }
        };
        Ok(Envelope::success(value))
    }
}

/// Parses the correlation field. Anything but an integer means "synchronous".
fn correlation_key(raw: &str) -> Option<i64> {
    match raw.trim().parse::<i64>() {
        Ok(key) => Some(key),
        Err(_) => {
            warn!(correlation = raw, "ignoring non-integer correlation key, calling synchronously");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Argument binding
// ---------------------------------------------------------------------------

/// Decodes and validates raw arguments against the descriptor's parameters.
///
/// Extra arguments are dropped, missing trailing ones are filled from
/// defaults, and each supplied argument must match its declared shape.
///
/// # Errors
///
/// Returns [`DispatchError::MissingParameters`] when the operation declares
/// parameters but nothing was supplied, even if every parameter has a default, [`DispatchError::ParameterMismatch`] when
/// a parameter has neither a value nor a default, and
/// [`DispatchError::TypeMismatch`] for an incompatible shape.
pub fn bind_arguments<S: AsRef<str>>(
    descriptor: &OperationDescriptor,
    raw_args: &[S],
) -> Result<Args, DispatchError> {
    let params = descriptor.params();
    if !params.is_empty() && raw_args.is_empty() {
        return Err(DispatchError::MissingParameters);
    }

    let mut values = codec::parse(raw_args);
    values.truncate(params.len());
    let supplied = values.len();

    for param in &params[supplied..] {
        match &param.default {
            Some(default) => values.push(default.clone()),
            None => {
                return Err(DispatchError::ParameterMismatch {
                    expected: params.len(),
                    actual: supplied,
                })
            }
        }
    }

    for (param, value) in params.iter().zip(&values).take(supplied) {
        if !param.kind.accepts(value) {
            return Err(DispatchError::TypeMismatch {
                param: param.name.clone(),
                expected: param.kind.to_string(),
                actual: value.kind().to_string(),
            });
        }
    }

    Ok(Args::new(values))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
