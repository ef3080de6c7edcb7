//! Asynchronous task manager.
//!
//! Owns the token -> invocation map for async calls, spawns their execution on
//! the worker runtime, and enforces that each token produces at most one
//! notification: whichever side removes the map entry (completion or
//! cancellation) owns it.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use extcall_core::{Envelope, Value};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::callback::CallbackEmitter;
use super::observer::{LifecycleEvent, ObserverSet};
use super::operation::{Args, InvocationContext, OperationDescriptor, OperationError, Outcome};

// ---------------------------------------------------------------------------
// Handler execution
// ---------------------------------------------------------------------------

/// Calls the handler, turning a panic into an [`OperationError`].
pub(crate) fn call_guarded(
    descriptor: &OperationDescriptor,
    args: Args,
    ctx: InvocationContext,
) -> Result<Outcome, OperationError> {
    catch_unwind(AssertUnwindSafe(|| descriptor.call(args, ctx)))
        .unwrap_or_else(|payload| Err(panicked(payload.as_ref())))
}

/// Drives an outcome to its value. Panics while polling become errors.
pub(crate) async fn resolve(outcome: Outcome) -> Result<Value, OperationError> {
    match outcome {
        Outcome::Ready(value) => Ok(value),
        Outcome::Deferred(fut) => AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(panicked(payload.as_ref()))),
    }
}

/// Calls the handler and drives its outcome.
pub(crate) async fn run(
    descriptor: &OperationDescriptor,
    args: Args,
    ctx: InvocationContext,
) -> Result<Value, OperationError> {
    let outcome = call_guarded(descriptor, args, ctx)?;
    resolve(outcome).await
}

fn panicked(payload: &(dyn Any + Send)) -> OperationError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    OperationError::Failed(format!("handler panicked: {message}"))
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle of a tracked async invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Result of accepting an async invocation. Void operations get no token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedTask {
    pub token: Option<String>,
}

/// Errors from the task manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("too many async tasks in flight (limit {limit})")]
    Overloaded { limit: usize },
    #[error("bridge is shutting down")]
    ShuttingDown,
    #[error("Unknown or already finished task: {token}")]
    CancellationFailure { token: String },
}

struct AsyncInvocation {
    operation: Arc<str>,
    key: i64,
    cancel: CancellationToken,
    created_at: Instant,
    state: Mutex<TaskState>,
}

impl AsyncInvocation {
    fn new(operation: Arc<str>, key: i64, cancel: CancellationToken) -> Self {
        Self {
            operation,
            key,
            cancel,
            created_at: Instant::now(),
            state: Mutex::new(TaskState::Pending),
        }
    }

    fn transition(&self, next: TaskState) {
        *self.state.lock() = next;
    }

    fn state(&self) -> TaskState {
        *self.state.lock()
    }
}

// ---------------------------------------------------------------------------
// AsyncTaskManager
// ---------------------------------------------------------------------------

struct Shared {
    tasks: DashMap<String, Arc<AsyncInvocation>>,
    limit: Arc<Semaphore>,
    max_in_flight: usize,
    /// Parent of every task's cancellation token; cancelled on shutdown.
    root: CancellationToken,
    accepting: AtomicBool,
    emitter: Arc<CallbackEmitter>,
    observers: Arc<ObserverSet>,
    handle: Handle,
}

/// Spawns and tracks async invocations. Cheap to clone.
#[derive(Clone)]
pub struct AsyncTaskManager {
    shared: Arc<Shared>,
}

impl AsyncTaskManager {
    #[must_use]
    pub fn new(
        handle: Handle,
        emitter: Arc<CallbackEmitter>,
        observers: Arc<ObserverSet>,
        max_in_flight: usize,
    ) -> Self {
        let max_in_flight = max_in_flight.min(Semaphore::MAX_PERMITS);
        Self {
            shared: Arc::new(Shared {
                tasks: DashMap::new(),
                limit: Arc::new(Semaphore::new(max_in_flight)),
                max_in_flight,
                root: CancellationToken::new(),
                accepting: AtomicBool::new(true),
                emitter,
                observers,
                handle,
            }),
        }
    }

    /// Accepts an invocation and spawns it on the worker runtime.
    ///
    /// Non-void operations are tracked under a fresh token; void operations
    /// run untracked and never emit a response.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::ShuttingDown`] after [`shutdown`](Self::shutdown),
    /// or [`TaskError::Overloaded`] when the in-flight limit is reached.
    pub fn start(
        &self,
        descriptor: Arc<OperationDescriptor>,
        args: Args,
        key: i64,
    ) -> Result<StartedTask, TaskError> {
        let shared = &self.shared;
        if !shared.accepting.load(Ordering::Acquire) {
            return Err(TaskError::ShuttingDown);
        }
        let permit = Arc::clone(&shared.limit)
            .try_acquire_owned()
            .map_err(|_| TaskError::Overloaded {
                limit: shared.max_in_flight,
            })?;

        if descriptor.is_void() {
            self.start_void(descriptor, args, key, permit);
            return Ok(StartedTask { token: None });
        }

        let token = Uuid::new_v4().to_string();
        let invocation = Arc::new(AsyncInvocation::new(
            descriptor.name_arc(),
            key,
            shared.root.child_token(),
        ));
        shared.tasks.insert(token.clone(), Arc::clone(&invocation));
        shared.observers.notify(LifecycleEvent::AsyncStarted {
            operation: descriptor.name().to_string(),
            token: Some(token.clone()),
            key,
        });

        let span = info_span!(
            "async_task",
            operation = descriptor.name(),
            token = %token,
            key,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        shared.handle.spawn(
            Arc::clone(shared)
                .execute(token.clone(), invocation, descriptor, args, permit)
                .instrument(span),
        );
        Ok(StartedTask { token: Some(token) })
    }

    fn start_void(
        &self,
        descriptor: Arc<OperationDescriptor>,
        args: Args,
        key: i64,
        permit: OwnedSemaphorePermit,
    ) {
        let shared = &self.shared;
        shared.observers.notify(LifecycleEvent::AsyncStarted {
            operation: descriptor.name().to_string(),
            token: None,
            key,
        });

        let ctx = InvocationContext::new(descriptor.name_arc(), None, shared.root.child_token());
        let observers = Arc::clone(&shared.observers);
        let span = info_span!("async_task", operation = descriptor.name(), key);
        shared.handle.spawn(
            async move {
                let result = run(&descriptor, args, ctx).await;
                drop(permit);
                if let Err(err) = result {
                    warn!(error = %err, "void async task failed");
                    observers.error(err.to_string());
                }
            }
            .instrument(span),
        );
    }

    /// Cancels a tracked invocation. The task emits nothing afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::CancellationFailure`] if the token is unknown or
    /// its task already finished.
    pub fn cancel(&self, token: &str) -> Result<(), TaskError> {
        let removed = self.shared.tasks.remove(token);
        self.shared.observers.notify(LifecycleEvent::AsyncCancelled {
            token: token.to_string(),
            success: removed.is_some(),
        });

        let (_, invocation) = removed.ok_or_else(|| TaskError::CancellationFailure {
            token: token.to_string(),
        })?;
        invocation.transition(TaskState::Cancelled);
        invocation.cancel.cancel();
        info!(
            token,
            operation = %invocation.operation,
            key = invocation.key,
            "async task cancelled"
        );
        Ok(())
    }

    /// Cancels every tracked invocation. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let tokens: Vec<String> = self
            .shared
            .tasks
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        tokens
            .iter()
            .filter(|token| self.cancel(token).is_ok())
            .count()
    }

    /// Stops accepting work and cancels everything still running, void tasks
    /// included.
    pub fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        let cancelled = self.cancel_all();
        self.shared.root.cancel();
        info!(cancelled, "async task manager shut down");
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Number of tracked (non-void) invocations still pending or running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.tasks.len()
    }

    /// State of a tracked invocation, or `None` once it has finished or been
    /// cancelled.
    #[must_use]
    pub fn state(&self, token: &str) -> Option<TaskState> {
        self.shared.tasks.get(token).map(|entry| entry.value().state())
    }
}

impl Shared {
    async fn execute(
        self: Arc<Self>,
        token: String,
        invocation: Arc<AsyncInvocation>,
        descriptor: Arc<OperationDescriptor>,
        args: Args,
        permit: OwnedSemaphorePermit,
    ) {
        if invocation.cancel.is_cancelled() {
            // Shutdown may cancel the root between `start`'s accepting check
            // and the insert, so the entry can still be tracked here.
            self.tasks.remove(&token);
            invocation.transition(TaskState::Cancelled);
            Span::current().record("outcome", TaskState::Cancelled.as_str());
            debug!("cancelled before start");
            return;
        }
        invocation.transition(TaskState::Running);

        let ctx = InvocationContext::new(
            descriptor.name_arc(),
            Some(token.clone()),
            invocation.cancel.clone(),
        );
        let result = run(&descriptor, args, ctx).await;
        drop(permit);

        let span = Span::current();
        let duration_ms =
            u64::try_from(invocation.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        span.record("duration_ms", duration_ms);

        if self.tasks.remove(&token).is_none() {
            span.record("outcome", TaskState::Cancelled.as_str());
            debug!(duration_ms, "result discarded after cancellation");
            return;
        }

        let state = if result.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        invocation.transition(state);
        span.record("outcome", state.as_str());
        info!(duration_ms, outcome = state.as_str(), "async task finished");

        if let Err(err) = &result {
            self.observers.error(err.to_string());
        }
        let envelope = Envelope::async_response(&token, result.map_err(|err| err.to_string()));
        self.emitter.emit_envelope(&envelope);
        self.observers.notify(LifecycleEvent::AsyncCompleted {
            operation: invocation.operation.to_string(),
            token,
            success: state == TaskState::Completed,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use extcall_core::ParamType;

    use super::*;
    use crate::service::callback::{DeliveryError, HostCallback};

    type Deliveries = Arc<Mutex<Vec<(String, String)>>>;

    fn manager(limit: usize) -> (AsyncTaskManager, Deliveries) {
        let observers = Arc::new(ObserverSet::default());
        let emitter = Arc::new(CallbackEmitter::new("ext", Arc::clone(&observers)));
        let log: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let callback: Arc<dyn HostCallback> =
            Arc::new(move |_: &str, tag: &str, body: &str| -> Result<(), DeliveryError> {
                sink.lock().push((tag.to_string(), body.to_string()));
                Ok(())
            });
        emitter.set_callback(callback);
        let manager = AsyncTaskManager::new(Handle::current(), emitter, observers, limit);
        (manager, log)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn add() -> Arc<OperationDescriptor> {
        Arc::new(
            OperationDescriptor::builder("Add")
                .param("a", ParamType::Number)
                .param("b", ParamType::Number)
                .handler(|args, _| Ok((args.number(0)? + args.number(1)?).into())),
        )
    }

    /// Runs until cancelled.
    fn parked() -> Arc<OperationDescriptor> {
        Arc::new(OperationDescriptor::builder("Parked").handler(|_, ctx| {
            Ok(Outcome::deferred(async move {
                ctx.cancelled().await;
                Err::<Value, _>(OperationError::Cancelled)
            }))
        }))
    }

    fn numbers(values: &[f64]) -> Args {
        Args::new(values.iter().copied().map(Value::Number).collect())
    }

    #[tokio::test]
    async fn completion_emits_exactly_one_response() {
        let (manager, log) = manager(8);
        let started = manager.start(add(), numbers(&[10.0, 10.0]), 42).unwrap();
        let token = started.token.unwrap();

        wait_until(|| !log.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            log.lock().clone(),
            vec![(format!("ASYNC_RESPONSE|{token}|0"), "[20]".to_string())]
        );
        assert_eq!(manager.in_flight(), 0);
        assert_eq!(manager.state(&token), None);
    }

    #[tokio::test]
    async fn handler_error_is_reported_with_error_code() {
        let (manager, log) = manager(8);
        let failing = Arc::new(
            OperationDescriptor::builder("Fail")
                .handler(|_, _| Err(OperationError::failed("boom"))),
        );
        let token = manager.start(failing, Args::new(vec![]), 1).unwrap().token.unwrap();

        wait_until(|| !log.lock().is_empty()).await;
        assert_eq!(
            log.lock()[0],
            (format!("ASYNC_RESPONSE|{token}|1"), r#"["boom"]"#.to_string())
        );
    }

    #[tokio::test]
    async fn panic_in_deferred_work_becomes_error_response() {
        fn explode() -> Result<Value, OperationError> {
            panic!("kaboom")
        }

        let (manager, log) = manager(8);
        let exploding = Arc::new(
            OperationDescriptor::builder("Explode")
                .handler(|_, _| Ok(Outcome::deferred(async move { explode() }))),
        );
        let token = manager.start(exploding, Args::new(vec![]), 1).unwrap().token.unwrap();

        wait_until(|| !log.lock().is_empty()).await;
        let (tag, body) = log.lock()[0].clone();
        assert_eq!(tag, format!("ASYNC_RESPONSE|{token}|1"));
        assert!(body.contains("handler panicked: kaboom"), "{body}");
    }

    #[tokio::test]
    async fn void_tasks_are_untracked_and_silent() {
        let (manager, log) = manager(8);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let fire = Arc::new(OperationDescriptor::builder("Fire").void().handler(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Outcome::Ready(Value::Null))
        }));

        let started = manager.start(fire, Args::new(vec![]), 7).unwrap();
        assert_eq!(started.token, None);
        assert_eq!(manager.in_flight(), 0);

        wait_until(|| runs.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn cancelling_twice_succeeds_then_fails() {
        let (manager, log) = manager(8);
        let token = manager.start(parked(), Args::new(vec![]), 3).unwrap().token.unwrap();

        assert_eq!(manager.cancel(&token), Ok(()));
        assert_eq!(
            manager.cancel(&token),
            Err(TaskError::CancellationFailure {
                token: token.clone()
            })
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(log.lock().is_empty(), "cancelled task must not respond");
        assert_eq!(manager.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_after_completion_fails() {
        let (manager, log) = manager(8);
        let token = manager.start(add(), numbers(&[1.0, 2.0]), 5).unwrap().token.unwrap();

        wait_until(|| !log.lock().is_empty()).await;
        assert_eq!(
            manager.cancel(&token),
            Err(TaskError::CancellationFailure {
                token: token.clone()
            })
        );
        assert_eq!(log.lock().len(), 1);
    }

    #[tokio::test]
    async fn task_cancelled_before_it_starts_is_untracked() {
        let (manager, log) = manager(8);
        // Root cancelled while `start` is still accepting: the shutdown race.
        manager.shared.root.cancel();
        let token = manager.start(add(), numbers(&[1.0, 2.0]), 4).unwrap().token.unwrap();

        wait_until(|| manager.in_flight() == 0).await;
        assert_eq!(manager.state(&token), None);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn cancel_unknown_token_fails() {
        let (manager, _log) = manager(8);
        assert!(matches!(
            manager.cancel("nope"),
            Err(TaskError::CancellationFailure { .. })
        ));
    }

    #[tokio::test]
    async fn running_state_is_visible_while_tracked() {
        let (manager, _log) = manager(8);
        let token = manager.start(parked(), Args::new(vec![]), 3).unwrap().token.unwrap();

        wait_until(|| manager.state(&token) == Some(TaskState::Running)).await;
        assert_eq!(manager.in_flight(), 1);
        manager.cancel(&token).unwrap();
        assert_eq!(manager.state(&token), None);
    }

    #[tokio::test]
    async fn rejects_when_limit_reached() {
        let (manager, _log) = manager(1);
        let token = manager.start(parked(), Args::new(vec![]), 1).unwrap().token.unwrap();

        let err = manager.start(add(), numbers(&[1.0, 2.0]), 2).unwrap_err();
        assert_eq!(err, TaskError::Overloaded { limit: 1 });

        // The permit is released once the cancelled task unwinds.
        manager.cancel(&token).unwrap();
        wait_until(|| manager.start(add(), numbers(&[1.0, 2.0]), 3).is_ok()).await;
    }

    #[tokio::test]
    async fn shutdown_cancels_and_refuses_new_work() {
        let (manager, log) = manager(8);
        manager.start(parked(), Args::new(vec![]), 1).unwrap();
        manager.start(parked(), Args::new(vec![]), 2).unwrap();
        assert_eq!(manager.in_flight(), 2);

        manager.shutdown();
        assert!(!manager.is_accepting());
        assert_eq!(manager.in_flight(), 0);
        assert_eq!(
            manager.start(add(), numbers(&[1.0, 2.0]), 3),
            Err(TaskError::ShuttingDown)
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(log.lock().is_empty());
    }
}
