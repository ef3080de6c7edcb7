//! Lifecycle observer trait and fan-out set.
//!
//! Defines [`LifecycleObserver`] for reacting to bridge activity (calls,
//! responses, async task transitions, host messages, errors), and
//! [`ObserverSet`] which fans each event out to every registered observer on
//! the worker pool so host entry points never wait on observer code.

use std::sync::Arc;

use extcall_core::{Envelope, Value};
use tokio::runtime::Handle;

/// Observer for bridge lifecycle events. Every method defaults to a no-op.
///
/// Used as `Arc<dyn LifecycleObserver>`.
pub trait LifecycleObserver: Send + Sync + 'static {
    /// Called when the host asks for the extension version.
    fn on_version(&self, _version: &str) {}

    /// Called for every request before dispatch.
    fn on_method_called(&self, _function: &str, _args: &[String]) {}

    /// Called with the reply handed back for a request.
    fn on_method_response(&self, _function: &str, _envelope: &Envelope) {}

    /// Called when an async invocation is accepted. Void invocations carry no token.
    fn on_async_started(&self, _operation: &str, _token: Option<&str>, _key: i64) {}

    /// Called after an async invocation delivered its single notification.
    fn on_async_completed(&self, _operation: &str, _token: &str, _success: bool) {}

    /// Called for every cancellation request, successful or not.
    fn on_async_cancelled(&self, _token: &str, _success: bool) {}

    /// Called when a message is pushed to the host outside of a request.
    fn on_send_to_host(&self, _function: &str, _payload: &[Value]) {}

    /// Called for failures that were converted into envelopes or swallowed.
    fn on_error(&self, _message: &str) {}
}

/// Owned form of an observer notification, so it can cross onto the pool.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Version(String),
    MethodCalled { function: String, args: Vec<String> },
    MethodResponse { function: String, envelope: Envelope },
    AsyncStarted { operation: String, token: Option<String>, key: i64 },
    AsyncCompleted { operation: String, token: String, success: bool },
    AsyncCancelled { token: String, success: bool },
    SendToHost { function: String, payload: Vec<Value> },
    Error(String),
}

impl LifecycleEvent {
    fn deliver(&self, observer: &dyn LifecycleObserver) {
        match self {
            Self::Version(version) => observer.on_version(version),
            Self::MethodCalled { function, args } => observer.on_method_called(function, args),
            Self::MethodResponse { function, envelope } => {
                observer.on_method_response(function, envelope);
            }
            Self::AsyncStarted {
                operation,
                token,
                key,
            } => observer.on_async_started(operation, token.as_deref(), *key),
            Self::AsyncCompleted {
                operation,
                token,
                success,
            } => observer.on_async_completed(operation, token, *success),
            Self::AsyncCancelled { token, success } => observer.on_async_cancelled(token, *success),
            Self::SendToHost { function, payload } => observer.on_send_to_host(function, payload),
            Self::Error(message) => observer.on_error(message),
        }
    }
}

/// Fans events out to multiple observers.
///
/// With a runtime handle, each observer gets its own spawned task per event,
/// so a slow or panicking observer affects nobody else. Without one (unit
/// tests), observers run inline on the caller.
#[derive(Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn LifecycleObserver>>,
    handle: Option<Handle>,
}

impl ObserverSet {
    #[must_use]
    pub fn new(observers: Vec<Arc<dyn LifecycleObserver>>, handle: Option<Handle>) -> Self {
        Self { observers, handle }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Delivers `event` to every observer.
    pub fn notify(&self, event: LifecycleEvent) {
        if self.observers.is_empty() {
            return;
        }
        match &self.handle {
            Some(handle) => {
                for observer in &self.observers {
                    let observer = Arc::clone(observer);
                    let event = event.clone();
                    handle.spawn(async move { event.deliver(observer.as_ref()) });
                }
            }
            None => {
                for observer in &self.observers {
                    event.deliver(observer.as_ref());
                }
            }
        }
    }

    pub fn error(&self, message: impl Into<String>) {
        self.notify(LifecycleEvent::Error(message.into()));
    }
}
