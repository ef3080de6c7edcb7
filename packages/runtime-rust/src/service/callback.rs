//! Out-of-band delivery of envelopes to the host.
//!
//! The host registers one delivery primitive ([`HostCallback`]). The
//! [`CallbackEmitter`] formats envelopes into `(tag, body)` pairs and hands
//! them over. Delivery failures are logged and reported to observers but never
//! propagate: by the time a callback fails there is no channel left to report
//! it through.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use extcall_core::{codec, Envelope, ReturnCode, Status, Value};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::observer::{LifecycleEvent, ObserverSet};
use super::operation::DispatchError;

// ---------------------------------------------------------------------------
// HostCallback
// ---------------------------------------------------------------------------

/// Errors reported by a host delivery primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("no host callback registered")]
    NoCallback,
    #[error("host rejected callback: {0}")]
    Rejected(String),
    #[error("host callback panicked")]
    Panicked,
}

/// Host-provided "deliver this message" primitive.
///
/// `extension` is the extension's name, `function` the callback tag, `data`
/// the serialized body.
pub trait HostCallback: Send + Sync {
    /// # Errors
    ///
    /// Returns a [`DeliveryError`] if the host could not accept the message.
    fn deliver(&self, extension: &str, function: &str, data: &str) -> Result<(), DeliveryError>;
}

impl<F> HostCallback for F
where
    F: Fn(&str, &str, &str) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, extension: &str, function: &str, data: &str) -> Result<(), DeliveryError> {
        self(extension, function, data)
    }
}

// ---------------------------------------------------------------------------
// CallbackEmitter
// ---------------------------------------------------------------------------

/// Formats envelopes and forwards them to the registered [`HostCallback`].
pub struct CallbackEmitter {
    extension_name: Arc<str>,
    callback: RwLock<Option<Arc<dyn HostCallback>>>,
    observers: Arc<ObserverSet>,
}

impl CallbackEmitter {
    #[must_use]
    pub fn new(extension_name: impl Into<Arc<str>>, observers: Arc<ObserverSet>) -> Self {
        Self {
            extension_name: extension_name.into(),
            callback: RwLock::new(None),
            observers,
        }
    }

    /// Installs or replaces the host delivery primitive.
    pub fn set_callback(&self, callback: Arc<dyn HostCallback>) {
        *self.callback.write() = Some(callback);
    }

    #[must_use]
    pub fn has_callback(&self) -> bool {
        self.callback.read().is_some()
    }

    /// Emits `tag = "<status>|<token>|<code>"`, `body = serialize(payload)`.
    pub fn emit(&self, status: Status, payload: Vec<Value>, token: &str, code: ReturnCode) -> bool {
        let envelope = Envelope::new(status, payload)
            .with_token(token)
            .with_code(code);
        self.emit_envelope(&envelope)
    }

    /// Emits a prepared envelope. Returns whether the host accepted it.
    pub fn emit_envelope(&self, envelope: &Envelope) -> bool {
        let tag = envelope.callback_tag();
        let body = envelope.body();
        debug!(extension = %self.extension_name, %tag, %body, "callback to host");
        self.deliver_logged(&tag, &body)
    }

    /// Pushes an unsolicited message to the host: `tag = function`.
    pub fn send_to_host(&self, function: &str, payload: &[Value]) -> bool {
        if function.is_empty() {
            warn!("sending to host with an empty function name");
        }
        self.observers.notify(LifecycleEvent::SendToHost {
            function: function.to_string(),
            payload: payload.to_vec(),
        });

        let body = codec::serialize(payload);
        debug!(extension = %self.extension_name, function, %body, "sending data to host");
        self.deliver_logged(function, &body)
    }

    fn deliver_logged(&self, tag: &str, body: &str) -> bool {
        match self.deliver(tag, body) {
            Ok(()) => true,
            Err(err) => {
                let failure = DispatchError::DeliveryFailure(err.to_string());
                warn!(extension = %self.extension_name, tag, error = %failure, "callback delivery failed");
                self.observers.error(failure.to_string());
                false
            }
        }
    }

    fn deliver(&self, tag: &str, body: &str) -> Result<(), DeliveryError> {
        let callback = self
            .callback
            .read()
            .clone()
            .ok_or(DeliveryError::NoCallback)?;
        catch_unwind(AssertUnwindSafe(|| {
            callback.deliver(&self.extension_name, tag, body)
        }))
        .map_err(|_| DeliveryError::Panicked)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::service::observer::LifecycleObserver;

    type Deliveries = Arc<Mutex<Vec<(String, String, String)>>>;

    fn recording() -> (Arc<dyn HostCallback>, Deliveries) {
        let log: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let callback: Arc<dyn HostCallback> =
            Arc::new(move |ext: &str, function: &str, data: &str| -> Result<(), DeliveryError> {
                sink.lock()
                    .push((ext.to_string(), function.to_string(), data.to_string()));
                Ok(())
            });
        (callback, log)
    }

    #[derive(Default)]
    struct ErrorCounter(Mutex<Vec<String>>);

    impl LifecycleObserver for ErrorCounter {
        fn on_error(&self, message: &str) {
            self.0.lock().push(message.to_string());
        }
    }

    fn emitter_with(observer: Arc<ErrorCounter>) -> CallbackEmitter {
        let observers: Vec<Arc<dyn LifecycleObserver>> = vec![observer];
        CallbackEmitter::new("ext", Arc::new(ObserverSet::new(observers, None)))
    }

    #[test]
    fn emit_formats_tag_and_body() {
        let emitter = emitter_with(Arc::default());
        let (callback, log) = recording();
        emitter.set_callback(callback);

        assert!(emitter.emit(
            Status::AsyncResponse,
            vec![Value::Number(20.0)],
            "tok",
            ReturnCode::Success,
        ));
        assert_eq!(
            log.lock().clone(),
            vec![("ext".into(), "ASYNC_RESPONSE|tok|0".into(), "[20]".into())]
        );
    }

    #[test]
    fn send_to_host_uses_function_as_tag() {
        let emitter = emitter_with(Arc::default());
        let (callback, log) = recording();
        emitter.set_callback(callback);

        assert!(emitter.send_to_host("test_method1", &[Value::from(1), Value::from(2)]));
        assert_eq!(
            log.lock().clone(),
            vec![("ext".into(), "test_method1".into(), "[1,2]".into())]
        );
    }

    #[test]
    fn missing_callback_is_swallowed_and_reported() {
        let errors = Arc::new(ErrorCounter::default());
        let emitter = emitter_with(errors.clone());

        assert!(!emitter.has_callback());
        assert!(!emitter.send_to_host("x", &[]));
        assert_eq!(
            errors.0.lock().clone(),
            vec!["Callback delivery failed: no host callback registered"]
        );
    }

    #[test]
    fn rejecting_callback_is_swallowed() {
        let errors = Arc::new(ErrorCounter::default());
        let emitter = emitter_with(errors.clone());
        emitter.set_callback(Arc::new(|_: &str, _: &str, _: &str| -> Result<(), DeliveryError> {
            Err(DeliveryError::Rejected("queue full".into()))
        }));

        let ok = emitter.emit_envelope(&Envelope::async_response("t", Ok(Value::Null)));
        assert!(!ok);
        assert_eq!(errors.0.lock().len(), 1);
    }

    #[test]
    fn panicking_callback_does_not_unwind_into_the_emitter() {
        let errors = Arc::new(ErrorCounter::default());
        let emitter = emitter_with(errors.clone());
        emitter.set_callback(Arc::new(|_: &str, _: &str, _: &str| -> Result<(), DeliveryError> {
            panic!("host crashed")
        }));

        assert!(!emitter.send_to_host("x", &[]));
        assert_eq!(
            errors.0.lock().clone(),
            vec!["Callback delivery failed: host callback panicked"]
        );
    }

    #[test]
    fn set_callback_replaces_previous() {
        let emitter = emitter_with(Arc::default());
        let (first, first_log) = recording();
        let (second, second_log) = recording();
        emitter.set_callback(first);
        emitter.set_callback(second);

        emitter.send_to_host("x", &[]);
        assert!(first_log.lock().is_empty());
        assert_eq!(second_log.lock().len(), 1);
    }
}
