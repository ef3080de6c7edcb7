//! Operation descriptors, handler signatures, and the error taxonomy.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use extcall_core::{ParamType, ReturnCode, Value};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What a handler hands back: a value it already has, or a computation the
/// runtime still has to drive.
///
/// The synchronous path blocks the caller until a `Deferred` outcome
/// resolves; the asynchronous path awaits it on the worker pool.
pub enum Outcome {
    Ready(Value),
    Deferred(BoxFuture<'static, Result<Value, OperationError>>),
}

impl Outcome {
    /// Wraps a future as a deferred outcome.
    pub fn deferred<F>(fut: F) -> Self
    where
        F: Future<Output = Result<Value, OperationError>> + Send + 'static,
    {
        Self::Deferred(fut.boxed())
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

impl<T: Into<Value>> From<T> for Outcome {
    fn from(value: T) -> Self {
        Self::Ready(value.into())
    }
}

// ---------------------------------------------------------------------------
// InvocationContext
// ---------------------------------------------------------------------------

/// Per-invocation context passed to every handler.
///
/// Cancellation is cooperative: long-running handlers should check
/// [`is_cancelled`](Self::is_cancelled) or select on
/// [`cancelled`](Self::cancelled).
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Canonical name of the operation being invoked.
    pub operation: Arc<str>,
    /// Cancellation token string for tracked async invocations.
    pub token: Option<String>,
    cancel: CancellationToken,
}

impl InvocationContext {
    #[must_use]
    pub fn new(operation: Arc<str>, token: Option<String>, cancel: CancellationToken) -> Self {
        Self {
            operation,
            token,
            cancel,
        }
    }

    /// Context for an invocation nothing can cancel (sync and void calls).
    #[must_use]
    pub fn detached(operation: Arc<str>) -> Self {
        Self::new(operation, None, CancellationToken::new())
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the invocation has been cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Returns `Err(OperationError::Cancelled)` if cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::Cancelled`] once the token is cancelled.
    pub fn check_cancelled(&self) -> Result<(), OperationError> {
        if self.is_cancelled() {
            Err(OperationError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Args
// ---------------------------------------------------------------------------

/// Validated, positional arguments with typed accessors.
///
/// By the time a handler runs, arity and shapes have already been checked
/// against the descriptor, so accessor failures indicate a descriptor that
/// disagrees with its handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Args(Vec<Value>);

impl Args {
    #[must_use]
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }

    /// # Errors
    ///
    /// Returns [`OperationError::InvalidArgument`] if the argument is missing
    /// or not a number.
    pub fn number(&self, index: usize) -> Result<f64, OperationError> {
        self.typed(index, "number", Value::as_number)
    }

    /// # Errors
    ///
    /// Returns [`OperationError::InvalidArgument`] if the argument is missing
    /// or not a boolean.
    pub fn boolean(&self, index: usize) -> Result<bool, OperationError> {
        self.typed(index, "boolean", Value::as_bool)
    }

    /// # Errors
    ///
    /// Returns [`OperationError::InvalidArgument`] if the argument is missing
    /// or not text.
    pub fn text(&self, index: usize) -> Result<&str, OperationError> {
        self.typed(index, "text", Value::as_text)
    }

    /// # Errors
    ///
    /// Returns [`OperationError::InvalidArgument`] if the argument is missing
    /// or not a sequence.
    pub fn sequence(&self, index: usize) -> Result<&[Value], OperationError> {
        self.typed(index, "sequence", Value::as_sequence)
    }

    fn typed<'a, T>(
        &'a self,
        index: usize,
        expected: &'static str,
        extract: impl FnOnce(&'a Value) -> Option<T>,
    ) -> Result<T, OperationError> {
        let value = self.0.get(index).ok_or_else(|| OperationError::InvalidArgument {
            index,
            reason: "missing".to_string(),
        })?;
        extract(value).ok_or_else(|| OperationError::InvalidArgument {
            index,
            reason: format!("expected {expected}, got {}", value.kind()),
        })
    }
}

// ---------------------------------------------------------------------------
// OperationDescriptor
// ---------------------------------------------------------------------------

/// Handler signature shared by every registered operation.
pub type Handler =
    Arc<dyn Fn(Args, InvocationContext) -> Result<Outcome, OperationError> + Send + Sync>;

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamType,
    /// Used when the caller omits this (trailing) argument.
    pub default: Option<Value>,
}

impl ParamSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ParamType) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// A named, typed, callable operation. Immutable once registered.
#[derive(Clone)]
pub struct OperationDescriptor {
    name: Arc<str>,
    params: Vec<ParamSpec>,
    returns_value: bool,
    handler: Handler,
}

impl OperationDescriptor {
    /// Starts building a descriptor that returns a value.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> OperationBuilder {
        OperationBuilder {
            name: name.into(),
            params: Vec::new(),
            returns_value: true,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    #[must_use]
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    #[must_use]
    pub fn returns_value(&self) -> bool {
        self.returns_value
    }

    #[must_use]
    pub fn is_void(&self) -> bool {
        !self.returns_value
    }

    /// Calls the handler. Panics inside the handler are not caught here.
    ///
    /// # Errors
    ///
    /// Propagates the handler's own error.
    pub fn call(&self, args: Args, ctx: InvocationContext) -> Result<Outcome, OperationError> {
        (self.handler)(args, ctx)
    }
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns_value", &self.returns_value)
            .finish_non_exhaustive()
    }
}

/// Builder for [`OperationDescriptor`].
#[derive(Debug)]
pub struct OperationBuilder {
    name: String,
    params: Vec<ParamSpec>,
    returns_value: bool,
}

impl OperationBuilder {
    /// Appends a required parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, kind: ParamType) -> Self {
        self.params.push(ParamSpec::new(name, kind));
        self
    }

    /// Appends a parameter with a default value.
    #[must_use]
    pub fn param_with_default(
        mut self,
        name: impl Into<String>,
        kind: ParamType,
        default: impl Into<Value>,
    ) -> Self {
        self.params.push(ParamSpec::new(name, kind).with_default(default));
        self
    }

    /// Marks the operation as void: it never produces a result value.
    #[must_use]
    pub fn void(mut self) -> Self {
        self.returns_value = false;
        self
    }

    /// Finishes with a handler.
    pub fn handler<F>(self, handler: F) -> OperationDescriptor
    where
        F: Fn(Args, InvocationContext) -> Result<Outcome, OperationError> + Send + Sync + 'static,
    {
        OperationDescriptor {
            name: Arc::from(self.name),
            params: self.params,
            returns_value: self.returns_value,
            handler: Arc::new(handler),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors returned by operation handlers.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("{0}")]
    Failed(String),
    #[error("invalid argument {index}: {reason}")]
    InvalidArgument { index: usize, reason: String },
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Errors from the operation registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("operation '{name}' is already registered")]
    DuplicateOperation { name: String },
    #[error("operation '{name}' not found")]
    NotFound { name: String },
    #[error("operation name must not be empty")]
    EmptyName,
    #[error("operations already registered elsewhere: {}", names.join(", "))]
    Collisions { names: Vec<String> },
}

/// Failures surfaced to the host as `ERROR` envelopes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid Method")]
    InvalidMethod,
    #[error("Parameters missing!")]
    MissingParameters,
    #[error("Parameter count mismatch: expected {expected}, got {actual}")]
    ParameterMismatch { expected: usize, actual: usize },
    #[error("Type mismatch for parameter '{param}': expected {expected}, got {actual}")]
    TypeMismatch {
        param: String,
        expected: String,
        actual: String,
    },
    #[error("{0}")]
    InvocationFailure(String),
    #[error("Unknown or already finished task: {token}")]
    CancellationFailure { token: String },
    #[error("Callback delivery failed: {0}")]
    DeliveryFailure(String),
}

impl DispatchError {
    /// Return code handed to the host for this failure.
    #[must_use]
    pub fn return_code(&self) -> ReturnCode {
        match self {
            Self::InvalidMethod => ReturnCode::InvalidMethod,
            Self::MissingParameters | Self::ParameterMismatch { .. } | Self::TypeMismatch { .. } => {
                ReturnCode::InvalidParameters
            }
            Self::InvocationFailure(_)
            | Self::CancellationFailure { .. }
            | Self::DeliveryFailure(_) => ReturnCode::Error,
        }
    }
}

impl From<OperationError> for DispatchError {
    fn from(err: OperationError) -> Self {
        Self::InvocationFailure(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn add() -> OperationDescriptor {
        OperationDescriptor::builder("Add")
            .param("a", ParamType::Number)
            .param("b", ParamType::Number)
            .handler(|args, _ctx| Ok((args.number(0)? + args.number(1)?).into()))
    }

    #[test]
    fn builder_records_signature() {
        let op = add();
        assert_eq!(op.name(), "Add");
        assert_eq!(op.params().len(), 2);
        assert_eq!(op.params()[1].kind, ParamType::Number);
        assert!(op.returns_value());
    }

    #[test]
    fn void_builder() {
        let op = OperationDescriptor::builder("Fire")
            .void()
            .handler(|_, _| Ok(Outcome::Ready(Value::Null)));
        assert!(op.is_void());
    }

    #[test]
    fn call_invokes_handler() {
        let op = add();
        let ctx = InvocationContext::detached(op.name_arc());
        let outcome = op
            .call(Args::new(vec![Value::Number(2.0), Value::Number(3.0)]), ctx)
            .unwrap();
        assert!(matches!(outcome, Outcome::Ready(Value::Number(n)) if (n - 5.0).abs() < f64::EPSILON));
    }

    #[test]
    fn typed_accessors_report_shape() {
        let args = Args::new(vec![Value::from("x")]);
        let err = args.number(0).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument 0: expected number, got text");
        let err = args.boolean(3).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument 3: missing");
        assert_eq!(args.text(0).unwrap(), "x");
    }

    #[test]
    fn detached_context_is_never_cancelled() {
        let ctx = InvocationContext::detached(Arc::from("op"));
        assert!(!ctx.is_cancelled());
        assert!(ctx.check_cancelled().is_ok());
    }

    #[test]
    fn dispatch_errors_map_to_return_codes() {
        assert_eq!(DispatchError::InvalidMethod.return_code(), ReturnCode::InvalidMethod);
        assert_eq!(
            DispatchError::ParameterMismatch { expected: 2, actual: 1 }.return_code(),
            ReturnCode::InvalidParameters
        );
        assert_eq!(
            DispatchError::InvocationFailure("x".into()).return_code(),
            ReturnCode::Error
        );
    }

    #[test]
    fn dispatch_error_messages() {
        assert_eq!(DispatchError::InvalidMethod.to_string(), "Invalid Method");
        assert_eq!(
            DispatchError::ParameterMismatch { expected: 2, actual: 1 }.to_string(),
            "Parameter count mismatch: expected 2, got 1"
        );
    }
}
