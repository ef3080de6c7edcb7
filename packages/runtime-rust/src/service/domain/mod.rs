//! Demo operations.
//!
//! `DemoPlugin` registers a small catalogue covering every parameter shape,
//! void and deferred operations, and a failing one. `TracingObserver` logs
//! every lifecycle event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use extcall_core::{Envelope, ParamType, Value};
use tracing::{debug, info, warn};

use crate::bridge::BridgeHandle;
use crate::service::observer::LifecycleObserver;
use crate::service::operation::{OperationDescriptor, OperationError, Outcome, RegistryError};
use crate::service::registry::{ExtensionPlugin, OperationRegistry};

/// Example plugin with one operation per supported shape.
pub struct DemoPlugin {
    version: Arc<str>,
}

impl DemoPlugin {
    #[must_use]
    pub fn new(version: impl Into<Arc<str>>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Default for DemoPlugin {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"))
    }
}

fn one_to_five() -> Value {
    Value::from(vec![1, 2, 3, 4, 5])
}

#[async_trait]
impl ExtensionPlugin for DemoPlugin {
    fn name(&self) -> &'static str {
        "demo"
    }

    fn register(&self, registry: &OperationRegistry) -> Result<(), RegistryError> {
        let version = Arc::clone(&self.version);
        registry.register(
            OperationDescriptor::builder("Version")
                .handler(move |_, _| Ok(Value::Text(version.to_string()).into())),
        )?;

        for name in ["Numeric", "Add"] {
            registry.register(
                OperationDescriptor::builder(name)
                    .param("first", ParamType::Number)
                    .param("second", ParamType::Number)
                    .handler(|args, ctx| {
                        let (first, second) = (args.number(0)?, args.number(1)?);
                        debug!(operation = %ctx.operation, first, second, "adding");
                        Ok((first + second).into())
                    }),
            )?;
        }

        registry.register(
            OperationDescriptor::builder("Boolean")
                .param("input", ParamType::Boolean)
                .handler(|args, _| {
                    debug!(input = args.boolean(0)?, "Boolean called");
                    Ok(Value::Sequence(vec![Value::Boolean(true), Value::from(1000)]).into())
                }),
        )?;

        registry.register(
            OperationDescriptor::builder("String")
                .param("input", ParamType::Text)
                .handler(|args, _| Ok(args.text(0)?.to_string().into())),
        )?;

        registry.register(
            OperationDescriptor::builder("Null")
                .param("input", ParamType::Boolean)
                .void()
                .handler(|args, _| {
                    debug!(input = args.boolean(0)?, "Null called");
                    Ok(Outcome::Ready(Value::Null))
                }),
        )?;

        registry.register(
            OperationDescriptor::builder("Array")
                .param("first", ParamType::Number)
                .param("second", ParamType::Sequence)
                .param("third", ParamType::Number)
                .handler(|args, _| {
                    debug!(items = args.sequence(1)?.len(), "Array called");
                    Ok(one_to_five().into())
                }),
        )?;

        registry.register(
            OperationDescriptor::builder("ArrayInner")
                .param("items", ParamType::Sequence)
                .handler(|_, _| {
                    let nested = Value::Sequence(vec![
                        Value::from(1),
                        Value::from(2),
                        Value::from(3),
                        Value::from(4),
                        Value::from(vec![1]),
                        Value::from(5),
                    ]);
                    Ok(nested.into())
                }),
        )?;

        registry.register(
            OperationDescriptor::builder("NoArgs").handler(|_, _| Ok(one_to_five().into())),
        )?;

        registry.register(
            OperationDescriptor::builder("Sleep")
                .param_with_default("ms", ParamType::Number, 1000)
                .handler(|args, ctx| {
                    let ms = args.number(0)?;
                    let duration = Duration::try_from_secs_f64(ms / 1000.0).map_err(|_| {
                        OperationError::InvalidArgument {
                            index: 0,
                            reason: format!("not a valid sleep duration: {ms}"),
                        }
                    })?;
                    Ok(Outcome::deferred(async move {
                        tokio::select! {
                            () = tokio::time::sleep(duration) => Ok(Value::Number(ms)),
                            () = ctx.cancelled() => Err(OperationError::Cancelled),
                        }
                    }))
                }),
        )?;

        registry.register(
            OperationDescriptor::builder("Fail")
                .param_with_default("message", ParamType::Text, "failure requested")
                .handler(|args, _| Err(OperationError::failed(args.text(0)?))),
        )?;

        Ok(())
    }

    async fn on_start(&self, bridge: BridgeHandle) -> anyhow::Result<()> {
        bridge.send_to_host("test_method1", &[Value::from(1), Value::from(2), Value::from(3)]);
        bridge.send_to_host("test_method2", &[Value::from(true)]);
        info!(version = %self.version, "demo plugin started");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TracingObserver
// ---------------------------------------------------------------------------

/// Logs every lifecycle event through `tracing`.
#[derive(Debug, Default)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_version(&self, version: &str) {
        info!(version, "version requested");
    }

    fn on_method_called(&self, function: &str, args: &[String]) {
        info!(function, ?args, "method called");
    }

    fn on_method_response(&self, function: &str, envelope: &Envelope) {
        info!(function, response = %envelope.to_reply(), "method responded");
    }

    fn on_async_started(&self, operation: &str, token: Option<&str>, key: i64) {
        info!(operation, token, key, "async task started");
    }

    fn on_async_completed(&self, operation: &str, token: &str, success: bool) {
        info!(operation, token, success, "async task completed");
    }

    fn on_async_cancelled(&self, token: &str, success: bool) {
        info!(token, success, "async task cancel requested");
    }

    fn on_send_to_host(&self, function: &str, payload: &[Value]) {
        info!(function, items = payload.len(), "sent to host");
    }

    fn on_error(&self, message: &str) {
        warn!(message, "bridge error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::operation::{Args, InvocationContext};
    use crate::service::worker::run;

    fn registry() -> OperationRegistry {
        let registry = OperationRegistry::new();
        DemoPlugin::new("9.9.9").register(&registry).unwrap();
        registry
    }

    async fn call(
        registry: &OperationRegistry,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, OperationError> {
        let descriptor = registry.resolve(name).unwrap();
        let ctx = InvocationContext::detached(descriptor.name_arc());
        run(&descriptor, Args::new(args), ctx).await
    }

    #[test]
    fn registers_full_catalogue() {
        assert_eq!(
            registry().names(),
            vec![
                "Version", "Numeric", "Add", "Boolean", "String", "Null", "Array", "ArrayInner",
                "NoArgs", "Sleep", "Fail"
            ]
        );
        assert!(registry().is_void("null"));
    }

    #[tokio::test]
    async fn version_reports_configured_string() {
        let value = call(&registry(), "Version", vec![]).await.unwrap();
        assert_eq!(value, Value::from("9.9.9"));
    }

    #[tokio::test]
    async fn boolean_and_array_inner_shapes() {
        let registry = registry();
        let value = call(&registry, "Boolean", vec![Value::Boolean(true)]).await.unwrap();
        assert_eq!(extcall_core::codec::serialize_value(&value), "[true,1000]");

        let value = call(&registry, "ArrayInner", vec![Value::Sequence(vec![])]).await.unwrap();
        assert_eq!(extcall_core::codec::serialize_value(&value), "[1,2,3,4,[1],5]");
    }

    #[tokio::test]
    async fn fail_uses_message() {
        let err = call(&registry(), "Fail", vec![Value::from("nope")]).await.unwrap_err();
        assert_eq!(err.to_string(), "nope");
    }

    #[tokio::test]
    async fn sleep_rejects_negative_durations() {
        let err = call(&registry(), "Sleep", vec![Value::Number(-1.0)]).await.unwrap_err();
        assert!(matches!(err, OperationError::InvalidArgument { index: 0, .. }));
    }

    #[tokio::test]
    async fn sleep_observes_cancellation() {
        let registry = registry();
        let descriptor = registry.resolve("Sleep").unwrap();
        let cancel = tokio_util::sync::CancellationToken::new();
        let ctx = InvocationContext::new(descriptor.name_arc(), Some("t".into()), cancel.clone());
        cancel.cancel();
        let err = run(&descriptor, Args::new(vec![Value::Number(60_000.0)]), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Cancelled));
    }
}
