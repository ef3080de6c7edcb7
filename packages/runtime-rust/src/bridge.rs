//! Bridge lifecycle and host entry points.
//!
//! [`BridgeBuilder::build`] allocates the worker runtime, composes plugin
//! registries, and wires dispatcher, task manager, emitter and observers
//! together. The resulting [`Bridge`] owns the runtime; [`BridgeHandle`] is
//! the cheap, cloneable view handed to plugins and host glue.

use std::ops::Deref;
use std::sync::Arc;

use anyhow::Context as _;
use extcall_core::{write_output, Envelope, ReturnCode, Value};
use tokio::runtime::{Handle, Runtime};
use tracing::{info, warn};

use crate::service::callback::{CallbackEmitter, HostCallback};
use crate::service::config::BridgeConfig;
use crate::service::observer::{LifecycleEvent, LifecycleObserver, ObserverSet};
use crate::service::registry::{ExtensionPlugin, OperationRegistry};
use crate::service::router::Dispatcher;

// ---------------------------------------------------------------------------
// BridgeBuilder
// ---------------------------------------------------------------------------

/// Collects plugins, observers and the host callback before startup.
pub struct BridgeBuilder {
    config: BridgeConfig,
    plugins: Vec<Arc<dyn ExtensionPlugin>>,
    observers: Vec<Arc<dyn LifecycleObserver>>,
    callback: Option<Arc<dyn HostCallback>>,
}

impl BridgeBuilder {
    #[must_use]
    pub fn plugin(mut self, plugin: impl ExtensionPlugin) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    #[must_use]
    pub fn observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    #[must_use]
    pub fn callback(mut self, callback: Arc<dyn HostCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Starts the worker runtime and registers every plugin.
    ///
    /// Operation names claimed by an earlier plugin stay with that plugin;
    /// the collision is logged. Each plugin's `on_start` hook is spawned once
    /// the bridge is assembled.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be created or a plugin fails to
    /// register its own operations.
    pub fn build(self) -> anyhow::Result<Bridge> {
        let config = self.config;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name(format!("{}-worker", config.extension_name))
            .enable_all()
            .build()
            .context("building worker runtime")?;
        let handle = runtime.handle().clone();

        let observers = Arc::new(ObserverSet::new(self.observers, Some(handle.clone())));
        let emitter = Arc::new(CallbackEmitter::new(
            config.extension_name.as_str(),
            Arc::clone(&observers),
        ));
        if let Some(callback) = self.callback {
            emitter.set_callback(callback);
        }

        let registry = Arc::new(OperationRegistry::new());
        for plugin in &self.plugins {
            let scoped = OperationRegistry::new();
            plugin
                .register(&scoped)
                .with_context(|| format!("registering plugin '{}'", plugin.name()))?;
            match registry.compose(&scoped) {
                Ok(()) => info!(plugin = plugin.name(), operations = scoped.len(), "plugin registered"),
                Err(err) => warn!(
                    plugin = plugin.name(),
                    error = %err,
                    "operation name collision, keeping the earlier registration"
                ),
            }
        }

        let tasks = crate::service::worker::AsyncTaskManager::new(
            handle.clone(),
            Arc::clone(&emitter),
            Arc::clone(&observers),
            config.max_in_flight,
        );
        let dispatcher = Dispatcher::new(registry, tasks, Arc::clone(&observers), handle.clone());

        info!(
            extension = %config.extension_name,
            version = %config.version,
            operations = dispatcher.registry().len(),
            "bridge started"
        );

        let bridge = BridgeHandle(Arc::new(Inner {
            config,
            dispatcher,
            emitter,
            observers,
            handle: handle.clone(),
        }));

        for plugin in self.plugins {
            let bridge = bridge.clone();
            handle.spawn(async move {
                if let Err(err) = plugin.on_start(bridge).await {
                    warn!(plugin = plugin.name(), error = %err, "plugin start hook failed");
                }
            });
        }

        Ok(Bridge {
            runtime: Some(runtime),
            handle: bridge,
        })
    }
}

// ---------------------------------------------------------------------------
// Bridge
// ---------------------------------------------------------------------------

/// A running bridge. Dropping it cancels outstanding async work and shuts
/// the worker runtime down without waiting.
///
/// Entry points are available through `Deref<Target = BridgeHandle>`.
pub struct Bridge {
    runtime: Option<Runtime>,
    handle: BridgeHandle,
}

impl Bridge {
    #[must_use]
    pub fn builder(config: BridgeConfig) -> BridgeBuilder {
        BridgeBuilder {
            config,
            plugins: Vec::new(),
            observers: Vec::new(),
            callback: None,
        }
    }

    #[must_use]
    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }
}

impl Deref for Bridge {
    type Target = BridgeHandle;

    fn deref(&self) -> &BridgeHandle {
        &self.handle
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeHandle
// ---------------------------------------------------------------------------

struct Inner {
    config: BridgeConfig,
    dispatcher: Dispatcher,
    emitter: Arc<CallbackEmitter>,
    observers: Arc<ObserverSet>,
    handle: Handle,
}

/// Cloneable access to the bridge's entry points.
///
/// The `call*` and `invoke` entry points must not be called from inside the
/// worker runtime.
#[derive(Clone)]
pub struct BridgeHandle(Arc<Inner>);

impl BridgeHandle {
    /// Dispatches a request and returns the reply envelope.
    pub fn invoke<S: AsRef<str>>(&self, function: &str, args: &[S]) -> Envelope {
        self.0.dispatcher.invoke(function, args)
    }

    /// Dispatches an argument-less request, writing the reply into `out`.
    pub fn call(&self, function: &str, out: &mut [u8]) -> ReturnCode {
        self.call_with_args::<&str>(function, &[], out)
    }

    /// Dispatches a request, writing the reply into `out` (truncated to
    /// `out.len() - 1` bytes and NUL-terminated).
    pub fn call_with_args<S: AsRef<str>>(
        &self,
        function: &str,
        args: &[S],
        out: &mut [u8],
    ) -> ReturnCode {
        let envelope = self.invoke(function, args);
        write_output(out, &envelope.to_reply());
        envelope.code
    }

    /// Writes the version string into `out`. Returns the bytes written.
    pub fn version(&self, out: &mut [u8]) -> usize {
        let version = &self.0.config.version;
        self.0
            .observers
            .notify(LifecycleEvent::Version(version.clone()));
        write_output(out, version)
    }

    /// Pushes an unsolicited message to the host.
    pub fn send_to_host(&self, function: &str, payload: &[Value]) -> bool {
        self.0.emitter.send_to_host(function, payload)
    }

    /// Cancels a tracked async invocation.
    pub fn cancel(&self, token: &str) -> bool {
        self.0.dispatcher.tasks().cancel(token).is_ok()
    }

    /// Installs or replaces the host delivery primitive.
    pub fn register_callback(&self, callback: Arc<dyn HostCallback>) {
        self.0.emitter.set_callback(callback);
    }

    #[must_use]
    pub fn registry(&self) -> &OperationRegistry {
        self.0.dispatcher.registry()
    }

    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.0.config
    }

    /// Tracked async invocations still pending or running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.0.dispatcher.tasks().in_flight()
    }

    /// Handle of the worker runtime, for spawning host-side work.
    #[must_use]
    pub fn runtime(&self) -> &Handle {
        &self.0.handle
    }

    /// Stops accepting async work and cancels everything outstanding.
    /// Cancelled invocations emit nothing afterwards.
    pub fn shutdown(&self) {
        let tasks = self.0.dispatcher.tasks();
        if tasks.is_accepting() {
            tasks.shutdown();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use extcall_core::{ParamType, Status};
    use parking_lot::Mutex;

    use super::*;
    use crate::service::callback::DeliveryError;
    use crate::service::operation::{OperationDescriptor, Outcome, RegistryError};

    struct Ping {
        name: &'static str,
        answer: f64,
    }

    #[async_trait]
    impl ExtensionPlugin for Ping {
        fn name(&self) -> &'static str {
            self.name
        }

        fn register(&self, registry: &OperationRegistry) -> Result<(), RegistryError> {
            let answer = self.answer;
            registry.register(
                OperationDescriptor::builder("Ping")
                    .param("n", ParamType::Number)
                    .handler(move |args, _| Ok((args.number(0)? + answer).into())),
            )
        }

        async fn on_start(&self, bridge: BridgeHandle) -> anyhow::Result<()> {
            bridge.send_to_host("started", &[Value::from(self.name)]);
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl ExtensionPlugin for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn register(&self, registry: &OperationRegistry) -> Result<(), RegistryError> {
            registry.register(
                OperationDescriptor::builder("")
                    .handler(|_, _| Ok(Outcome::Ready(Value::Null))),
            )
        }
    }

    type Deliveries = Arc<Mutex<Vec<(String, String)>>>;

    fn recorder() -> (Arc<dyn HostCallback>, Deliveries) {
        let log: Deliveries = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let callback: Arc<dyn HostCallback> =
            Arc::new(move |_: &str, tag: &str, body: &str| -> Result<(), DeliveryError> {
                sink.lock().push((tag.to_string(), body.to_string()));
                Ok(())
            });
        (callback, log)
    }

    fn small_config() -> BridgeConfig {
        BridgeConfig {
            worker_threads: 2,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn version_is_written_to_buffer() {
        let bridge = Bridge::builder(BridgeConfig {
            version: "1.2.3".into(),
            ..small_config()
        })
        .build()
        .unwrap();

        let mut out = [0u8; 16];
        assert_eq!(bridge.version(&mut out), 5);
        assert_eq!(&out[..6], b"1.2.3\0");
    }

    #[test]
    fn first_plugin_wins_on_collision() {
        let bridge = Bridge::builder(small_config())
            .plugin(Ping { name: "first", answer: 1.0 })
            .plugin(Ping { name: "second", answer: 100.0 })
            .build()
            .unwrap();

        assert_eq!(bridge.registry().len(), 1);
        assert_eq!(
            bridge.invoke("Ping", &["1"]).to_reply(),
            r#"["SUCCESS",[2]]"#
        );
    }

    #[test]
    fn plugin_registration_failure_aborts_build() {
        let err = Bridge::builder(small_config()).plugin(Broken).build().err().unwrap();
        assert!(format!("{err:#}").contains("registering plugin 'broken'"));
    }

    #[test]
    fn start_hooks_run_after_build() {
        let (callback, log) = recorder();
        let _bridge = Bridge::builder(small_config())
            .plugin(Ping { name: "first", answer: 1.0 })
            .callback(callback)
            .build()
            .unwrap();

        for _ in 0..400 {
            if !log.lock().is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            log.lock().clone(),
            vec![("started".to_string(), r#"["first"]"#.to_string())]
        );
    }

    #[test]
    fn call_truncates_reply_and_returns_code() {
        let bridge = Bridge::builder(small_config())
            .plugin(Ping { name: "p", answer: 0.5 })
            .build()
            .unwrap();

        let mut out = [0u8; 8];
        let code = bridge.call_with_args("Ping", &["1"], &mut out);
        assert_eq!(code, ReturnCode::Success);
        assert_eq!(&out, b"[\"SUCCE\0");

        let mut out = [0u8; 64];
        assert_eq!(bridge.call("Nope", &mut out), ReturnCode::InvalidMethod);
    }

    #[test]
    fn shutdown_refuses_async_work() {
        let bridge = Bridge::builder(small_config())
            .plugin(Ping { name: "p", answer: 0.0 })
            .build()
            .unwrap();
        bridge.shutdown();
        bridge.shutdown();
        assert_eq!(bridge.invoke("Ping|1", &["1"]).status, Status::AsyncFailed);
        assert_eq!(bridge.in_flight(), 0);
    }

    #[test]
    fn register_callback_after_build() {
        let bridge = Bridge::builder(small_config()).build().unwrap();
        assert!(!bridge.send_to_host("x", &[]));
        let (callback, log) = recorder();
        bridge.register_callback(callback);
        assert!(bridge.send_to_host("x", &[Value::from(true)]));
        assert_eq!(log.lock()[0], ("x".to_string(), "[true]".to_string()));
    }
}
