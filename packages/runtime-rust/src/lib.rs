//! `extcall` runtime: command dispatch and async task orchestration between a
//! host that speaks strings and typed Rust operations.

pub mod bridge;
pub mod logging;
pub mod service;

pub use bridge::{Bridge, BridgeBuilder, BridgeHandle};
pub use extcall_core::{ParamType, ReturnCode, Status, Value};
pub use service::{
    BridgeConfig, ExtensionPlugin, HostCallback, LifecycleObserver, OperationDescriptor,
    OperationError, OperationRegistry, Outcome,
};
