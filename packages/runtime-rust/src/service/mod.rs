//! Operation dispatch and execution.
//!
//! 1. **Operations** (`operation`): descriptors, handler signatures, errors
//! 2. **Registry** (`registry`): name -> descriptor lookup and plugins
//! 3. **Routing** (`router`): request parsing, argument binding, sync/async split
//! 4. **Async tasks** (`worker`): token tracking and at-most-one notification
//! 5. **Callbacks** (`callback`) and **observers** (`observer`): outbound events
//! 6. **Demo** (`domain`): example operations

pub mod callback;
pub mod config;
pub mod domain;
pub mod observer;
pub mod operation;
pub mod registry;
pub mod router;
pub mod worker;

// Re-export key types for convenient access.
pub use callback::{CallbackEmitter, DeliveryError, HostCallback};
pub use config::{BridgeConfig, LogConfig};
pub use domain::{DemoPlugin, TracingObserver};
pub use observer::{LifecycleEvent, LifecycleObserver, ObserverSet};
pub use operation::{
    Args, DispatchError, InvocationContext, OperationBuilder, OperationDescriptor,
    OperationError, Outcome, ParamSpec, RegistryError,
};
pub use registry::{ExtensionPlugin, OperationRegistry};
pub use router::{bind_arguments, Dispatcher};
pub use worker::{AsyncTaskManager, StartedTask, TaskError, TaskState};
