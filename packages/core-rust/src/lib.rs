//! `extcall` core: host value model, argument codec, and reply envelopes.

pub mod codec;
pub mod envelope;
pub mod value;

pub use envelope::{write_output, Envelope, ReturnCode, Status, UnknownStatus, ASYNC_CANCEL};
pub use value::{ParamType, Value, ValueKind};
