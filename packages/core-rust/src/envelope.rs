//! Reply envelopes and the fixed status vocabulary.
//!
//! Every request produces exactly one [`Envelope`]. Synchronous replies are
//! rendered with [`Envelope::to_reply`] and copied into the host's bounded
//! buffer with [`write_output`]; asynchronous notifications are split into a
//! callback tag ([`Envelope::callback_tag`]) and body ([`Envelope::body`]).

use std::fmt;
use std::str::FromStr;

use crate::codec;
use crate::value::Value;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Status tag carried by every envelope. Case-sensitive on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    SuccessVoid,
    Error,
    AsyncResponse,
    AsyncSent,
    AsyncSentVoid,
    AsyncFailed,
    AsyncCancelSuccess,
    AsyncCancelFailed,
}

impl Status {
    /// Wire form of the status tag.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::SuccessVoid => "SUCCESS_VOID",
            Self::Error => "ERROR",
            Self::AsyncResponse => "ASYNC_RESPONSE",
            Self::AsyncSent => "ASYNC_SENT",
            Self::AsyncSentVoid => "ASYNC_SENT_VOID",
            Self::AsyncFailed => "ASYNC_FAILED",
            Self::AsyncCancelSuccess => "ASYNC_CANCEL_SUCCESS",
            Self::AsyncCancelFailed => "ASYNC_CANCEL_FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a wire string is not part of the status vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status tag: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for Status {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "SUCCESS" => Self::Success,
            "SUCCESS_VOID" => Self::SuccessVoid,
            "ERROR" => Self::Error,
            "ASYNC_RESPONSE" => Self::AsyncResponse,
            "ASYNC_SENT" => Self::AsyncSent,
            "ASYNC_SENT_VOID" => Self::AsyncSentVoid,
            "ASYNC_FAILED" => Self::AsyncFailed,
            "ASYNC_CANCEL_SUCCESS" => Self::AsyncCancelSuccess,
            "ASYNC_CANCEL_FAILED" => Self::AsyncCancelFailed,
            other => return Err(UnknownStatus(other.to_string())),
        })
    }
}

/// Reserved request name that turns a call into a cancellation request.
pub const ASYNC_CANCEL: &str = "ASYNC_CANCEL";

// ---------------------------------------------------------------------------
// ReturnCode
// ---------------------------------------------------------------------------

/// Numeric result code handed back to the host alongside a reply, and used as
/// the error-code field of asynchronous callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ReturnCode {
    Success = 0,
    Error = 1,
    InvalidMethod = 2,
    InvalidParameters = 3,
}

impl ReturnCode {
    #[must_use]
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One response, synchronous or asynchronous. Built per response, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub status: Status,
    pub payload: Vec<Value>,
    /// Cancellation token (async responses) or correlation key.
    pub token: Option<String>,
    pub code: ReturnCode,
}

impl Envelope {
    #[must_use]
    pub fn new(status: Status, payload: Vec<Value>) -> Self {
        Self {
            status,
            payload,
            token: None,
            code: ReturnCode::Success,
        }
    }

    /// `SUCCESS` carrying the operation's single result value.
    #[must_use]
    pub fn success(value: Value) -> Self {
        Self::new(Status::Success, vec![value])
    }

    #[must_use]
    pub fn success_void() -> Self {
        Self::new(Status::SuccessVoid, Vec::new())
    }

    /// `ERROR` carrying a human-readable message.
    #[must_use]
    pub fn error(message: impl Into<String>, code: ReturnCode) -> Self {
        Self::new(Status::Error, vec![Value::Text(message.into())]).with_code(code)
    }

    /// `ASYNC_SENT` carrying the cancellation token the caller correlates by.
    #[must_use]
    pub fn async_sent(token: &str) -> Self {
        Self::new(Status::AsyncSent, vec![Value::Text(token.to_string())])
            .with_token(token)
    }

    #[must_use]
    pub fn async_sent_void() -> Self {
        Self::new(Status::AsyncSentVoid, Vec::new())
    }

    #[must_use]
    pub fn async_failed(reason: impl Into<String>) -> Self {
        Self::new(Status::AsyncFailed, vec![Value::Text(reason.into())])
            .with_code(ReturnCode::Error)
    }

    /// `ASYNC_RESPONSE` for a finished invocation: the value on success, the
    /// failure message with [`ReturnCode::Error`] otherwise.
    #[must_use]
    pub fn async_response(token: &str, outcome: Result<Value, String>) -> Self {
        let envelope = match outcome {
            Ok(value) => Self::new(Status::AsyncResponse, vec![value]),
            Err(message) => Self::new(Status::AsyncResponse, vec![Value::Text(message)])
                .with_code(ReturnCode::Error),
        };
        envelope.with_token(token)
    }

    /// Reply to an `ASYNC_CANCEL` request.
    #[must_use]
    pub fn cancel_outcome(cancelled: bool) -> Self {
        if cancelled {
            Self::new(Status::AsyncCancelSuccess, Vec::new())
        } else {
            Self::new(Status::AsyncCancelFailed, Vec::new()).with_code(ReturnCode::Error)
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: ReturnCode) -> Self {
        self.code = code;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Synchronous reply text: `["<STATUS>",[<value>,...]]`.
    #[must_use]
    pub fn to_reply(&self) -> String {
        format!("[\"{}\",{}]", self.status, self.body())
    }

    /// Callback tag: `<STATUS>|<token>|<code>`. A missing token renders as `-1`.
    #[must_use]
    pub fn callback_tag(&self) -> String {
        format!(
            "{}|{}|{}",
            self.status,
            self.token.as_deref().unwrap_or("-1"),
            self.code.as_i32()
        )
    }

    /// Callback body: the serialized payload.
    #[must_use]
    pub fn body(&self) -> String {
        codec::serialize(&self.payload)
    }
}

// ---------------------------------------------------------------------------
// Output buffer
// ---------------------------------------------------------------------------

/// Copies `text` into the host's output buffer.
///
/// At most `out.len() - 1` bytes are copied, followed by a NUL terminator.
/// Longer replies are silently truncated. Returns the number of text bytes
/// written (excluding the terminator).
pub fn write_output(out: &mut [u8], text: &str) -> usize {
    let Some(capacity) = out.len().checked_sub(1) else {
        return 0;
    };
    let bytes = text.as_bytes();
    let len = bytes.len().min(capacity);
    out[..len].copy_from_slice(&bytes[..len]);
    out[len] = 0;
    len
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
