//! Error types for layer-mux.

use std::{fmt, io};

use crate::schema::RawRpcError;
use crate::tl;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server (or synthesised locally) for one request.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30), .. }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code. `0` for locally produced errors, negative for
    /// transport-level failures.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with the numeric suffix removed.
    pub name: String,
    /// Numeric suffix extracted from the name, if any.
    pub value: Option<u32>,
    /// Free-form detail; empty for server errors.
    pub description: String,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        if !self.description.is_empty() {
            write!(f, ": {}", self.description)?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw server message like `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v), description: String::new() };
                }
            }
        }
        Self { code, name: message.to_string(), value: None, description: String::new() }
    }

    /// An error that never reached the wire, e.g. `RESPONSE_PARSE_FAILED`.
    pub fn local(name: &str, description: impl Into<String>) -> Self {
        Self { code: 0, name: name.to_string(), value: None, description: description.into() }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("*_MIGRATE")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Transport-level failure (network error or server-side 5xx).
    pub fn is_transport(&self) -> bool {
        self.code < 0 || self.code >= 500
    }

    /// `FLOOD_WAIT_n` or `FLOOD_PREMIUM_WAIT_n`.
    pub fn is_flood(&self) -> bool {
        self.value.is_some() && (self.name == "FLOOD_WAIT" || self.name == "FLOOD_PREMIUM_WAIT")
    }

    /// Errors the multiplexer retries on its own unless a fail handler
    /// claims them first.
    pub fn is_default_handled(&self) -> bool {
        self.is_transport() || self.is_flood()
    }

    /// Returns the flood-wait duration in seconds, if this is a flood error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.is_flood() { self.value.map(u64::from) } else { None }
    }

    /// The original wire name, suffix included.
    pub fn full_name(&self) -> String {
        match self.value {
            Some(v) => format!("{}_{v}", self.name),
            None => self.name.clone(),
        }
    }
}

impl From<RawRpcError> for RpcError {
    fn from(raw: RawRpcError) -> Self {
        Self::from_telegram(raw.error_code, &raw.error_message)
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from [`crate::Instance::invoke`] and storage calls.
#[derive(Debug)]
pub enum InvocationError {
    /// The server (or the multiplexer) rejected the request.
    Rpc(RpcError),
    /// Response decoding failed.
    Decode(tl::Error),
    /// The request was dropped before an answer arrived (cancelled, or the
    /// instance shut down).
    Dropped,
    /// Storage I/O failure.
    Io(io::Error),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)    => write!(f, "{e}"),
            Self::Decode(e) => write!(f, "decode error: {e}"),
            Self::Dropped   => write!(f, "request dropped"),
            Self::Io(e)     => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for InvocationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Rpc(e)    => Some(e),
            Self::Decode(e) => Some(e),
            Self::Io(e)     => Some(e),
            Self::Dropped   => None,
        }
    }
}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl From<tl::Error> for InvocationError {
    fn from(e: tl::Error) -> Self { Self::Decode(e) }
}

impl From<io::Error> for InvocationError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }
}
