//! Error taxonomy for the saga/connection/dispatch core.
//!
//! Kinds, not types: `TransientTimeout` is handled locally by the saga and
//! never needs to surface past it, but it is still a first-class variant so
//! tests can assert on *why* a saga reset to `New`.

use std::fmt;

/// Errors a `Saga` mutator method or the `Dispatcher` can report.
#[derive(Debug, Clone)]
pub enum SagaError {
    /// A per-step deadline elapsed. The saga has already reset itself to `New`.
    TransientTimeout,
    /// A remote body could not be decoded, decrypted, or parsed.
    MalformedInput(String),
    /// The caller invoked an operation the saga isn't ready for.
    InvalidState(String),
    /// A media-provider or signaling-client operation was rejected.
    Transport(String),
    /// An observer callback panicked or returned an error; logged and swallowed
    /// at the call site, but recorded here for tests that want to assert on it.
    Callback(String),
    /// A programmer error: an enum variant thought unreachable was reached.
    Fatal(String),
}

impl fmt::Display for SagaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TransientTimeout => write!(f, "step deadline elapsed"),
            Self::MalformedInput(msg) => write!(f, "malformed input: {}", msg),
            Self::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Callback(msg) => write!(f, "observer callback error: {}", msg),
            Self::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

impl std::error::Error for SagaError {}

impl From<SagaError> for String {
    fn from(err: SagaError) -> Self {
        err.to_string()
    }
}
