//! Error taxonomy shared by the routing core.
//!
//! Protocol-validation errors are terminal for the message being processed:
//! no stored state is mutated and the message is dropped. `Unavailable` is
//! the one soft case — the ADR path swallows it and skips the cycle.

use thiserror::Error;

/// Errors produced by the routing core.
#[derive(Debug, Error)]
pub enum RoutingError {
    /// No device session is bound to the address or identity.
    #[error("device not found")]
    NotFound,
    /// No candidate session's MIC validates the payload.
    #[error("no session matches the message integrity code")]
    NoMatch,
    /// Frame counter indicates a replay or an excessive forward gap.
    #[error("invalid frame counter")]
    InvalidFrameCounter,
    /// Malformed payload or missing required metadata.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Nonce replay detected during activation.
    #[error("nonce already used")]
    AlreadyUsed,
    /// The requested computation cannot be performed in the current state.
    #[error("unavailable")]
    Unavailable,
    /// The persistence backend rejected a write.
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl RoutingError {
    /// Shorthand for [`RoutingError::InvalidArgument`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        RoutingError::InvalidArgument(msg.into())
    }
}

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, RoutingError>;
