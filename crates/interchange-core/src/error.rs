//! Domain error types for the interchange core.

use thiserror::Error;

/// Errors surfaced by the [`crate::bus::MessageBus`] trait.
///
/// `spec.md` §7's other error kinds (malformed Manager message, unknown
/// Manager identity, unknown command, task decode failure) are all
/// recoverable-by-construction: the event loop logs and drops at the
/// point of failure (`eventloop.rs`) rather than threading a typed error
/// back through the call stack, since nothing downstream ever needs to
/// branch on which kind occurred. A version mismatch at registration is
/// fatal but is modeled as a value returned from registration
/// ([`crate::registry::Registered::VersionMismatch`]), not as an error
/// here, since it is an expected outcome the loop must act on
/// deliberately.
#[derive(Debug, Error)]
pub enum InterchangeError {
    #[error("transport error: {0}")]
    Transport(#[from] zeromq::ZmqError),
}
