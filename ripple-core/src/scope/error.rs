//! Engine Errors
//!
//! Only two conditions are fatal to a cycle: starting a phase while
//! another is active, and a digest that never stabilizes. Everything a
//! caller-supplied function does wrong is caught, logged, and isolated to
//! that one invocation.

use thiserror::Error;

use super::scope::{Phase, MAX_DIGEST_PASSES};

/// Opaque error produced by a caller-supplied callback.
///
/// The engine never inspects these; it logs them and moves on.
pub type BoxError = Box<dyn std::error::Error>;

/// A fatal failure of a digest or apply cycle.
///
/// Both variants indicate a caller-level invariant violation (a nested
/// cycle, or an unstable watch dependency) that the engine cannot paper
/// over. The scope's phase is always restored before the error is
/// returned, so a failed cycle never leaves the scope locked.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScopeError {
    /// A cycle was started while another operation was running on the
    /// same scope. Use `eval_async` or `apply_async` from inside a watch
    /// or listener instead; they defer rather than nest.
    #[error("{0} already in progress")]
    PhaseInProgress(Phase),

    /// The digest was still observing changes after
    /// [`MAX_DIGEST_PASSES`] passes. Typically two watches each dirty the
    /// other's input.
    #[error("digest did not stabilize after {0} passes")]
    UnstableDigest(u32),
}

impl ScopeError {
    /// The non-convergence failure with the engine's fixed pass budget.
    pub(crate) fn unstable() -> Self {
        ScopeError::UnstableDigest(MAX_DIGEST_PASSES)
    }
}
