//! The Scope / Digest Engine
//!
//! This module implements dirty-checking change propagation: a scope is
//! a shared mutable context, watches are observation/reaction pairs
//! registered against it, and the digest cycle re-evaluates every watch
//! until no watched value changes, firing each reaction once per observed
//! transition.
//!
//! # Concepts
//!
//! ## Scopes
//!
//! A [`Scope`] holds named [`Value`] slots plus the engine bookkeeping: a
//! watch registry, the deferred and coalesced task queues, and the phase
//! guard that keeps cycles from nesting. Child scopes inherit reads from
//! their parent but digest independently.
//!
//! ## Watches
//!
//! A watch observes a derived value and reacts to its changes. The watch
//! function is re-run on every pass (there is no dependency tracking), so
//! it should be cheap. Comparison is by reference identity by default, or
//! structurally for watches registered with
//! [`Scope::watch_by_value`].
//!
//! ## The cycle
//!
//! [`Scope::digest`] sweeps the registry repeatedly until stable, bounded
//! by a fixed pass budget so divergent watch chains fail loudly instead
//! of hanging. [`Scope::apply`] wraps "mutate, then digest";
//! [`Scope::eval_async`] and [`Scope::apply_async`] defer work through
//! the scope's [scheduler](crate::sched) without ever nesting a cycle
//! inside a running one.
//!
//! # Implementation Notes
//!
//! Everything is single-threaded and cooperatively scheduled: callbacks
//! run synchronously inside the cycle that observes them, and the only
//! suspension points are the scheduler turns used by the deferred entry
//! points. One misbehaving callback cannot take down a cycle; its error
//! is logged and isolated. A cycle that never stabilizes, or an attempt
//! to start one from inside another, is a caller bug and fails as such.

mod error;
#[allow(clippy::module_inception)]
mod scope;
mod value;
mod watch;

pub use error::{BoxError, ScopeError};
pub use scope::{ExprFn, Phase, PostDigestFn, Scope, MAX_DIGEST_PASSES};
pub use value::Value;
pub use watch::{ListenFn, WatchFn, WatchHandle};
