//! Watch Records
//!
//! A `Watch` pairs an observation function with a reaction: the watch
//! function derives a value from the scope, and the listen function runs
//! when that value differs from the last observation. Records live in the
//! owning scope's registry in registration order; that order is
//! load-bearing, because every digest pass sweeps the registry from the
//! front.
//!
//! Registration hands back a [`WatchHandle`]. Disposal is explicit and
//! identity-based: the handle removes its exact record no matter how the
//! registry has shifted around it, and disposing twice (or after the
//! scope itself is gone) is a harmless no-op.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::error::BoxError;
use super::scope::{Scope, ScopeInner};
use super::value::Value;

/// An observation function: derives a value from the scope.
pub type WatchFn = Box<dyn Fn(&Scope) -> Result<Value, BoxError>>;

/// A reaction function: `(new_value, old_value, scope)`. `old_value` is
/// `None` on the first observation.
pub type ListenFn = Box<dyn Fn(&Value, Option<&Value>, &Scope) -> Result<(), BoxError>>;

/// A registered watch: observation, reaction, comparison mode, and the
/// last observed value.
pub(crate) struct Watch {
    pub(crate) watch_fn: WatchFn,
    pub(crate) listen_fn: ListenFn,
    /// Structural comparison (with a deep-cloned snapshot) instead of
    /// reference identity.
    pub(crate) by_value: bool,
    /// `None` until the first evaluation, so the first observation is
    /// always treated as a change.
    pub(crate) last_value: RefCell<Option<Value>>,
}

impl Watch {
    pub(crate) fn new(watch_fn: WatchFn, listen_fn: ListenFn, by_value: bool) -> Rc<Self> {
        Rc::new(Self {
            watch_fn,
            listen_fn,
            by_value,
            last_value: RefCell::new(None),
        })
    }
}

/// Handle returned by watch registration.
///
/// Holds only weak references, so it neither keeps the scope alive nor
/// prevents the record from being dropped with its registry.
pub struct WatchHandle {
    pub(crate) scope: Weak<ScopeInner>,
    pub(crate) watch: Weak<Watch>,
}

impl WatchHandle {
    /// Remove this watch from its scope's registry.
    ///
    /// Removal is by record identity, not by index, so disposing from
    /// inside a running digest pass is safe. Calling this more than once,
    /// or after the scope has been dropped, does nothing.
    pub fn dispose(&self) {
        let (Some(scope), Some(watch)) = (self.scope.upgrade(), self.watch.upgrade()) else {
            return;
        };
        scope.remove_watch(&watch);
    }

    /// Whether the watch is no longer registered.
    pub fn is_disposed(&self) -> bool {
        match (self.scope.upgrade(), self.watch.upgrade()) {
            (Some(scope), Some(watch)) => !scope.contains_watch(&watch),
            _ => true,
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
