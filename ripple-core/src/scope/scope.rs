//! Scope and the Digest Cycle
//!
//! A `Scope` is a shared mutable context: callers attach named state to
//! it, register watches over that state, and trigger propagation through
//! one of three entry points (`digest`, `apply`, or the deferred
//! `eval_async`/`apply_async` pair). The digest cycle is the only place
//! watches are evaluated and reactions fire.
//!
//! # How a Cycle Works
//!
//! 1. `digest` claims the scope's phase slot; a second cycle cannot be
//!    started while one is running.
//!
//! 2. If a coalesced-apply flush is still pending on the scheduler, it is
//!    cancelled and run inline, so a synchronous digest never misses work
//!    that was scheduled before it was called.
//!
//! 3. The cycle then loops: drain the deferred-evaluation queue, sweep
//!    every watch once in registration order, and repeat while anything
//!    changed or new deferred work arrived. Chained reactions converge
//!    within the one cycle; a pair of watches that keep dirtying each
//!    other exhausts a fixed pass budget and fails instead of hanging.
//!
//! 4. Once stable, post-digest callbacks run exactly once and the phase
//!    is released.
//!
//! There is no dependency tracking anywhere: propagation is brute-force
//! repeated evaluation until a full pass observes no change. The sweep
//! carries one optimization: the last watcher seen dirty is remembered,
//! and a pass that reaches it clean can stop early, because everything
//! past that point was already clean on the previous full sweep.
//!
//! # Failure Isolation
//!
//! Caller-supplied functions are fallible, and a failure never crosses an
//! invocation boundary: a watch function that errors is treated as having
//! produced `Null` for that evaluation, a failed listener or queued task
//! is logged and skipped, and the rest of the pass or drain continues.
//! Only phase re-entry and non-convergence are fatal, and both restore
//! the phase before reporting, so a failed cycle never wedges the scope.
//!
//! # Hierarchy
//!
//! `new_child` creates a descendant scope: reads of a name unset locally
//! fall through to the parent, writes are always local, and each scope
//! digests only its own watch registry. The parent tracks children weakly
//! for bookkeeping only.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::sched::{Scheduler, TaskId};

use super::error::{BoxError, ScopeError};
use super::value::Value;
use super::watch::{ListenFn, Watch, WatchFn, WatchHandle};

/// How many passes a digest may spend before the cycle is declared
/// unstable. Bounds worst-case work and surfaces divergent watch chains
/// as an explicit failure rather than a hang.
pub const MAX_DIGEST_PASSES: u32 = 10;

/// A one-shot expression evaluated against a scope.
pub type ExprFn = Box<dyn FnOnce(&Scope) -> Result<Value, BoxError>>;

/// A zero-argument callback run once after the next cycle settles.
pub type PostDigestFn = Box<dyn FnOnce() -> Result<(), BoxError>>;

/// The operation currently running against a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// A digest cycle is sweeping the watch registry.
    Digest,
    /// An `apply` expression is being evaluated.
    Apply,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Digest => write!(f, "digest"),
            Phase::Apply => write!(f, "apply"),
        }
    }
}

/// A deferred evaluation queued by `eval_async`.
struct AsyncTask {
    /// The scope the expression runs against. Weak, so a queue entry
    /// cannot keep its own scope alive.
    scope: Weak<ScopeInner>,
    expression: ExprFn,
}

/// Shared mutable context with engine bookkeeping.
///
/// `Scope` is a cheap handle; clones share the same underlying state, the
/// same watch registry, and the same queues.
pub struct Scope {
    inner: Rc<ScopeInner>,
}

pub(crate) struct ScopeInner {
    /// Caller-visible named slots. Reads delegate up the parent chain.
    state: RefCell<IndexMap<String, Value>>,
    /// Registered watches, in registration order. The order is
    /// load-bearing: every pass sweeps from the front.
    watchers: RefCell<Vec<Rc<Watch>>>,
    /// The most recently changed watch within the current cycle. Cleared
    /// at cycle start and on registration.
    last_dirty: RefCell<Option<Weak<Watch>>>,
    /// Deferred tasks drained to empty before each stability check.
    async_queue: RefCell<VecDeque<AsyncTask>>,
    /// Coalesced tasks flushed as one unit inside a single apply.
    apply_async_queue: RefCell<VecDeque<ExprFn>>,
    /// The at-most-one scheduled flush of `apply_async_queue`.
    apply_async_handle: Cell<Option<TaskId>>,
    /// Callbacks to run once after the next cycle completes.
    post_digest_queue: RefCell<VecDeque<PostDigestFn>>,
    /// The operation currently running, if any.
    phase: Cell<Option<Phase>>,
    /// Strong: delegated reads need the parent alive.
    parent: Option<Rc<ScopeInner>>,
    /// Weak: bookkeeping only; a parent never digests its children.
    children: RefCell<Vec<Weak<ScopeInner>>>,
    scheduler: Rc<dyn Scheduler>,
}

impl ScopeInner {
    fn new(parent: Option<Rc<ScopeInner>>, scheduler: Rc<dyn Scheduler>) -> Self {
        Self {
            state: RefCell::new(IndexMap::new()),
            watchers: RefCell::new(Vec::new()),
            last_dirty: RefCell::new(None),
            async_queue: RefCell::new(VecDeque::new()),
            apply_async_queue: RefCell::new(VecDeque::new()),
            apply_async_handle: Cell::new(None),
            post_digest_queue: RefCell::new(VecDeque::new()),
            phase: Cell::new(None),
            parent,
            children: RefCell::new(Vec::new()),
            scheduler,
        }
    }

    /// Remove a watch record by identity.
    pub(crate) fn remove_watch(&self, watch: &Rc<Watch>) {
        self.watchers
            .borrow_mut()
            .retain(|registered| !Rc::ptr_eq(registered, watch));
    }

    pub(crate) fn contains_watch(&self, watch: &Rc<Watch>) -> bool {
        self.watchers
            .borrow()
            .iter()
            .any(|registered| Rc::ptr_eq(registered, watch))
    }
}

impl Scope {
    /// Create a root scope over the given scheduler.
    ///
    /// The scheduler is only touched by the deferred entry points
    /// (`eval_async`, `apply_async`); a scope that is digested purely
    /// synchronously never schedules anything.
    pub fn new(scheduler: Rc<dyn Scheduler>) -> Self {
        Scope {
            inner: Rc::new(ScopeInner::new(None, scheduler)),
        }
    }

    fn from_inner(inner: Rc<ScopeInner>) -> Self {
        Scope { inner }
    }

    // ------------------------------------------------------------------
    // Named state
    // ------------------------------------------------------------------

    /// Read a slot, falling through to ancestors when unset locally.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut current = Rc::clone(&self.inner);
        loop {
            if let Some(value) = current.state.borrow().get(name) {
                return Some(value.clone());
            }
            match current.parent.clone() {
                Some(parent) => current = parent,
                None => return None,
            }
        }
    }

    /// Write a slot. Writes are always local, shadowing any ancestor
    /// slot of the same name.
    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) {
        self.inner.state.borrow_mut().insert(name.into(), value.into());
    }

    /// Rewrite a slot from its current (possibly inherited) value.
    pub fn update(&self, name: &str, rewrite: impl FnOnce(Option<Value>) -> Value) {
        let next = rewrite(self.get(name));
        self.set(name, next);
    }

    /// Remove a local slot, returning its value. Ancestor slots are
    /// untouched.
    pub fn remove(&self, name: &str) -> Option<Value> {
        self.inner.state.borrow_mut().shift_remove(name)
    }

    /// Whether a slot is set here or on any ancestor.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    // ------------------------------------------------------------------
    // Watch registration
    // ------------------------------------------------------------------

    /// Register a watch with a no-op reaction.
    ///
    /// Useful when the watch function itself carries the side effect.
    pub fn observe<W>(&self, watch_fn: W) -> WatchHandle
    where
        W: Fn(&Scope) -> Result<Value, BoxError> + 'static,
    {
        self.register(Box::new(watch_fn), Box::new(|_, _, _| Ok(())), false)
    }

    /// Register a watch compared by reference identity.
    ///
    /// The listener receives `(new_value, old_value, scope)`; `old_value`
    /// is `None` on the first observation.
    pub fn watch<W, L>(&self, watch_fn: W, listen_fn: L) -> WatchHandle
    where
        W: Fn(&Scope) -> Result<Value, BoxError> + 'static,
        L: Fn(&Value, Option<&Value>, &Scope) -> Result<(), BoxError> + 'static,
    {
        self.register(Box::new(watch_fn), Box::new(listen_fn), false)
    }

    /// Register a watch compared structurally.
    ///
    /// The observed value is deep-cloned into the record so the stored
    /// snapshot cannot alias live caller state.
    pub fn watch_by_value<W, L>(&self, watch_fn: W, listen_fn: L) -> WatchHandle
    where
        W: Fn(&Scope) -> Result<Value, BoxError> + 'static,
        L: Fn(&Value, Option<&Value>, &Scope) -> Result<(), BoxError> + 'static,
    {
        self.register(Box::new(watch_fn), Box::new(listen_fn), true)
    }

    fn register(&self, watch_fn: WatchFn, listen_fn: ListenFn, by_value: bool) -> WatchHandle {
        let watch = Watch::new(watch_fn, listen_fn, by_value);
        self.inner.watchers.borrow_mut().push(Rc::clone(&watch));
        // A new watcher invalidates the short-circuit assumption about
        // which watcher was last dirty.
        *self.inner.last_dirty.borrow_mut() = None;
        WatchHandle {
            scope: Rc::downgrade(&self.inner),
            watch: Rc::downgrade(&watch),
        }
    }

    /// Number of watches currently registered on this scope.
    pub fn watcher_count(&self) -> usize {
        self.inner.watchers.borrow().len()
    }

    // ------------------------------------------------------------------
    // The digest cycle
    // ------------------------------------------------------------------

    /// Run the cycle to stability.
    ///
    /// Repeatedly drains the deferred queue and sweeps the registry until
    /// a full pass observes no change, then runs post-digest callbacks.
    /// Fails with [`ScopeError::PhaseInProgress`] when called re-entrantly
    /// and [`ScopeError::UnstableDigest`] when [`MAX_DIGEST_PASSES`] is
    /// exhausted; the phase is released on every path.
    pub fn digest(&self) -> Result<(), ScopeError> {
        self.begin_phase(Phase::Digest)?;

        // A synchronous digest must observe coalesced work scheduled
        // strictly before it was called, and the pending flush task must
        // not fire a second time afterwards.
        if let Some(handle) = self.inner.apply_async_handle.take() {
            self.inner.scheduler.cancel(handle);
            self.flush_apply_async();
        }

        *self.inner.last_dirty.borrow_mut() = None;
        let mut passes_left = MAX_DIGEST_PASSES;

        let result = loop {
            self.drain_async_queue();
            let dirty = self.digest_once();
            let queued = !self.inner.async_queue.borrow().is_empty();
            if !dirty && !queued {
                break Ok(());
            }
            passes_left -= 1;
            if passes_left == 0 {
                break Err(ScopeError::unstable());
            }
        };

        if result.is_ok() {
            self.drain_post_digest_queue();
        }

        // Unconditionally, so a failed cycle never leaves the scope
        // locked.
        self.clear_phase();
        result
    }

    /// One in-order sweep of the registry. Returns whether any watch
    /// observed a change.
    fn digest_once(&self) -> bool {
        let mut dirty = false;
        let mut index = 0;
        loop {
            // Indexing the live registry keeps mid-pass registration and
            // disposal safe; no borrow is held while caller code runs.
            let watch = {
                let watchers = self.inner.watchers.borrow();
                watchers.get(index).map(Rc::clone)
            };
            let Some(watch) = watch else { break };
            index += 1;

            let new_value = match (watch.watch_fn)(self) {
                Ok(value) => value,
                Err(error) => {
                    tracing::error!(error = %error, "watch function failed");
                    Value::Null
                }
            };

            let changed = match watch.last_value.borrow().as_ref() {
                Some(old) => !new_value.equals(old, watch.by_value),
                None => true,
            };

            if changed {
                *self.inner.last_dirty.borrow_mut() = Some(Rc::downgrade(&watch));
                dirty = true;
                let stored = if watch.by_value {
                    new_value.deep_clone()
                } else {
                    new_value.clone()
                };
                let old_value = watch.last_value.replace(Some(stored));
                if let Err(error) = (watch.listen_fn)(&new_value, old_value.as_ref(), self) {
                    tracing::error!(error = %error, "listen function failed");
                }
            } else if self.is_last_dirty(&watch) {
                // Everything past this point was clean on the last full
                // sweep; stop the pass early.
                break;
            }
        }
        dirty
    }

    fn is_last_dirty(&self, watch: &Rc<Watch>) -> bool {
        self.inner
            .last_dirty
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(false, |last| Rc::ptr_eq(&last, watch))
    }

    fn drain_async_queue(&self) {
        loop {
            let task = self.inner.async_queue.borrow_mut().pop_front();
            let Some(task) = task else { break };
            let Some(owner) = task.scope.upgrade() else { continue };
            let owner = Scope::from_inner(owner);
            if let Err(error) = (task.expression)(&owner) {
                tracing::error!(error = %error, "deferred task failed");
            }
        }
    }

    fn drain_post_digest_queue(&self) {
        loop {
            let callback = self.inner.post_digest_queue.borrow_mut().pop_front();
            let Some(callback) = callback else { break };
            if let Err(error) = callback() {
                tracing::error!(error = %error, "post-digest callback failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Evaluation entry points
    // ------------------------------------------------------------------

    /// Evaluate an expression against this scope and return its result.
    pub fn eval<R>(&self, expression: impl FnOnce(&Scope) -> R) -> R {
        expression(self)
    }

    /// Evaluate an expression with an extra `locals` argument.
    pub fn eval_with<R>(
        &self,
        expression: impl FnOnce(&Scope, &Value) -> R,
        locals: &Value,
    ) -> R {
        expression(self, locals)
    }

    /// Defer an evaluation into the current cycle, or into a scheduled
    /// one.
    ///
    /// Work queued while a cycle is active is drained by that cycle
    /// before it settles. Work queued outside any cycle schedules a
    /// single fallback task that digests the scope on the next scheduler
    /// turn, so the expression eventually runs even if nothing else
    /// triggers a cycle.
    pub fn eval_async<F>(&self, expression: F)
    where
        F: FnOnce(&Scope) -> Result<Value, BoxError> + 'static,
    {
        let idle = self.inner.phase.get().is_none() && self.inner.async_queue.borrow().is_empty();
        if idle {
            let weak = Rc::downgrade(&self.inner);
            self.inner.scheduler.schedule(Box::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                let scope = Scope::from_inner(inner);
                if !scope.inner.async_queue.borrow().is_empty() {
                    if let Err(error) = scope.digest() {
                        tracing::error!(error = %error, "scheduled digest failed");
                    }
                }
            }));
        }
        self.inner.async_queue.borrow_mut().push_back(AsyncTask {
            scope: Rc::downgrade(&self.inner),
            expression: Box::new(expression),
        });
    }

    /// Evaluate an expression, then digest: the standard "mutate then
    /// propagate" entry point for external triggers.
    ///
    /// The expression's own error is logged, not propagated; the digest
    /// runs regardless, and only its fatal failures surface.
    pub fn apply<F>(&self, expression: F) -> Result<(), ScopeError>
    where
        F: FnOnce(&Scope) -> Result<Value, BoxError>,
    {
        self.begin_phase(Phase::Apply)?;
        if let Err(error) = expression(self) {
            tracing::error!(error = %error, "apply expression failed");
        }
        self.clear_phase();
        self.digest()
    }

    /// Queue an expression to be applied on a future scheduler turn.
    ///
    /// Calls arriving before the scheduled flush fires are coalesced:
    /// the whole queue is drained inside one apply/digest pair. A
    /// synchronous [`Scope::digest`] preempts the pending flush and runs
    /// it inline instead.
    pub fn apply_async<F>(&self, expression: F)
    where
        F: FnOnce(&Scope) -> Result<Value, BoxError> + 'static,
    {
        self.inner
            .apply_async_queue
            .borrow_mut()
            .push_back(Box::new(expression));
        if self.inner.apply_async_handle.get().is_none() {
            let weak = Rc::downgrade(&self.inner);
            let id = self.inner.scheduler.schedule(Box::new(move || {
                let Some(inner) = weak.upgrade() else { return };
                let scope = Scope::from_inner(inner);
                let applied = scope.apply(|flushing| {
                    flushing.flush_apply_async();
                    Ok(Value::Null)
                });
                if let Err(error) = applied {
                    tracing::error!(error = %error, "coalesced apply failed");
                }
            }));
            self.inner.apply_async_handle.set(Some(id));
        }
    }

    /// Drain the coalesced-apply queue and clear its scheduled-flush
    /// handle. Each queued expression's error is logged; the drain
    /// continues.
    pub fn flush_apply_async(&self) {
        loop {
            let expression = self.inner.apply_async_queue.borrow_mut().pop_front();
            let Some(expression) = expression else { break };
            if let Err(error) = expression(self) {
                tracing::error!(error = %error, "coalesced apply task failed");
            }
        }
        self.inner.apply_async_handle.set(None);
    }

    /// Run a callback once, after the next cycle has fully settled.
    ///
    /// Post-digest callbacks are discarded after running; they do not
    /// re-run on later cycles.
    pub fn post_digest<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<(), BoxError> + 'static,
    {
        self.inner.post_digest_queue.borrow_mut().push_back(Box::new(callback));
    }

    // ------------------------------------------------------------------
    // Phase guard
    // ------------------------------------------------------------------

    /// The operation currently running against this scope, if any.
    pub fn phase(&self) -> Option<Phase> {
        self.inner.phase.get()
    }

    fn begin_phase(&self, phase: Phase) -> Result<(), ScopeError> {
        if let Some(current) = self.inner.phase.get() {
            return Err(ScopeError::PhaseInProgress(current));
        }
        self.inner.phase.set(Some(phase));
        Ok(())
    }

    fn clear_phase(&self) {
        self.inner.phase.set(None);
    }

    // ------------------------------------------------------------------
    // Hierarchy
    // ------------------------------------------------------------------

    /// Create a child scope.
    ///
    /// The child delegates unset reads to this scope, shares its
    /// scheduler, and starts with an empty registry and empty queues. Its
    /// cycle bookkeeping is independent: digesting the parent never
    /// evaluates the child's watchers, and vice versa.
    pub fn new_child(&self) -> Scope {
        let child = Rc::new(ScopeInner::new(
            Some(Rc::clone(&self.inner)),
            Rc::clone(&self.inner.scheduler),
        ));
        self.inner.children.borrow_mut().push(Rc::downgrade(&child));
        Scope::from_inner(child)
    }

    /// Number of live child scopes.
    pub fn child_count(&self) -> usize {
        self.inner
            .children
            .borrow()
            .iter()
            .filter(|child| child.upgrade().is_some())
            .count()
    }
}

impl Clone for Scope {
    fn clone(&self) -> Self {
        Scope {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("watchers", &self.watcher_count())
            .field("phase", &self.inner.phase.get())
            .field("children", &self.child_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use crate::sched::EventLoop;

    use super::*;

    fn scope() -> Scope {
        Scope::new(Rc::new(EventLoop::new()))
    }

    /// Watch a slot by name and count listener firings in "counter".
    fn count_changes(scope: &Scope, name: &'static str) -> WatchHandle {
        scope.watch(
            move |s| Ok(s.get(name).unwrap_or(Value::Null)),
            |_, _, s| {
                s.update("counter", |count| {
                    Value::from(count.and_then(|c| c.as_number()).unwrap_or(0.0) + 1.0)
                });
                Ok(())
            },
        )
    }

    fn counter(scope: &Scope) -> f64 {
        scope.get("counter").and_then(|c| c.as_number()).unwrap_or(0.0)
    }

    #[test]
    fn can_be_used_as_a_state_container() {
        let scope = scope();
        scope.set("property", 1);
        assert_eq!(scope.get("property"), Some(Value::from(1)));
        assert!(scope.contains("property"));
        assert_eq!(scope.remove("property"), Some(Value::from(1)));
        assert_eq!(scope.get("property"), None);
    }

    #[test]
    fn calls_the_listener_on_the_first_digest() {
        let scope = scope();
        let fired = Rc::new(Cell::new(false));
        let seen = fired.clone();
        scope.watch(
            |_| Ok(Value::from("value")),
            move |_, _, _| {
                seen.set(true);
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn calls_the_watch_function_with_the_scope() {
        let scope = scope();
        scope.set("source", 7);
        let observed = Rc::new(Cell::new(0.0));
        let sink = observed.clone();
        scope.observe(move |s| {
            let value = s.get("source").and_then(|v| v.as_number()).unwrap_or(0.0);
            sink.set(value);
            Ok(Value::from(value))
        });

        scope.digest().unwrap();
        assert_eq!(observed.get(), 7.0);
    }

    #[test]
    fn calls_the_listener_only_when_the_watched_value_changes() {
        let scope = scope();
        scope.set("property", "kek");
        count_changes(&scope, "property");

        assert_eq!(counter(&scope), 0.0);
        scope.digest().unwrap();
        assert_eq!(counter(&scope), 1.0);
        scope.digest().unwrap();
        assert_eq!(counter(&scope), 1.0);

        scope.set("property", "lol");
        scope.digest().unwrap();
        assert_eq!(counter(&scope), 2.0);

        scope.set("property", "kek again");
        scope.digest().unwrap();
        assert_eq!(counter(&scope), 3.0);
    }

    #[test]
    fn fires_even_when_the_watched_slot_is_absent() {
        let scope = scope();
        count_changes(&scope, "missing");

        scope.digest().unwrap();
        assert_eq!(counter(&scope), 1.0);
        scope.digest().unwrap();
        assert_eq!(counter(&scope), 1.0);
    }

    #[test]
    fn may_omit_the_listener() {
        let scope = scope();
        let evaluations = Rc::new(Cell::new(0));
        let seen = evaluations.clone();
        scope.observe(move |_| {
            seen.set(seen.get() + 1);
            Ok(Value::from("something"))
        });

        scope.digest().unwrap();
        assert!(evaluations.get() > 0);
    }

    #[test]
    fn passes_none_as_the_old_value_on_the_first_fire() {
        let scope = scope();
        scope.set("property", 1);
        let observations = Rc::new(RefCell::new(Vec::new()));
        let log = observations.clone();
        scope.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            move |new, old, _| {
                log.borrow_mut().push((new.clone(), old.cloned()));
                Ok(())
            },
        );

        scope.digest().unwrap();
        scope.set("property", 2);
        scope.digest().unwrap();

        let observations = observations.borrow();
        assert_eq!(observations[0], (Value::from(1), None));
        assert_eq!(observations[1], (Value::from(2), Some(Value::from(1))));
    }

    #[test]
    fn disposed_watch_never_runs_again() {
        let scope = scope();
        scope.set("property", "value 1");
        let handle = count_changes(&scope, "property");

        scope.digest().unwrap();
        assert_eq!(counter(&scope), 1.0);

        scope.set("property", "value 2");
        scope.digest().unwrap();
        assert_eq!(counter(&scope), 2.0);

        handle.dispose();
        scope.set("property", "value 3");
        scope.digest().unwrap();
        assert_eq!(counter(&scope), 2.0);
    }

    #[test]
    fn chained_watches_converge_in_one_digest() {
        let scope = scope();
        scope.set("name", "Jane");

        // Depends on a slot that another watch derives.
        scope.watch(
            |s| Ok(s.get("name_upper").unwrap_or(Value::Null)),
            |new, _, s| {
                if let Some(upper) = new.as_str() {
                    let initial: String = upper.chars().take(1).collect();
                    s.set("initial", Value::from(format!("{initial}.")));
                }
                Ok(())
            },
        );
        scope.watch(
            |s| Ok(s.get("name").unwrap_or(Value::Null)),
            |new, _, s| {
                if let Some(name) = new.as_str() {
                    s.set("name_upper", Value::from(name.to_uppercase()));
                }
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert_eq!(scope.get("initial"), Some(Value::from("J.")));

        scope.set("name", "Bob");
        scope.digest().unwrap();
        assert_eq!(scope.get("initial"), Some(Value::from("B.")));
    }

    #[test]
    fn two_watches_dirtying_each_other_fail_after_the_pass_budget() {
        let scope = scope();
        scope.set("a", 0);
        scope.set("b", 0);

        scope.watch(
            |s| Ok(s.get("a").unwrap_or(Value::Null)),
            |_, _, s| {
                s.update("b", |b| {
                    Value::from(b.and_then(|v| v.as_number()).unwrap_or(0.0) + 1.0)
                });
                Ok(())
            },
        );
        scope.watch(
            |s| Ok(s.get("b").unwrap_or(Value::Null)),
            |_, _, s| {
                s.update("a", |a| {
                    Value::from(a.and_then(|v| v.as_number()).unwrap_or(0.0) + 1.0)
                });
                Ok(())
            },
        );

        assert_eq!(scope.digest(), Err(ScopeError::UnstableDigest(10)));

        // Exactly ten passes ran, and the scope is not left locked.
        assert_eq!(scope.get("b"), Some(Value::from(10)));
        assert_eq!(scope.phase(), None);
    }

    #[test]
    fn stops_the_pass_early_once_the_last_dirty_watch_is_clean() {
        let scope = scope();
        let evaluations = Rc::new(Cell::new(0u32));
        for i in 0..10 {
            let name = format!("slot{i}");
            scope.set(name.clone(), i as f64);
            let seen = evaluations.clone();
            scope.observe(move |s| {
                seen.set(seen.get() + 1);
                Ok(s.get(&name).unwrap_or(Value::Null))
            });
        }

        // First digest: one dirty pass plus one confirming pass.
        scope.digest().unwrap();
        assert_eq!(evaluations.get(), 20);

        // One leading change: a full pass, then a second pass that stops
        // at the first (and only) previously dirty watch.
        scope.set("slot0", 42);
        scope.digest().unwrap();
        assert_eq!(evaluations.get(), 31);
    }

    #[test]
    fn a_watch_registered_by_a_listener_fires_in_the_same_digest() {
        let scope = scope();
        scope.set("property", 1);
        let inner_fired = Rc::new(Cell::new(0));

        let fired = inner_fired.clone();
        scope.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            move |_, _, s| {
                let fired = fired.clone();
                s.watch(
                    |s| Ok(s.get("property").unwrap_or(Value::Null)),
                    move |_, _, _| {
                        fired.set(fired.get() + 1);
                        Ok(())
                    },
                );
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert_eq!(inner_fired.get(), 1);
    }

    #[test]
    fn a_listener_may_dispose_a_later_watch_mid_pass() {
        let scope = scope();
        scope.set("property", 1);
        let second_fired = Rc::new(Cell::new(false));

        let doomed: Rc<RefCell<Option<WatchHandle>>> = Rc::new(RefCell::new(None));
        let to_dispose = doomed.clone();
        scope.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            move |_, _, _| {
                if let Some(handle) = to_dispose.borrow().as_ref() {
                    handle.dispose();
                }
                Ok(())
            },
        );
        let fired = second_fired.clone();
        let handle = scope.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            move |_, _, _| {
                fired.set(true);
                Ok(())
            },
        );
        *doomed.borrow_mut() = Some(handle);

        scope.digest().unwrap();
        assert!(!second_fired.get());
    }

    #[test]
    fn a_failing_watch_function_does_not_stop_the_pass() {
        let scope = scope();
        scope.set("property", 1);
        let healthy_fired = Rc::new(Cell::new(0));

        scope.observe(|_| Err("broken watch".into()));
        let fired = healthy_fired.clone();
        scope.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            move |_, _, _| {
                fired.set(fired.get() + 1);
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert_eq!(healthy_fired.get(), 1);

        // The failed evaluation settles on Null and stays clean.
        scope.digest().unwrap();
        assert_eq!(healthy_fired.get(), 1);
    }

    #[test]
    fn a_failing_listener_does_not_stop_the_pass() {
        let scope = scope();
        scope.set("property", 1);
        let healthy_fired = Rc::new(Cell::new(false));

        scope.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            |_, _, _| Err("broken listener".into()),
        );
        let fired = healthy_fired.clone();
        scope.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            move |_, _, _| {
                fired.set(true);
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert!(healthy_fired.get());
    }

    #[test]
    fn nan_is_stable_under_reference_comparison() {
        let scope = scope();
        scope.set("number", f64::NAN);
        count_changes(&scope, "number");

        scope.digest().unwrap();
        assert_eq!(counter(&scope), 1.0);
        scope.digest().unwrap();
        assert_eq!(counter(&scope), 1.0);
    }

    #[test]
    fn by_value_watch_fires_on_content_changes_only() {
        let scope = scope();
        scope.set("list", Value::array(vec![Value::from(1), Value::from(2)]));
        let fired = Rc::new(Cell::new(0));
        let count = fired.clone();
        scope.watch_by_value(
            |s| Ok(s.get("list").unwrap_or(Value::Null)),
            move |_, _, _| {
                count.set(count.get() + 1);
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert_eq!(fired.get(), 1);

        // A rebuilt array with identical contents is not a change.
        scope.set("list", Value::array(vec![Value::from(1), Value::from(2)]));
        scope.digest().unwrap();
        assert_eq!(fired.get(), 1);

        scope.set(
            "list",
            Value::array(vec![Value::from(1), Value::from(2), Value::from(3)]),
        );
        scope.digest().unwrap();
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn by_reference_watch_fires_on_identity_changes() {
        let scope = scope();
        scope.set("list", Value::array(vec![Value::from(1)]));
        let fired = Rc::new(Cell::new(0));
        let count = fired.clone();
        scope.watch(
            |s| Ok(s.get("list").unwrap_or(Value::Null)),
            move |_, _, _| {
                count.set(count.get() + 1);
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert_eq!(fired.get(), 1);

        // Same contents, new allocation: a change under identity.
        scope.set("list", Value::array(vec![Value::from(1)]));
        scope.digest().unwrap();
        assert_eq!(fired.get(), 2);
    }

    #[test]
    fn eval_returns_the_expression_result() {
        let scope = scope();
        scope.set("n", 40.0);
        let result = scope.eval(|s| s.get("n").and_then(|v| v.as_number()).unwrap_or(0.0) + 2.0);
        assert_eq!(result, 42.0);
    }

    #[test]
    fn eval_with_passes_locals_through() {
        let scope = scope();
        scope.set("n", 40.0);
        let result = scope.eval_with(
            |s, locals| {
                s.get("n").and_then(|v| v.as_number()).unwrap_or(0.0)
                    + locals.as_number().unwrap_or(0.0)
            },
            &Value::from(2.0),
        );
        assert_eq!(result, 42.0);
    }

    #[test]
    fn eval_async_from_a_listener_runs_before_the_digest_settles() {
        let scope = scope();
        scope.set("property", 1);
        let deferred_ran = Rc::new(Cell::new(false));

        let ran = deferred_ran.clone();
        scope.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            move |_, _, s| {
                let ran = ran.clone();
                s.eval_async(move |_| {
                    ran.set(true);
                    Ok(Value::Null)
                });
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert!(deferred_ran.get());
    }

    #[test]
    fn a_failing_deferred_task_does_not_stop_the_drain() {
        let scope = scope();
        let healthy_ran = Rc::new(Cell::new(false));

        scope.eval_async(|_| Err("broken task".into()));
        let ran = healthy_ran.clone();
        scope.eval_async(move |_| {
            ran.set(true);
            Ok(Value::Null)
        });

        scope.digest().unwrap();
        assert!(healthy_ran.get());
    }

    #[test]
    fn apply_evaluates_and_then_propagates() {
        let scope = scope();
        count_changes(&scope, "property");

        scope
            .apply(|s| {
                s.set("property", "applied");
                Ok(Value::Null)
            })
            .unwrap();

        assert_eq!(counter(&scope), 1.0);
        assert_eq!(scope.get("property"), Some(Value::from("applied")));
    }

    #[test]
    fn apply_digests_even_when_the_expression_fails() {
        let scope = scope();
        count_changes(&scope, "property");

        scope
            .apply(|s| {
                s.set("property", "applied");
                Err("expression failed".into())
            })
            .unwrap();

        assert_eq!(counter(&scope), 1.0);
        assert_eq!(scope.phase(), None);
    }

    #[test]
    fn a_cycle_cannot_be_started_from_inside_a_cycle() {
        let scope = scope();
        scope.set("property", 1);
        let digest_attempt = Rc::new(RefCell::new(None));
        let apply_attempt = Rc::new(RefCell::new(None));

        let digest_result = digest_attempt.clone();
        let apply_result = apply_attempt.clone();
        scope.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            move |_, _, s| {
                *digest_result.borrow_mut() = Some(s.digest());
                *apply_result.borrow_mut() = Some(s.apply(|_| Ok(Value::Null)));
                Ok(())
            },
        );

        scope.digest().unwrap();
        assert_eq!(
            *digest_attempt.borrow(),
            Some(Err(ScopeError::PhaseInProgress(Phase::Digest)))
        );
        assert_eq!(
            *apply_attempt.borrow(),
            Some(Err(ScopeError::PhaseInProgress(Phase::Digest)))
        );
    }

    #[test]
    fn child_reads_fall_through_to_the_parent() {
        let parent = scope();
        parent.set("shared", "from parent");
        let child = parent.new_child();

        assert_eq!(child.get("shared"), Some(Value::from("from parent")));

        // Writes are local and shadow the parent.
        child.set("shared", "from child");
        assert_eq!(child.get("shared"), Some(Value::from("from child")));
        assert_eq!(parent.get("shared"), Some(Value::from("from parent")));
    }

    #[test]
    fn parent_digest_does_not_run_child_watchers() {
        let parent = scope();
        parent.set("property", 1);
        let child = parent.new_child();

        let child_fired = Rc::new(Cell::new(0));
        let fired = child_fired.clone();
        child.watch(
            |s| Ok(s.get("property").unwrap_or(Value::Null)),
            move |_, _, _| {
                fired.set(fired.get() + 1);
                Ok(())
            },
        );

        parent.digest().unwrap();
        assert_eq!(child_fired.get(), 0);

        child.digest().unwrap();
        assert_eq!(child_fired.get(), 1);
    }

    #[test]
    fn parent_tracks_live_children() {
        let parent = scope();
        let first = parent.new_child();
        let second = parent.new_child();
        assert_eq!(parent.child_count(), 2);

        drop(first);
        assert_eq!(parent.child_count(), 1);
        drop(second);
        assert_eq!(parent.child_count(), 0);
    }
}
