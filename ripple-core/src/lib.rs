//! Ripple Core
//!
//! This crate provides the core runtime for the Ripple change-propagation
//! engine. It implements:
//!
//! - Scopes: shared mutable contexts with hierarchical state inheritance
//! - Watches: observation/reaction pairs with pluggable equality
//! - The digest cycle: brute-force re-evaluation until stability, with
//!   deferred and coalesced scheduling on a cooperative event loop
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `scope`: the scope, watch registry, and digest cycle
//! - `sched`: the cooperative scheduler the deferred entry points use
//!
//! # Example
//!
//! ```rust,ignore
//! use std::rc::Rc;
//! use ripple_core::scope::{Scope, Value};
//! use ripple_core::sched::EventLoop;
//!
//! let scope = Scope::new(Rc::new(EventLoop::new()));
//! scope.set("name", "world");
//!
//! // Watch a slot and react to its changes.
//! scope.watch(
//!     |s| Ok(s.get("name").unwrap_or(Value::Null)),
//!     |new, _, s| {
//!         s.set("greeting", format!("hello, {}", new.as_str().unwrap_or("?")));
//!         Ok(())
//!     },
//! );
//!
//! scope.digest().unwrap();
//! assert_eq!(scope.get("greeting"), Some(Value::from("hello, world")));
//! ```

pub mod sched;
pub mod scope;
