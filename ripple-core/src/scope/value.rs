//! Scope Values
//!
//! A `Value` is the dynamic datum that scope slots hold and that watch
//! functions produce. The engine never interprets values; it only compares
//! them, clones them, and hands them back to caller-supplied functions.
//!
//! # Identity vs. Structure
//!
//! Watches choose between two comparison modes, and the `Value`
//! representation is shaped around that choice:
//!
//! 1. Compound values (arrays, objects) are reference-counted, so two
//!    handles can share one underlying allocation. *Reference* equality
//!    asks "is this the same allocation?" (`Rc::ptr_eq`), which is the
//!    cheap default.
//!
//! 2. *Structural* equality recurses through the contents, so a freshly
//!    built value with the same shape compares equal. Watches that opt
//!    into it pay for a deep comparison on every pass, plus a deep clone
//!    of each observed value so the stored snapshot cannot alias state
//!    the caller keeps mutating.
//!
//! Scalars compare by value in both modes. Numbers get one special case:
//! two NaN values are considered equal by the engine's policy, otherwise a
//! watch producing NaN would look dirty on every pass and the cycle could
//! never stabilize.
//!
//! # Standard Equality
//!
//! The `PartialEq` impl is plain structural equality with IEEE semantics
//! (NaN is not equal to itself), so `assert_eq!` behaves the way Rust code
//! expects. The engine's own policy goes through [`Value::ref_eq`] and
//! [`Value::deep_eq`] exclusively.

use std::rc::Rc;

use indexmap::IndexMap;

/// A dynamic value stored in a scope slot or produced by a watch function.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// The absent/empty value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A double-precision float; integers are represented exactly up to 2^53.
    Number(f64),
    /// An immutable string.
    String(Rc<str>),
    /// An ordered sequence of values.
    Array(Rc<Vec<Value>>),
    /// A string-keyed map with deterministic (insertion) order.
    Object(Rc<IndexMap<String, Value>>),
}

/// Numeric equality with the NaN special case.
///
/// A perpetually-NaN watch must not look dirty forever, so NaN compares
/// equal to NaN under both of the engine's comparison modes.
fn numbers_equal(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl Value {
    /// Build an array value.
    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }

    /// Build an object value.
    pub fn object(entries: IndexMap<String, Value>) -> Self {
        Value::Object(Rc::new(entries))
    }

    /// Whether this is [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The boolean payload, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// The numeric payload, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The array payload, if this is an array.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// The object payload, if this is an object.
    pub fn as_object(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// Reference equality: scalars by value, compounds by allocation
    /// identity.
    ///
    /// Installing a newly built array or object into a slot counts as a
    /// change even when the contents match, exactly like swapping in a new
    /// object behind a reference.
    pub fn ref_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => numbers_equal(*a, *b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Structural equality: full recursion through arrays and objects,
    /// with NaN equal to NaN at any depth.
    pub fn deep_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => numbers_equal(*a, *b),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_eq(y))
            }
            (Value::Object(a), Value::Object(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(key, x)| b.get(key).map_or(false, |y| x.deep_eq(y)))
            }
            _ => false,
        }
    }

    /// Compare under the engine's active policy.
    pub fn equals(&self, other: &Value, by_value: bool) -> bool {
        if by_value {
            self.deep_eq(other)
        } else {
            self.ref_eq(other)
        }
    }

    /// Clone with fresh allocations all the way down.
    ///
    /// By-value watches snapshot what they observed; the snapshot must not
    /// share allocations with live caller state, or a later caller-side
    /// rebuild could make the stored value move in lockstep and mask the
    /// change. Scalars (including strings, whose contents are immutable)
    /// are plain clones.
    pub fn deep_clone(&self) -> Value {
        match self {
            Value::Array(items) => {
                Value::Array(Rc::new(items.iter().map(Value::deep_clone).collect()))
            }
            Value::Object(entries) => Value::Object(Rc::new(
                entries
                    .iter()
                    .map(|(key, value)| (key.clone(), value.deep_clone()))
                    .collect(),
            )),
            other => other.clone(),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value as f64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(Rc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(Rc::from(value.as_str()))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(entries: IndexMap<String, Value>) -> Self {
        Value::object(entries)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
