//! Deferred, typed value cells.
//!
//! A property is a cell that may hold a concrete value, an alias to another
//! property, or a derivation over other properties. Nothing is computed when
//! a property is wired; the wiring is inspected structurally by the graph
//! builder to infer task ordering, and values are forced only when a task
//! action actually reads them.
//!
//! ## Phantom handles
//!
//! The cells themselves are type-erased and live in the model's arena. User
//! code holds a [`Property<T>`] — a `Copy` token carrying the cell id and the
//! declared type `T` in `PhantomData`. The compiler therefore enforces that a
//! property wired to another carries exactly the type the upstream cell
//! produces, while the runtime representation stays uniform.

use std::any::TypeId;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

use crate::core::{ArcStr, Value, ValueVtable};
use crate::model::TaskId;

/// Index of a property cell in the model's arena.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PropertyId(pub(crate) usize);

/// A typed handle to a property cell.
///
/// Handles are cheap tokens; all state lives in the model. Two handles with
/// the same id refer to the same cell.
pub struct Property<T> {
    pub(crate) id: PropertyId,
    marker: PhantomData<fn() -> T>,
}

impl<T> Property<T> {
    pub(crate) fn new(id: PropertyId) -> Self {
        Self {
            id,
            marker: PhantomData,
        }
    }

    /// Returns the untyped id of this property.
    pub fn id(&self) -> PropertyId {
        self.id
    }
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Property<T> {}

impl<T> Debug for Property<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Property").field(&self.id.0).finish()
    }
}

/// Whether a property is an input to its task or an output produced by it.
///
/// Only inputs participate in the cache fingerprint; only outputs are
/// snapshotted into the cache.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PropertyKind {
    Input,
    Output,
}

/// A memoizing derivation over already-resolved upstream values.
pub(crate) type DeriveFn =
    Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Resolution state of a property cell.
///
/// `Resolved` is the finalized state: it is entered on the first successful
/// read and every later mutation fails with `AlreadyFinalized`.
pub(crate) enum PropertyState {
    Unset,
    Value(Value),
    Reference(PropertyId),
    Derived {
        upstream: Vec<PropertyId>,
        apply: DeriveFn,
    },
    Resolved(Value),
}

impl PropertyState {
    pub(crate) fn is_finalized(&self) -> bool {
        matches!(self, PropertyState::Resolved(_))
    }
}

impl Debug for PropertyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyState::Unset => write!(f, "Unset"),
            PropertyState::Value(v) => f.debug_tuple("Value").field(v).finish(),
            PropertyState::Reference(id) => {
                f.debug_tuple("Reference").field(id).finish()
            }
            PropertyState::Derived { upstream, .. } => {
                f.debug_struct("Derived").field("upstream", upstream).finish()
            }
            PropertyState::Resolved(v) => {
                f.debug_tuple("Resolved").field(v).finish()
            }
        }
    }
}

/// The arena-resident cell behind a [`Property<T>`] handle.
#[derive(Debug)]
pub(crate) struct PropertyCell {
    pub(crate) name: ArcStr,
    pub(crate) owner: TaskId,
    pub(crate) kind: PropertyKind,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: &'static str,
    pub(crate) vtable: ValueVtable,
    pub(crate) state: Mutex<PropertyState>,
}

/// The structural wiring of a cell, extracted without forcing resolution.
/// This is what the graph builder walks to infer dependency edges.
#[derive(Clone, Debug)]
pub(crate) enum Wiring {
    Terminal,
    Reference(PropertyId),
    Derived(Vec<PropertyId>),
}

/// A collection of upstream property handles usable as the source of a
/// derived property.
///
/// Implemented for a single [`Property<T>`] and for tuples of handles, so a
/// derivation over `(Property<A>, Property<B>)` receives `(&A, &B)`.
pub trait Upstream: Copy + Send + Sync + 'static {
    /// The borrowed shape handed to the derivation closure.
    type Resolved<'a>;

    /// The cell ids of the upstream properties, in order.
    fn ids(&self) -> Vec<PropertyId>;

    /// Downcasts the already-resolved upstream values into their concrete
    /// types.
    ///
    /// # Panics
    /// Panics if a value cannot be downcast to its declared type, which the
    /// typed wiring API makes unreachable.
    fn resolve<'a>(&self, values: &'a [Value]) -> Self::Resolved<'a>;
}

fn downcast<'a, T: 'static>(value: &'a Value) -> &'a T {
    value
        .data
        .downcast_ref::<T>()
        .expect("upstream value type was checked when the property was wired")
}

impl<A: 'static> Upstream for Property<A> {
    type Resolved<'a> = &'a A;

    fn ids(&self) -> Vec<PropertyId> {
        vec![self.id]
    }

    fn resolve<'a>(&self, values: &'a [Value]) -> Self::Resolved<'a> {
        downcast::<A>(&values[0])
    }
}

macro_rules! impl_upstream_tuple {
    ($($name:ident : $index:tt),+) => {
        impl<$($name: 'static),+> Upstream for ($(Property<$name>,)+) {
            type Resolved<'a> = ($(&'a $name,)+);

            fn ids(&self) -> Vec<PropertyId> {
                vec![$(self.$index.id),+]
            }

            fn resolve<'a>(&self, values: &'a [Value]) -> Self::Resolved<'a> {
                ($(downcast::<$name>(&values[$index]),)+)
            }
        }
    };
}

impl_upstream_tuple!(A: 0);
impl_upstream_tuple!(A: 0, B: 1);
impl_upstream_tuple!(A: 0, B: 1, C: 2);
impl_upstream_tuple!(A: 0, B: 1, C: 2, D: 3);
