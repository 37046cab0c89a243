//! Structural types with union-find unification.
//!
//! A [`TypeId`] below [`NUM_PRIMITIVE_BUILTINS`] names a primitive and
//! resolves to itself. Every other valid id indexes a [`TNode`] in a
//! [`TypeCtx`]. Unifying two types links one node's `forward` to the
//! other, so every holder of either id sees the merged type without being
//! rewritten.
//!
//! Locked nodes are never linked. Unifying against a locked node that
//! still has unbound variables works on a fresh copy instead, which is how
//! a [`TypeTemplate`] stays reusable across call sites.

mod builtin;
mod ctx;
mod template;
mod unify;

pub use builtin::{promote, Builtin, BuiltinInfo, Promotion, NUM_BUILTINS, NUM_PRIMITIVE_BUILTINS};
pub use ctx::TypeCtx;
pub use template::TypeTemplate;

use std::fmt;

const COMPOUND_BIT: u64 = 1 << 63;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u64);

impl TypeId {
    pub const ERROR: TypeId = TypeId(Builtin::Error as u64);
    pub const VOID: TypeId = TypeId(Builtin::Void as u64);

    pub fn from_raw(raw: u64) -> TypeId {
        TypeId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_primitive(self) -> bool {
        self.0 < NUM_PRIMITIVE_BUILTINS
    }

    /// The builtin this id names, for primitive ids.
    pub fn builtin(self) -> Option<Builtin> {
        if self.is_primitive() {
            Builtin::from_id(self.0)
        } else {
            None
        }
    }

    pub(crate) fn compound(index: usize) -> TypeId {
        TypeId(COMPOUND_BIT | index as u64)
    }

    pub(crate) fn index(self) -> Option<usize> {
        if self.0 & COMPOUND_BIT != 0 {
            Some((self.0 & !COMPOUND_BIT) as usize)
        } else {
            None
        }
    }
}

impl From<Builtin> for TypeId {
    fn from(b: Builtin) -> TypeId {
        b.id()
    }
}

impl fmt::Debug for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.builtin(), self.index()) {
            (Some(b), _) => write!(f, "TypeId({})", b.name()),
            (None, Some(idx)) => write!(f, "TypeId(#{idx})"),
            _ => write!(f, "TypeId({:#x})", self.0),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TypeKind {
    TypeVar,
    Primitive,
    Fn,
    VarargsFn,
    List,
    Dict,
    Set,
    Tuple,
    Value,
    /// A builtin object family such as `buffer` or `stream`, optionally
    /// parameterized.
    Object,
}

impl TypeKind {
    pub fn is_fn(self) -> bool {
        matches!(self, TypeKind::Fn | TypeKind::VarargsFn)
    }
}

/// One compound or variable type.
///
/// Function nodes keep the return type as their last parameter. Varargs
/// functions keep the element type of the rest argument just before it.
#[derive(Clone, Debug)]
pub struct TNode {
    pub(crate) kind: TypeKind,
    pub(crate) base: Builtin,
    pub(crate) params: Vec<TypeId>,
    pub(crate) forward: Option<TypeId>,
    pub(crate) locked: bool,
    pub(crate) name: Option<String>,
}

impl TNode {
    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn base(&self) -> Builtin {
        self.base
    }

    /// Parameters as stored, before resolution.
    pub fn params(&self) -> &[TypeId] {
        &self.params
    }

    pub fn forward(&self) -> Option<TypeId> {
        self.forward
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// What unifying two types would take.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum UnifyOutcome {
    /// Already the same type, up to merging equal nodes.
    Unify,
    /// A type variable has to be bound.
    RequireBinding,
    Incompatible,
}
