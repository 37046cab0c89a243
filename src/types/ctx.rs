use super::{promote, Builtin, Promotion, TNode, TypeId, TypeKind};
use crate::error::TypeError;
use crate::fatal::{self, Fatal};
use std::collections::HashMap;
use std::fmt::Write;

const TV_LETTERS: &[u8; 16] = b"jtvwxyzabcdefghi";

/// Owns every compound and variable type node.
///
/// Nodes live as long as the context. Ids handed out by one context mean
/// nothing to another.
#[derive(Default)]
pub struct TypeCtx {
    pub(crate) nodes: Vec<TNode>,
    names: HashMap<String, TypeId>,
    next_tvar: u64,
}

impl TypeCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, t: TypeId) -> Option<&TNode> {
        t.index().and_then(|idx| self.nodes.get(idx))
    }

    pub(crate) fn node_mut(&mut self, t: TypeId) -> Option<&mut TNode> {
        t.index().and_then(|idx| self.nodes.get_mut(idx))
    }

    pub fn is_valid(&self, t: TypeId) -> bool {
        t.is_primitive() || self.node(t).is_some()
    }

    pub(crate) fn check(&self, t: TypeId) -> Result<(), TypeError> {
        if self.is_valid(t) {
            Ok(())
        } else {
            Err(TypeError::UnknownType(t))
        }
    }

    /// Follows forward links to the representative of `t`.
    ///
    /// A chain longer than the node table can only be a cycle, which no
    /// sequence of unifications produces; finding one is fatal.
    pub fn resolve(&self, t: TypeId) -> TypeId {
        let mut cur = t;

        for _ in 0..=self.nodes.len() {
            match self.node(cur).and_then(|n| n.forward) {
                Some(next) => cur = next,
                None => return cur,
            }
        }

        fatal::raise(Fatal::TypeCycle(t))
    }

    pub(crate) fn push(&mut self, kind: TypeKind, base: Builtin, params: Vec<TypeId>) -> TypeId {
        let id = TypeId::compound(self.nodes.len());

        self.nodes.push(TNode {
            kind,
            base,
            params,
            forward: None,
            locked: false,
            name: None,
        });

        id
    }

    pub fn tprimitive(&self, b: Builtin) -> Option<TypeId> {
        b.is_primitive().then(|| b.id())
    }

    pub fn tlist(&mut self, item: TypeId) -> TypeId {
        self.push(TypeKind::List, Builtin::List, vec![item])
    }

    pub fn ttree(&mut self, item: TypeId) -> TypeId {
        self.push(TypeKind::List, Builtin::Tree, vec![item])
    }

    pub fn tset(&mut self, item: TypeId) -> TypeId {
        self.push(TypeKind::Set, Builtin::Set, vec![item])
    }

    pub fn tdict(&mut self, key: TypeId, value: TypeId) -> TypeId {
        self.push(TypeKind::Dict, Builtin::Dict, vec![key, value])
    }

    pub fn ttuple(&mut self, items: &[TypeId]) -> TypeId {
        self.push(TypeKind::Tuple, Builtin::Tuple, items.to_vec())
    }

    pub fn tref(&mut self, target: TypeId) -> TypeId {
        self.push(TypeKind::Value, Builtin::TrueRef, vec![target])
    }

    /// An instance of the object family `base`. Objects of different
    /// families never unify.
    pub fn tobject(&mut self, base: Builtin, params: &[TypeId]) -> TypeId {
        self.push(TypeKind::Object, base, params.to_vec())
    }

    pub fn tfn(&mut self, args: &[TypeId], ret: TypeId) -> TypeId {
        let mut params = args.to_vec();

        params.push(ret);
        self.push(TypeKind::Fn, Builtin::Funcdef, params)
    }

    /// A function taking `fixed` arguments followed by any number of
    /// `rest` arguments.
    pub fn tfn_varargs(&mut self, fixed: &[TypeId], rest: TypeId, ret: TypeId) -> TypeId {
        let mut params = fixed.to_vec();

        params.push(rest);
        params.push(ret);
        self.push(TypeKind::VarargsFn, Builtin::Funcdef, params)
    }

    /// A fresh, unbound type variable with a generated name.
    pub fn ttvar(&mut self) -> TypeId {
        let name = self.generate_name();
        let id = self.push(TypeKind::TypeVar, Builtin::Generic, Vec::new());

        if let Some(node) = self.node_mut(id) {
            node.name = Some(name);
        }
        id
    }

    /// The type variable called `name`, created on first use.
    pub fn named_tvar(&mut self, name: &str) -> TypeId {
        if let Some(&id) = self.names.get(name) {
            return id;
        }

        let id = self.push(TypeKind::TypeVar, Builtin::Generic, Vec::new());

        if let Some(node) = self.node_mut(id) {
            node.name = Some(name.to_string());
        }
        self.names.insert(name.to_string(), id);
        id
    }

    fn generate_name(&mut self) -> String {
        let mut n = self.next_tvar;
        let mut name = String::new();

        self.next_tvar += 1;

        loop {
            name.push(TV_LETTERS[(n & 0x0f) as usize] as char);
            n >>= 4;
            if n == 0 {
                break name;
            }
        }
    }

    pub fn kind(&self, t: TypeId) -> Option<TypeKind> {
        let t = self.resolve(t);

        if t.is_primitive() {
            Some(TypeKind::Primitive)
        } else {
            self.node(t).map(|n| n.kind)
        }
    }

    /// The primitive a type resolves to, or the family of a compound.
    pub fn base_type(&self, t: TypeId) -> Option<Builtin> {
        let t = self.resolve(t);

        t.builtin().or_else(|| self.node(t).map(|n| n.base))
    }

    pub fn is_typevar(&self, t: TypeId) -> bool {
        self.kind(t) == Some(TypeKind::TypeVar)
    }

    pub fn has_base_container_type(&self, t: TypeId, base: Builtin) -> bool {
        let t = self.resolve(t);

        self.node(t).is_some_and(|n| n.kind != TypeKind::TypeVar && n.base == base)
    }

    pub fn num_params(&self, t: TypeId) -> usize {
        self.node(self.resolve(t)).map_or(0, |n| n.params.len())
    }

    /// Parameter `n` of `t`, resolved.
    pub fn get_param(&self, t: TypeId, n: usize) -> Option<TypeId> {
        let p = *self.node(self.resolve(t))?.params.get(n)?;

        Some(self.resolve(p))
    }

    pub fn get_last_param(&self, t: TypeId) -> Option<TypeId> {
        let p = *self.node(self.resolve(t))?.params.last()?;

        Some(self.resolve(p))
    }

    pub fn all_params(&self, t: TypeId) -> Vec<TypeId> {
        match self.node(self.resolve(t)) {
            Some(node) => node.params.iter().map(|&p| self.resolve(p)).collect(),
            None => Vec::new(),
        }
    }

    /// True once no unbound type variable is reachable from `t`.
    pub fn tconcrete(&self, t: TypeId) -> bool {
        let t = self.resolve(t);

        match self.node(t) {
            None => t.is_primitive(),
            Some(node) if node.kind == TypeKind::TypeVar => false,
            Some(node) => node.params.iter().all(|&p| self.tconcrete(p)),
        }
    }

    /// Marks `t` and every node reachable from it as immune to linking.
    pub fn lock(&mut self, t: TypeId) {
        let t = self.resolve(t);
        let params = match self.node_mut(t) {
            Some(node) if !node.locked => {
                node.locked = true;
                node.params.clone()
            }
            _ => return,
        };

        for p in params {
            self.lock(p);
        }
    }

    pub fn is_locked(&self, t: TypeId) -> bool {
        self.node(self.resolve(t)).is_some_and(|n| n.locked)
    }

    pub fn is_int_type(&self, t: TypeId) -> bool {
        self.resolve(t).builtin().is_some_and(Builtin::is_int)
    }

    pub fn is_signed(&self, t: TypeId) -> bool {
        self.resolve(t)
            .builtin()
            .is_some_and(|b| b.is_int() && b.info().signed)
    }

    /// The integer type arithmetic on `a` and `b` is carried out in.
    pub fn promote(&self, a: TypeId, b: TypeId) -> Result<Promotion, TypeError> {
        let (ra, rb) = (self.resolve(a), self.resolve(b));

        match (ra.builtin(), rb.builtin()) {
            (Some(x), Some(y)) => promote(x, y).ok_or_else(|| self.incompatible(ra, rb)),
            _ => Err(self.incompatible(ra, rb)),
        }
    }

    pub(crate) fn incompatible(&self, a: TypeId, b: TypeId) -> TypeError {
        TypeError::Incompatible {
            left: self.type_name(a),
            right: self.type_name(b),
        }
    }

    /// Renders `t` the way it would be written in source, e.g.
    /// `dict[string, list[int]]` or `(int, *`a) -> `a`.
    pub fn type_name(&self, t: TypeId) -> String {
        let mut out = String::new();

        self.write_name(t, &mut out);
        out
    }

    fn write_name(&self, t: TypeId, out: &mut String) {
        let t = self.resolve(t);

        if let Some(b) = t.builtin() {
            out.push_str(b.name());
            return;
        }

        let Some(node) = self.node(t) else {
            let _ = write!(out, "<bad type {:#x}>", t.as_u64());
            return;
        };

        match node.kind {
            TypeKind::TypeVar => {
                out.push('`');
                out.push_str(node.name.as_deref().unwrap_or("?"));
            }
            TypeKind::Object if node.params.is_empty() => out.push_str(node.base.name()),
            TypeKind::Fn | TypeKind::VarargsFn => {
                let (ret, args) = node.params.split_last().map_or((None, &[][..]), |(r, a)| (Some(r), a));
                let varargs = node.kind == TypeKind::VarargsFn;

                out.push('(');
                for (i, &p) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    if varargs && i + 1 == args.len() {
                        out.push('*');
                    }
                    self.write_name(p, out);
                }
                out.push_str(") -> ");
                match ret {
                    Some(&r) => self.write_name(r, out),
                    None => out.push_str("void"),
                }
            }
            _ => {
                out.push_str(node.base.name());
                out.push('[');
                for (i, &p) in node.params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_name(p, out);
                }
                out.push(']');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_resolve_to_themselves() {
        let ctx = TypeCtx::new();
        let int = Builtin::Int.id();

        assert_eq!(ctx.resolve(int), int);
        assert_eq!(ctx.kind(int), Some(TypeKind::Primitive));
        assert!(ctx.tconcrete(int));
        assert_eq!(ctx.tprimitive(Builtin::List), None);
        assert_eq!(ctx.tprimitive(Builtin::String), Some(Builtin::String.id()));
    }

    #[test]
    fn container_params() {
        let mut ctx = TypeCtx::new();
        let string = Builtin::String.id();
        let list = ctx.tlist(Builtin::Int.id());
        let dict = ctx.tdict(string, list);

        assert!(ctx.has_base_container_type(dict, Builtin::Dict));
        assert!(!ctx.has_base_container_type(dict, Builtin::List));
        assert_eq!(ctx.num_params(dict), 2);
        assert_eq!(ctx.get_param(dict, 0), Some(string));
        assert_eq!(ctx.get_last_param(dict), Some(list));
        assert_eq!(ctx.get_param(dict, 2), None);
        assert_eq!(ctx.all_params(dict), vec![string, list]);
        assert!(ctx.tconcrete(dict));
    }

    #[test]
    fn names() {
        let mut ctx = TypeCtx::new();
        let a = ctx.named_tvar("a");
        let list = ctx.tlist(Builtin::Int.id());
        let dict = ctx.tdict(Builtin::String.id(), list);
        let f = ctx.tfn_varargs(&[Builtin::Int.id()], a, a);
        let g = ctx.tfn(&[], Builtin::Void.id());

        assert_eq!(ctx.type_name(dict), "dict[string, list[int]]");
        assert_eq!(ctx.type_name(f), "(int, *`a) -> `a");
        assert_eq!(ctx.type_name(g), "() -> void");

        let buf = ctx.tobject(Builtin::Buffer, &[]);
        let stream = ctx.tobject(Builtin::Stream, &[Builtin::Int.id()]);
        assert_eq!(ctx.kind(buf), Some(TypeKind::Object));
        assert_eq!(ctx.type_name(buf), "buffer");
        assert_eq!(ctx.type_name(stream), "stream[int]");
        assert_eq!(ctx.named_tvar("a"), a);
    }

    #[test]
    fn generated_tvar_names_are_distinct() {
        let mut ctx = TypeCtx::new();
        let names: Vec<String> = (0..40).map(|_| {
            let t = ctx.ttvar();
            ctx.type_name(t)
        }).collect();

        assert_eq!(names[0], "`j");
        assert_eq!(names[1], "`t");
        for (i, a) in names.iter().enumerate() {
            assert!(!names[i + 1..].contains(a));
        }
    }

    #[test]
    fn int_queries() {
        let ctx = TypeCtx::new();

        assert!(ctx.is_int_type(Builtin::Byte.id()));
        assert!(ctx.is_signed(Builtin::I32.id()));
        assert!(!ctx.is_signed(Builtin::U32.id()));
        assert!(!ctx.is_int_type(Builtin::String.id()));
        assert_eq!(ctx.promote(Builtin::Int.id(), Builtin::I8.id()).unwrap().to, Builtin::Int);
        assert!(matches!(
            ctx.promote(Builtin::Int.id(), Builtin::String.id()),
            Err(TypeError::Incompatible { .. })
        ));
    }

    #[test]
    #[should_panic]
    fn forward_cycle_is_fatal() {
        crate::fatal::set_fatal_mode(crate::fatal::FatalMode::Panic);
        let mut ctx = TypeCtx::new();
        let a = ctx.ttvar();
        let b = ctx.ttvar();

        ctx.node_mut(a).unwrap().forward = Some(b);
        ctx.node_mut(b).unwrap().forward = Some(a);
        ctx.resolve(a);
    }
}
