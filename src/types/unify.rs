use super::{TypeCtx, TypeId, TypeKind, UnifyOutcome};
use crate::error::TypeError;
use std::collections::HashMap;

impl TypeCtx {
    /// Reports what unifying `a` and `b` would take, without changing
    /// anything.
    ///
    /// Each parameter is checked on its own, so a variable that occurs
    /// twice may get `RequireBinding` here and still fail in [`unify`].
    ///
    /// [`unify`]: TypeCtx::unify
    pub fn can_unify(&self, a: TypeId, b: TypeId) -> UnifyOutcome {
        let (a, b) = (self.resolve(a), self.resolve(b));

        if a == b {
            return UnifyOutcome::Unify;
        }

        if a == TypeId::ERROR || b == TypeId::ERROR || !self.is_valid(a) || !self.is_valid(b) {
            return UnifyOutcome::Incompatible;
        }

        let (Some(ka), Some(kb)) = (self.kind(a), self.kind(b)) else {
            return UnifyOutcome::Incompatible;
        };

        match (ka, kb) {
            (TypeKind::TypeVar, TypeKind::TypeVar) => UnifyOutcome::RequireBinding,
            (TypeKind::TypeVar, _) => self.binding_outcome(a, b),
            (_, TypeKind::TypeVar) => self.binding_outcome(b, a),
            (TypeKind::Primitive, _) | (_, TypeKind::Primitive) => UnifyOutcome::Incompatible,
            _ => match self.param_pairs(a, b) {
                Some(pairs) => pairs
                    .into_iter()
                    .map(|(x, y)| self.can_unify(x, y))
                    .max()
                    .unwrap_or(UnifyOutcome::Unify),
                None => UnifyOutcome::Incompatible,
            },
        }
    }

    fn binding_outcome(&self, var: TypeId, target: TypeId) -> UnifyOutcome {
        if self.occurs(var, target) {
            UnifyOutcome::Incompatible
        } else {
            UnifyOutcome::RequireBinding
        }
    }

    fn occurs(&self, var: TypeId, t: TypeId) -> bool {
        let t = self.resolve(t);

        t == var || self.node(t).is_some_and(|n| n.params.iter().any(|&p| self.occurs(var, p)))
    }

    /// Lines up the parameters two compound types must agree on, or
    /// `None` when their shapes can never match.
    ///
    /// A varargs function against a plain one pairs each extra argument
    /// of the plain function with the rest type.
    fn param_pairs(&self, a: TypeId, b: TypeId) -> Option<Vec<(TypeId, TypeId)>> {
        let (na, nb) = (self.node(a)?, self.node(b)?);

        if na.kind.is_fn() && nb.kind.is_fn() && na.kind != nb.kind {
            let (var, fixed) = if na.kind == TypeKind::VarargsFn { (na, nb) } else { (nb, na) };
            let (&var_ret, var_args) = var.params.split_last()?;
            let (&rest, var_fixed) = var_args.split_last()?;
            let (&fixed_ret, fixed_args) = fixed.params.split_last()?;

            if fixed_args.len() < var_fixed.len() {
                return None;
            }

            let mut pairs: Vec<(TypeId, TypeId)> = var_fixed.iter().copied().zip(fixed_args.iter().copied()).collect();

            pairs.extend(fixed_args[var_fixed.len()..].iter().map(|&extra| (rest, extra)));
            pairs.push((var_ret, fixed_ret));

            return Some(pairs);
        }

        // Object families are told apart by base alone.
        if na.kind != nb.kind || na.base != nb.base || na.params.len() != nb.params.len() {
            return None;
        }

        Some(na.params.iter().copied().zip(nb.params.iter().copied()).collect())
    }

    /// Makes `a` and `b` the same type, binding type variables as needed,
    /// and returns the merged type.
    ///
    /// A locked side that is not yet concrete is copied first and the copy
    /// is bound instead. Bindings made before a mismatch deeper in the
    /// structure is found are kept.
    pub fn unify(&mut self, a: TypeId, b: TypeId) -> Result<TypeId, TypeError> {
        self.check(a)?;
        self.check(b)?;

        let a = self.copy_if_needed(a);
        let b = self.copy_if_needed(b);

        if a == b {
            return Ok(a);
        }

        if a == TypeId::ERROR || b == TypeId::ERROR {
            return Err(self.incompatible(a, b));
        }

        let (Some(ka), Some(kb)) = (self.kind(a), self.kind(b)) else {
            return Err(self.incompatible(a, b));
        };

        match (ka, kb) {
            (TypeKind::TypeVar, TypeKind::TypeVar) => {
                self.link(b, a);
                Ok(a)
            }
            (TypeKind::TypeVar, _) => self.bind(a, b),
            (_, TypeKind::TypeVar) => self.bind(b, a),
            (TypeKind::Primitive, _) | (_, TypeKind::Primitive) => Err(self.incompatible(a, b)),
            _ => {
                let pairs = self.param_pairs(a, b).ok_or_else(|| self.incompatible(a, b))?;

                for (x, y) in pairs {
                    self.unify(x, y)?;
                }

                if ka != kb {
                    // A call shape matched against a varargs signature; the
                    // two stay distinct types.
                    let plain = if ka == TypeKind::Fn { a } else { b };
                    return Ok(self.resolve(plain));
                }

                let (a, b) = (self.resolve(a), self.resolve(b));

                if a == b {
                    Ok(a)
                } else if !self.is_locked(b) {
                    self.link(b, a);
                    Ok(a)
                } else if !self.is_locked(a) {
                    self.link(a, b);
                    Ok(b)
                } else {
                    Ok(a)
                }
            }
        }
    }

    fn bind(&mut self, var: TypeId, target: TypeId) -> Result<TypeId, TypeError> {
        if self.occurs(var, target) {
            return Err(self.incompatible(var, target));
        }

        self.link(var, target);
        Ok(target)
    }

    fn link(&mut self, from: TypeId, to: TypeId) {
        if let Some(node) = self.node_mut(from) {
            debug_assert!(!node.locked);
            node.forward = Some(to);
        }
    }

    fn copy_if_needed(&mut self, t: TypeId) -> TypeId {
        let t = self.resolve(t);

        if self.is_locked(t) && !self.tconcrete(t) {
            self.tcopy(t)
        } else {
            t
        }
    }

    /// Deep-copies the non-concrete part of `t` into fresh, unlocked
    /// nodes. Concrete subtrees are shared and a variable that appears
    /// more than once maps to a single copy.
    pub fn tcopy(&mut self, t: TypeId) -> TypeId {
        let mut dupes = HashMap::new();

        self.copy_inner(t, &mut dupes)
    }

    fn copy_inner(&mut self, t: TypeId, dupes: &mut HashMap<TypeId, TypeId>) -> TypeId {
        let t = self.resolve(t);

        if self.tconcrete(t) {
            return t;
        }

        if let Some(&copy) = dupes.get(&t) {
            return copy;
        }

        let Some(node) = self.node(t).cloned() else {
            return t;
        };

        let params = node.params.iter().map(|&p| self.copy_inner(p, dupes)).collect();
        let copy = self.push(node.kind, node.base, params);

        if let Some(new) = self.node_mut(copy) {
            new.name = node.name;
        }

        dupes.insert(t, copy);
        copy
    }
}
