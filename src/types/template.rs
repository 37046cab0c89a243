use super::{TypeCtx, TypeId};

/// A locked type, typically a generic signature, that every use site
/// instantiates afresh.
///
/// Bindings made while unifying one instance never reach the template or
/// any other instance.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TypeTemplate {
    root: TypeId,
}

impl TypeTemplate {
    pub fn id(&self) -> TypeId {
        self.root
    }
}

impl TypeCtx {
    /// Locks `t` and everything reachable from it.
    pub fn template(&mut self, t: TypeId) -> TypeTemplate {
        let root = self.resolve(t);

        self.lock(root);
        TypeTemplate { root }
    }

    /// A fresh unlocked copy of the template. Concrete templates come back
    /// as they are.
    pub fn instantiate(&mut self, template: &TypeTemplate) -> TypeId {
        self.tcopy(template.root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Builtin;

    #[test]
    fn instances_do_not_share_bindings() {
        let mut ctx = TypeCtx::new();
        let a = ctx.named_tvar("a");
        let sig = ctx.tfn(&[a], a);
        let template = ctx.template(sig);

        let first = ctx.instantiate(&template);
        let second = ctx.instantiate(&template);
        let p1 = ctx.get_param(first, 0).unwrap();

        ctx.unify(p1, Builtin::Int.id()).unwrap();

        assert!(ctx.tconcrete(first));
        assert_eq!(ctx.get_last_param(first), Some(Builtin::Int.id()));
        assert!(!ctx.tconcrete(second));
        assert!(!ctx.tconcrete(template.id()));

        let p2 = ctx.get_param(second, 0).unwrap();
        ctx.unify(p2, Builtin::String.id()).unwrap();
        assert_eq!(ctx.get_last_param(second), Some(Builtin::String.id()));
        assert_eq!(ctx.get_last_param(first), Some(Builtin::Int.id()));
    }

    #[test]
    fn unifying_the_template_directly_leaves_it_intact() {
        let mut ctx = TypeCtx::new();
        let a = ctx.ttvar();
        let sig = ctx.tfn(&[a], a);
        let template = ctx.template(sig);
        let call = ctx.tfn(&[Builtin::Int.id()], Builtin::Int.id());

        let merged = ctx.unify(template.id(), call).unwrap();

        assert!(ctx.tconcrete(merged));
        assert!(!ctx.tconcrete(template.id()));
        assert_eq!(ctx.resolve(template.id()), template.id());
    }

    #[test]
    fn concrete_templates_are_shared() {
        let mut ctx = TypeCtx::new();
        let list = ctx.tlist(Builtin::Int.id());
        let template = ctx.template(list);

        assert_eq!(ctx.instantiate(&template), list);
    }
}
