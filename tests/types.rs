use n00b::types::{Builtin, TypeCtx, TypeId, UnifyOutcome};

fn int() -> TypeId {
    Builtin::Int.id()
}

fn string() -> TypeId {
    Builtin::String.id()
}

#[test]
fn resolution_is_idempotent() {
    let mut ctx = TypeCtx::new();
    let a = ctx.ttvar();
    let b = ctx.ttvar();
    let list = ctx.tlist(a);
    let dict = ctx.tdict(a, b);
    let tuple = ctx.ttuple(&[list, dict]);

    ctx.unify(a, b).unwrap();

    for t in [a, b, list, dict, tuple] {
        let r = ctx.resolve(t);
        assert_eq!(ctx.resolve(r), r);
    }

    assert_eq!(ctx.resolve(a), ctx.resolve(b));
}

#[test]
fn unification_outcomes() {
    let mut ctx = TypeCtx::new();

    assert_eq!(ctx.can_unify(int(), string()), UnifyOutcome::Incompatible);

    let v = ctx.ttvar();
    assert_eq!(ctx.can_unify(v, int()), UnifyOutcome::RequireBinding);
    ctx.unify(v, int()).unwrap();
    assert!(ctx.tconcrete(v));

    let l1 = ctx.tlist(int());
    let l2 = ctx.tlist(int());
    let l3 = ctx.tlist(string());
    assert_eq!(ctx.can_unify(l1, l2), UnifyOutcome::Unify);
    assert_eq!(ctx.can_unify(l1, l3), UnifyOutcome::Incompatible);
}

#[test]
fn call_sites_do_not_leak_bindings() {
    let mut ctx = TypeCtx::new();
    let t = ctx.named_tvar("t");
    let list_t = ctx.tlist(t);
    let head = ctx.tfn(&[list_t], t);
    let template = ctx.template(head);

    let ints = ctx.tlist(int());
    let strings = ctx.tlist(string());
    let site1 = ctx.tfn(&[ints], int());
    let site2 = ctx.tfn(&[strings], string());

    let r1 = ctx.unify(template.id(), site1).unwrap();
    let r2 = ctx.unify(template.id(), site2).unwrap();

    assert_eq!(ctx.get_last_param(r1), Some(int()));
    assert_eq!(ctx.get_last_param(r2), Some(string()));
    assert!(!ctx.tconcrete(template.id()));
    assert!(ctx.is_typevar(t));
}

#[test]
fn dict_params_follow_bindings() {
    let mut ctx = TypeCtx::new();
    let a = ctx.named_tvar("a");
    let b = ctx.named_tvar("b");
    let dict = ctx.tdict(a, b);

    assert_eq!(ctx.type_name(dict), "dict[`a, `b]");

    ctx.unify(a, int()).unwrap();
    ctx.unify(b, string()).unwrap();

    assert_eq!(ctx.get_param(dict, 0), Some(int()));
    assert_eq!(ctx.get_param(dict, 1), Some(string()));
    assert!(ctx.tconcrete(dict));
    assert_eq!(ctx.type_name(dict), "dict[int, string]");
}

#[test]
fn container_families() {
    let mut ctx = TypeCtx::new();
    let tree = ctx.ttree(int());
    let list = ctx.tlist(int());
    let set = ctx.tset(int());
    let r = ctx.tref(list);

    assert!(ctx.has_base_container_type(tree, Builtin::Tree));
    assert!(ctx.has_base_container_type(set, Builtin::Set));
    assert!(ctx.has_base_container_type(r, Builtin::TrueRef));
    assert!(!ctx.has_base_container_type(int(), Builtin::List));
    assert_eq!(ctx.can_unify(tree, list), UnifyOutcome::Incompatible);

    let v = ctx.ttvar();
    ctx.unify(v, list).unwrap();
    assert!(ctx.has_base_container_type(v, Builtin::List));
}
