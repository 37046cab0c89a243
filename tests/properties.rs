use n00b::types::{Builtin, TypeCtx, TypeId};
use n00b::{Runtime, RuntimeConfig, ScanPolicy};
use proptest::prelude::*;

#[derive(Clone, Debug, PartialEq)]
enum Shape {
    Prim(Builtin),
    Var,
    List(Box<Shape>),
    Set(Box<Shape>),
    Dict(Box<Shape>, Box<Shape>),
}

impl Shape {
    fn build(&self, ctx: &mut TypeCtx) -> TypeId {
        match self {
            Shape::Prim(b) => b.id(),
            Shape::Var => ctx.ttvar(),
            Shape::List(item) => {
                let item = item.build(ctx);
                ctx.tlist(item)
            }
            Shape::Set(item) => {
                let item = item.build(ctx);
                ctx.tset(item)
            }
            Shape::Dict(k, v) => {
                let k = k.build(ctx);
                let v = v.build(ctx);
                ctx.tdict(k, v)
            }
        }
    }
}

fn shape(with_vars: bool) -> impl Strategy<Value = Shape> {
    let prim = prop_oneof![
        Just(Shape::Prim(Builtin::Int)),
        Just(Shape::Prim(Builtin::String)),
        Just(Shape::Prim(Builtin::Bool)),
    ];
    let leaf = if with_vars {
        prop_oneof![3 => prim, 1 => Just(Shape::Var)].boxed()
    } else {
        prim.boxed()
    };

    leaf.prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            inner.clone().prop_map(|s| Shape::List(Box::new(s))),
            inner.clone().prop_map(|s| Shape::Set(Box::new(s))),
            (inner.clone(), inner).prop_map(|(k, v)| Shape::Dict(Box::new(k), Box::new(v))),
        ]
    })
}

proptest! {
    #[test]
    fn unified_types_share_a_representative(a in shape(true), b in shape(true)) {
        let mut ctx = TypeCtx::new();
        let ta = a.build(&mut ctx);
        let tb = b.build(&mut ctx);

        if ctx.unify(ta, tb).is_ok() {
            let (ra, rb) = (ctx.resolve(ta), ctx.resolve(tb));

            prop_assert_eq!(ra, rb);
            prop_assert_eq!(ctx.resolve(ra), ra);
            prop_assert_eq!(ctx.type_name(ta), ctx.type_name(tb));
        }
    }

    #[test]
    fn concrete_types_unify_only_when_equal(a in shape(false), b in shape(false)) {
        let mut ctx = TypeCtx::new();
        let ta = a.build(&mut ctx);
        let tb = b.build(&mut ctx);

        prop_assert!(ctx.tconcrete(ta));
        prop_assert_eq!(ctx.unify(ta, tb).is_ok(), a == b);
    }

    #[test]
    fn rooted_records_survive_collection(
        sizes in proptest::collection::vec(1usize..2048, 1..40),
    ) {
        let runtime = Runtime::new(RuntimeConfig {
            default_heap_size: 64 * 1024,
            scratch_heap_size: 64 * 1024,
            ..RuntimeConfig::default()
        });
        let heap = runtime.new_heap(64 * 1024);
        let roots = heap.roots(sizes.len());

        for (i, len) in sizes.iter().enumerate() {
            let p = heap.alloc(*len, ScanPolicy::None);
            unsafe { p.as_ptr().write_bytes(i as u8, *len) };
            roots.set(i, p.as_ptr());
            heap.alloc(rand::random::<usize>() % 512 + 1, ScanPolicy::None);
        }

        heap.collect();

        for (i, len) in sizes.iter().enumerate() {
            let p = roots.get(i);
            let bytes = unsafe { std::slice::from_raw_parts(p, *len) };

            prop_assert!(bytes.iter().all(|b| *b == i as u8));
            prop_assert!(heap.find_allocation(p as usize).is_some_and(|a| a.len >= *len));
        }
    }
}
