use std::sync::Arc;

use proptest::prelude::*;
use querykit::{Expr, Predicate, TypeRef, Value, are_equal, expand, structural_hash};

/// A tree-shaped description of a predicate over int64, independent of any
/// particular built instance. Building it twice yields two predicates with
/// distinct parameter identities, which is exactly what the alpha-blind
/// comparer has to see through.
#[derive(Debug, Clone)]
enum Shape {
    Gt(i64),
    Lt(i64),
    Even,
    Always,
    Never,
    And(Box<Shape>, Box<Shape>),
    Or(Box<Shape>, Box<Shape>),
    Not(Box<Shape>),
}

fn leaf_lambda(shape: &Shape) -> Arc<Expr> {
    let x = Expr::parameter("x", TypeRef::int64());
    let body = match shape {
        Shape::Gt(limit) => Expr::gt(x.expr(), Expr::constant(Value::Int64(*limit))),
        Shape::Lt(limit) => Expr::lt(x.expr(), Expr::constant(Value::Int64(*limit))),
        Shape::Even => Expr::eq(
            Expr::rem(x.expr(), Expr::constant(Value::Int64(2))),
            Expr::constant(Value::Int64(0)),
        ),
        _ => unreachable!("leaf_lambda only handles leaf shapes"),
    };
    Expr::lambda(vec![x], body)
}

fn build(shape: &Shape) -> Predicate {
    match shape {
        Shape::Gt(_) | Shape::Lt(_) | Shape::Even => {
            Predicate::wrap(leaf_lambda(shape)).expect("leaf lambdas are valid predicates")
        }
        Shape::Always => Predicate::always(TypeRef::int64()),
        Shape::Never => Predicate::never(TypeRef::int64()),
        Shape::And(left, right) => build(left).and(&build(right)).expect("same source"),
        Shape::Or(left, right) => build(left).or(&build(right)).expect("same source"),
        Shape::Not(inner) => build(inner).not(),
    }
}

/// Ground truth, computed directly in Rust.
fn truth(shape: &Shape, x: i64) -> bool {
    match shape {
        Shape::Gt(limit) => x > *limit,
        Shape::Lt(limit) => x < *limit,
        Shape::Even => x % 2 == 0,
        Shape::Always => true,
        Shape::Never => false,
        Shape::And(left, right) => truth(left, x) && truth(right, x),
        Shape::Or(left, right) => truth(left, x) || truth(right, x),
        Shape::Not(inner) => !truth(inner, x),
    }
}

fn arb_shape() -> impl Strategy<Value = Shape> {
    let leaf = prop_oneof![
        (-8_i64..8).prop_map(Shape::Gt),
        (-8_i64..8).prop_map(Shape::Lt),
        Just(Shape::Even),
        Just(Shape::Always),
        Just(Shape::Never),
    ];
    leaf.prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| Shape::And(Box::new(a), Box::new(b))),
            (inner.clone(), inner.clone())
                .prop_map(|(a, b)| Shape::Or(Box::new(a), Box::new(b))),
            inner.prop_map(|a| Shape::Not(Box::new(a))),
        ]
    })
}

const SAMPLES: std::ops::Range<i64> = -9..10;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn materialized_predicates_match_ground_truth(shape in arb_shape()) {
        let f = build(&shape).compiled().expect("compiles");
        for x in SAMPLES {
            let out = f.call1(&Value::Int64(x)).expect("evaluates");
            prop_assert_eq!(out, Value::Bool(truth(&shape, x)), "x = {}", x);
        }
    }

    #[test]
    fn materialized_trees_contain_no_invokes(shape in arb_shape()) {
        let tree = build(&shape).expression().expect("materializes");
        prop_assert!(!tree.any_node(&mut |node| matches!(node, Expr::Invoke { .. })), "materialized tree must contain no invoke nodes");
    }

    #[test]
    fn expansion_is_idempotent(shape in arb_shape()) {
        // Re-compose with explicit invoke nodes so the first pass has real
        // work to do.
        let inner = build(&shape).expression().expect("materializes");
        let p = Expr::parameter("p", TypeRef::int64());
        let body = Expr::invoke(Expr::captured("inner", inner), vec![p.expr()])
            .expect("invokable");
        let tree = Expr::lambda(vec![p], body);

        let once = expand(&tree).expect("first pass");
        let twice = expand(&once).expect("second pass");
        prop_assert!(are_equal(&once, &twice));
    }

    #[test]
    fn rebuilding_a_shape_is_alpha_equivalent(shape in arb_shape()) {
        let first = build(&shape);
        let second = build(&shape);
        prop_assert!(first.equivalent(&second).expect("materializes"));
        prop_assert_eq!(
            first.tree_hash().expect("hashes"),
            second.tree_hash().expect("hashes")
        );
    }

    #[test]
    fn equality_implies_equal_hashes(a in arb_shape(), b in arb_shape()) {
        let left = build(&a).expression().expect("materializes");
        let right = build(&b).expression().expect("materializes");
        if are_equal(&left, &right) {
            prop_assert_eq!(structural_hash(&left), structural_hash(&right));
        }
    }

    #[test]
    fn conjunction_with_always_is_identity(shape in arb_shape()) {
        let p = build(&shape);
        let folded = p.and(&Predicate::always(TypeRef::int64())).expect("same source");
        prop_assert!(p.equivalent(&folded).expect("materializes"));
    }

    #[test]
    fn double_negation_preserves_evaluation(shape in arb_shape()) {
        let p = build(&shape);
        let back = p.not().not();
        let f = p.compiled().expect("compiles");
        let g = back.compiled().expect("compiles");
        for x in SAMPLES {
            prop_assert_eq!(
                f.call1(&Value::Int64(x)).expect("original"),
                g.call1(&Value::Int64(x)).expect("double negation"),
                "x = {}", x
            );
        }
    }
}
