#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use qk_ast::{ArrayBounds, Expr, Value};
use qk_visit::Frames;

/// Caller-supplied comparison for constant payloads, for cases where value
/// equality is too strict (captured collections compared by content, floats
/// compared with a tolerance, and so on).
pub type LeafCompare<'a> = &'a dyn Fn(&Value, &Value) -> bool;

/// Structural equality. Two trees are equal when they have the same shape,
/// the same static types and descriptors at every position, and bodies that
/// match up to consistent renaming of bound parameters: `x => x.age > 5`
/// equals `y => y.age > 5`. Free parameters must be the same declaration.
#[must_use]
pub fn are_equal(a: &Expr, b: &Expr) -> bool {
    Comparer::new(None).equal(a, b)
}

/// [`are_equal`] with a custom constant-payload comparison.
#[must_use]
pub fn are_equal_with(a: &Expr, b: &Expr, leaf: LeafCompare<'_>) -> bool {
    Comparer::new(Some(leaf)).equal(a, b)
}

struct Comparer<'a> {
    frames: Frames<qk_ast::ParamId>,
    leaf: Option<LeafCompare<'a>>,
}

impl<'a> Comparer<'a> {
    fn new(leaf: Option<LeafCompare<'a>>) -> Self {
        Self {
            frames: Frames::new(),
            leaf,
        }
    }

    fn constants_equal(&self, a: &Value, b: &Value) -> bool {
        match self.leaf {
            Some(leaf) => leaf(a, b),
            None => a == b,
        }
    }

    fn all_equal(&mut self, a: &[std::sync::Arc<Expr>], b: &[std::sync::Arc<Expr>]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| self.equal(x, y))
    }

    fn opt_equal(
        &mut self,
        a: &Option<std::sync::Arc<Expr>>,
        b: &Option<std::sync::Arc<Expr>>,
    ) -> bool {
        match (a, b) {
            (Some(x), Some(y)) => self.equal(x, y),
            (None, None) => true,
            _ => false,
        }
    }

    fn equal(&mut self, a: &Expr, b: &Expr) -> bool {
        if a.ty() != b.ty() {
            return false;
        }
        match (a, b) {
            (
                Expr::Constant { value: va, .. },
                Expr::Constant { value: vb, .. },
            ) => self.constants_equal(va, vb),
            (
                Expr::Parameter { id: ia, .. },
                Expr::Parameter { id: ib, .. },
            ) => match self.frames.lookup(*ia) {
                Some(mapped) => mapped == ib,
                None => ia == ib,
            },
            (
                Expr::Member {
                    target: ta,
                    member: ma,
                    ..
                },
                Expr::Member {
                    target: tb,
                    member: mb,
                    ..
                },
            ) => ma == mb && self.opt_equal(ta, tb),
            (
                Expr::Call {
                    target: ta,
                    method: ma,
                    args: aa,
                    ..
                },
                Expr::Call {
                    target: tb,
                    method: mb,
                    args: ab,
                    ..
                },
            ) => ma == mb && self.opt_equal(ta, tb) && self.all_equal(aa, ab),
            (
                Expr::Unary {
                    op: oa,
                    operand: ea,
                    lifted: la,
                    method: ma,
                    ..
                },
                Expr::Unary {
                    op: ob,
                    operand: eb,
                    lifted: lb,
                    method: mb,
                    ..
                },
            ) => oa == ob && la == lb && ma == mb && self.equal(ea, eb),
            (
                Expr::Binary {
                    op: oa,
                    left: la,
                    right: ra,
                    lifted: fa,
                    method: ma,
                    ..
                },
                Expr::Binary {
                    op: ob,
                    left: lb,
                    right: rb,
                    lifted: fb,
                    method: mb,
                    ..
                },
            ) => oa == ob && fa == fb && ma == mb && self.equal(la, lb) && self.equal(ra, rb),
            (
                Expr::Conditional {
                    test: ta,
                    if_true: ya,
                    if_false: na,
                    ..
                },
                Expr::Conditional {
                    test: tb,
                    if_true: yb,
                    if_false: nb,
                    ..
                },
            ) => self.equal(ta, tb) && self.equal(ya, yb) && self.equal(na, nb),
            (
                Expr::TypeIs {
                    target: ta,
                    candidate: ca,
                    ..
                },
                Expr::TypeIs {
                    target: tb,
                    candidate: cb,
                    ..
                },
            ) => ca == cb && self.equal(ta, tb),
            (
                Expr::New {
                    ctor: ca,
                    args: aa,
                    members: ma,
                    ..
                },
                Expr::New {
                    ctor: cb,
                    args: ab,
                    members: mb,
                    ..
                },
            ) => ca == cb && ma == mb && self.all_equal(aa, ab),
            (
                Expr::NewArray {
                    element: ea,
                    elements: xa,
                    bounds: ba,
                    ..
                },
                Expr::NewArray {
                    element: eb,
                    elements: xb,
                    bounds: bb,
                    ..
                },
            ) => ea == eb && ba == bb && self.all_equal(xa, xb),
            (
                Expr::Invoke {
                    callee: ca,
                    args: aa,
                    ..
                },
                Expr::Invoke {
                    callee: cb,
                    args: ab,
                    ..
                },
            ) => self.equal(ca, cb) && self.all_equal(aa, ab),
            (
                Expr::Lambda {
                    params: pa,
                    body: ba,
                    ..
                },
                Expr::Lambda {
                    params: pb,
                    body: bb,
                    ..
                },
            ) => {
                if pa.len() != pb.len() {
                    return false;
                }
                if pa.iter().zip(pb).any(|(x, y)| x.ty != y.ty) {
                    return false;
                }
                let frame: HashMap<_, _> =
                    pa.iter().zip(pb).map(|(x, y)| (x.id, y.id)).collect();
                self.frames.push(frame);
                let out = self.equal(ba, bb);
                self.frames.pop();
                out
            }
            (
                Expr::MemberInit {
                    new_expr: na,
                    bindings: ba,
                    ..
                },
                Expr::MemberInit {
                    new_expr: nb,
                    bindings: bb,
                    ..
                },
            ) => {
                self.equal(na, nb)
                    && ba.len() == bb.len()
                    && ba.iter().zip(bb).all(|(x, y)| {
                        x.member == y.member && self.equal(&x.value, &y.value)
                    })
            }
            (
                Expr::ListInit {
                    new_expr: na,
                    inits: ia,
                    ..
                },
                Expr::ListInit {
                    new_expr: nb,
                    inits: ib,
                    ..
                },
            ) => {
                self.equal(na, nb)
                    && ia.len() == ib.len()
                    && ia.iter().zip(ib).all(|(x, y)| {
                        x.method == y.method && self.all_equal(&x.args, &y.args)
                    })
            }
            // Mismatched kinds.
            _ => false,
        }
    }
}

/// Structure-derived hash, consistent with [`are_equal`]: equal trees hash
/// identically. Bound parameters hash by (lambda depth, slot), never by
/// identity, so alpha-equivalent trees collide on purpose; free parameters
/// hash by identity, matching the equality fallback.
///
/// Consistency is only guaranteed against the default constant comparison;
/// a custom [`LeafCompare`] that equates structurally different payloads has
/// no matching hash.
#[must_use]
pub fn structural_hash(expr: &Expr) -> u64 {
    let mut state = DefaultHasher::new();
    let mut env = Frames::new();
    hash_expr(expr, &mut env, &mut state);
    state.finish()
}

fn hash_expr(expr: &Expr, env: &mut Frames<(u64, u64)>, state: &mut impl Hasher) {
    state.write_u8(kind_tag(expr));
    expr.ty().hash(state);
    match expr {
        Expr::Constant { value, .. } => hash_value(value, state),
        Expr::Parameter { id, .. } => match env.lookup(*id) {
            Some((depth, slot)) => {
                state.write_u8(0);
                state.write_u64(*depth);
                state.write_u64(*slot);
            }
            None => {
                state.write_u8(1);
                state.write_u64(id.raw());
            }
        },
        Expr::Member { target, member, .. } => {
            member.hash(state);
            hash_opt(target, env, state);
        }
        Expr::Call {
            target,
            method,
            args,
            ..
        } => {
            method.hash(state);
            hash_opt(target, env, state);
            hash_all(args, env, state);
        }
        Expr::Unary {
            op,
            operand,
            lifted,
            method,
            ..
        } => {
            op.hash(state);
            lifted.hash(state);
            method.hash(state);
            hash_expr(operand, env, state);
        }
        Expr::Binary {
            op,
            left,
            right,
            lifted,
            method,
            ..
        } => {
            op.hash(state);
            lifted.hash(state);
            method.hash(state);
            hash_expr(left, env, state);
            hash_expr(right, env, state);
        }
        Expr::Conditional {
            test,
            if_true,
            if_false,
            ..
        } => {
            hash_expr(test, env, state);
            hash_expr(if_true, env, state);
            hash_expr(if_false, env, state);
        }
        Expr::TypeIs {
            target, candidate, ..
        } => {
            candidate.hash(state);
            hash_expr(target, env, state);
        }
        Expr::New {
            ctor,
            args,
            members,
            ..
        } => {
            ctor.hash(state);
            members.hash(state);
            hash_all(args, env, state);
        }
        Expr::NewArray {
            element,
            elements,
            bounds,
            ..
        } => {
            element.hash(state);
            state.write_u8(match bounds {
                ArrayBounds::Init => 0,
                ArrayBounds::Sized => 1,
            });
            hash_all(elements, env, state);
        }
        Expr::Invoke { callee, args, .. } => {
            hash_expr(callee, env, state);
            hash_all(args, env, state);
        }
        Expr::Lambda { params, body, .. } => {
            state.write_u64(params.len() as u64);
            for param in params {
                param.ty.hash(state);
            }
            let depth = env.depth() as u64;
            let frame: HashMap<_, _> = params
                .iter()
                .enumerate()
                .map(|(slot, param)| (param.id, (depth, slot as u64)))
                .collect();
            env.push(frame);
            hash_expr(body, env, state);
            env.pop();
        }
        Expr::MemberInit {
            new_expr, bindings, ..
        } => {
            hash_expr(new_expr, env, state);
            state.write_u64(bindings.len() as u64);
            for binding in bindings {
                binding.member.hash(state);
                hash_expr(&binding.value, env, state);
            }
        }
        Expr::ListInit {
            new_expr, inits, ..
        } => {
            hash_expr(new_expr, env, state);
            state.write_u64(inits.len() as u64);
            for init in inits {
                init.method.hash(state);
                hash_all(&init.args, env, state);
            }
        }
    }
}

fn hash_opt(
    target: &Option<std::sync::Arc<Expr>>,
    env: &mut Frames<(u64, u64)>,
    state: &mut impl Hasher,
) {
    match target {
        Some(expr) => {
            state.write_u8(1);
            hash_expr(expr, env, state);
        }
        None => state.write_u8(0),
    }
}

fn hash_all(exprs: &[std::sync::Arc<Expr>], env: &mut Frames<(u64, u64)>, state: &mut impl Hasher) {
    state.write_u64(exprs.len() as u64);
    for expr in exprs {
        hash_expr(expr, env, state);
    }
}

fn hash_value(value: &Value, state: &mut impl Hasher) {
    match value {
        Value::Null => state.write_u8(0),
        Value::Bool(v) => {
            state.write_u8(1);
            v.hash(state);
        }
        Value::Int64(v) => {
            state.write_u8(2);
            v.hash(state);
        }
        Value::Float64(v) => {
            state.write_u8(3);
            // Zero is sign-canonicalized because -0.0 == 0.0; NaN payloads
            // collapse to one bit pattern.
            let bits = if *v == 0.0 {
                0u64
            } else if v.is_nan() {
                f64::NAN.to_bits()
            } else {
                v.to_bits()
            };
            state.write_u64(bits);
        }
        Value::Utf8(v) => {
            state.write_u8(4);
            v.hash(state);
        }
        Value::List(values) => {
            state.write_u8(5);
            state.write_u64(values.len() as u64);
            for value in values {
                hash_value(value, state);
            }
        }
        Value::Record(record) => {
            state.write_u8(6);
            record.ty().hash(state);
            state.write_u64(record.fields().len() as u64);
            for (name, value) in record.fields() {
                name.hash(state);
                hash_value(value, state);
            }
        }
        Value::Quoted(expr) => {
            state.write_u8(7);
            // Quoted payloads compare by plain value equality, so hashing
            // them in a fresh scope is consistent: identical payloads hash
            // identically either way.
            let mut env = Frames::new();
            hash_expr(expr, &mut env, state);
        }
    }
}

fn kind_tag(expr: &Expr) -> u8 {
    match expr {
        Expr::Constant { .. } => 0,
        Expr::Parameter { .. } => 1,
        Expr::Member { .. } => 2,
        Expr::Call { .. } => 3,
        Expr::Unary { .. } => 4,
        Expr::Binary { .. } => 5,
        Expr::Conditional { .. } => 6,
        Expr::TypeIs { .. } => 7,
        Expr::New { .. } => 8,
        Expr::NewArray { .. } => 9,
        Expr::Invoke { .. } => 10,
        Expr::Lambda { .. } => 11,
        Expr::MemberInit { .. } => 12,
        Expr::ListInit { .. } => 13,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use qk_ast::{Expr, TypeRef, Value};

    use super::{are_equal, are_equal_with, structural_hash};

    fn age_filter(param_name: &str, limit: i64) -> Arc<Expr> {
        let p = Expr::parameter(param_name, TypeRef::named("Person"));
        let body = Expr::gt(
            Expr::field(p.expr(), "age", TypeRef::int64()),
            Expr::constant(Value::Int64(limit)),
        );
        Expr::lambda(vec![p], body)
    }

    #[test]
    fn renamed_bound_parameters_compare_equal() {
        let a = age_filter("x", 5);
        let b = age_filter("y", 5);
        assert!(are_equal(&a, &b));
        assert_eq!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn different_constants_compare_unequal() {
        let a = age_filter("x", 5);
        let b = age_filter("x", 6);
        assert!(!are_equal(&a, &b));
    }

    #[test]
    fn mismatched_kinds_short_circuit_to_false() {
        let constant = Expr::constant(Value::Bool(true));
        let param = Expr::parameter("b", TypeRef::bool()).expr();
        assert!(!are_equal(&constant, &param));
    }

    #[test]
    fn free_parameters_require_the_same_declaration() {
        let a = Expr::parameter("n", TypeRef::int64());
        let b = Expr::parameter("n", TypeRef::int64());
        assert!(are_equal(&a.expr(), &a.expr()));
        assert!(!are_equal(&a.expr(), &b.expr()));
    }

    #[test]
    fn nested_lambdas_scope_their_frames() {
        // x => y => x + y versus a => b => a + b: equal.
        let make = |outer: &str, inner: &str| {
            let x = Expr::parameter(outer, TypeRef::int64());
            let y = Expr::parameter(inner, TypeRef::int64());
            let body = Expr::add(x.expr(), y.expr());
            Expr::lambda(vec![x], Expr::lambda(vec![y], body))
        };
        let a = make("x", "y");
        let b = make("a", "b");
        assert!(are_equal(&a, &b));
        assert_eq!(structural_hash(&a), structural_hash(&b));

        // x => y => y + y is a different tree.
        let x = Expr::parameter("x", TypeRef::int64());
        let y = Expr::parameter("y", TypeRef::int64());
        let body = Expr::add(y.expr(), y.expr());
        let c = Expr::lambda(vec![x], Expr::lambda(vec![y], body));
        assert!(!are_equal(&a, &c));
    }

    #[test]
    fn custom_leaf_comparer_overrides_constant_equality() {
        let a = Expr::constant(Value::from("Ada"));
        let b = Expr::constant(Value::from("ADA"));
        assert!(!are_equal(&a, &b));

        let case_insensitive = |x: &Value, y: &Value| match (x, y) {
            (Value::Utf8(x), Value::Utf8(y)) => x.eq_ignore_ascii_case(y),
            _ => x == y,
        };
        assert!(are_equal_with(&a, &b, &case_insensitive));
    }

    #[test]
    fn negative_zero_hashes_like_zero() {
        let a = Expr::constant(Value::Float64(0.0));
        let b = Expr::constant(Value::Float64(-0.0));
        assert!(are_equal(&a, &b));
        assert_eq!(structural_hash(&a), structural_hash(&b));
    }

    #[test]
    fn arity_differences_are_not_alpha_equivalent() {
        let x = Expr::parameter("x", TypeRef::int64());
        let one_param = Expr::lambda(vec![x.clone()], x.expr());
        let y = Expr::parameter("y", TypeRef::int64());
        let z = Expr::parameter("z", TypeRef::int64());
        let two_params = Expr::lambda(vec![y.clone(), z], y.expr());
        assert!(!are_equal(&one_param, &two_params));
    }
}
