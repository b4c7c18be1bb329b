#![forbid(unsafe_code)]

use std::sync::Arc;

use qk_ast::{COMPILE_METHOD, Expr, MARKER_METHOD, Value};
use qk_visit::{Frames, Visitor, visit_all, walk_call, walk_member};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpandError {
    #[error(
        "invoke supplies {found} argument(s) but the resolved lambda expects {expected}; \
         refusing to truncate or pad"
    )]
    ArityMismatch { expected: usize, found: usize },
    #[error("invoke callee cannot be resolved to a lambda (callee kind: {kind})")]
    UnboundCallee { kind: &'static str },
}

/// Rewrite a tree so it contains no invoke-of-lambda nodes and no reads of
/// captured-closure fields that hold expressions. The result is consumable
/// by providers that only understand literal trees.
///
/// Pure and idempotent: expanding an already-expanded tree returns a
/// structurally identical one.
pub fn expand(expr: &Arc<Expr>) -> Result<Arc<Expr>, ExpandError> {
    #[cfg(feature = "tracing")]
    let _span = tracing::debug_span!("expand", root = expr.kind_name()).entered();
    Expander::new().visit(expr)
}

/// The rewriting pass behind [`expand`]. Substitution state lives in a
/// per-instance frame stack, so every pass starts clean; do not reuse one
/// instance across unrelated trees.
#[derive(Debug, Default)]
pub struct Expander {
    frames: Frames<Arc<Expr>>,
}

impl Expander {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: Frames::new(),
        }
    }

    /// Follow recognized indirections from an invoke callee to a literal
    /// lambda: quoted constants, substituted parameters, captured-closure
    /// field reads, marker wrappers, and compile calls.
    fn resolve_lambda(&self, expr: &Arc<Expr>) -> Option<Arc<Expr>> {
        match expr.as_ref() {
            Expr::Lambda { .. } => Some(expr.clone()),
            Expr::Constant {
                value: Value::Quoted(inner),
                ..
            } => self.resolve_lambda(inner),
            Expr::Parameter { id, .. } => {
                let substituted = self.frames.lookup(*id)?.clone();
                self.resolve_lambda(&substituted)
            }
            Expr::Member { .. } => match self.resolve_value(expr)? {
                Value::Quoted(inner) => self.resolve_lambda(&inner),
                _ => None,
            },
            Expr::Call {
                target,
                method,
                args,
                ..
            } => {
                if method.name == MARKER_METHOD && target.is_none() && args.len() == 1 {
                    self.resolve_lambda(&args[0])
                } else if method.name == COMPILE_METHOD {
                    target.as_ref().and_then(|t| self.resolve_lambda(t))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Constant-fold a chain of captured-closure field reads down to the
    /// captured value. Stops (returns `None`) at anything that is not a
    /// constant, a substituted parameter, or a field read on a synthesized
    /// capture environment.
    fn resolve_value(&self, expr: &Arc<Expr>) -> Option<Value> {
        match expr.as_ref() {
            Expr::Constant { value, .. } => Some(value.clone()),
            Expr::Parameter { id, .. } => {
                let substituted = self.frames.lookup(*id)?.clone();
                self.resolve_value(&substituted)
            }
            Expr::Member {
                target: Some(target),
                member,
                ..
            } => match self.resolve_value(target)? {
                Value::Record(record) if record.ty().is_synthesized_closure() => {
                    record.field(&member.name).cloned()
                }
                _ => None,
            },
            _ => None,
        }
    }
}

impl Visitor for Expander {
    type Error = ExpandError;

    /// A parameter bound by an enclosing inlining is replaced by its
    /// argument; anything else is free (captured) and stays.
    fn visit_parameter(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, ExpandError> {
        let Expr::Parameter { id, .. } = expr.as_ref() else {
            unreachable!("visit_parameter dispatched on a non-parameter node");
        };
        Ok(self
            .frames
            .lookup(*id)
            .cloned()
            .unwrap_or_else(|| expr.clone()))
    }

    /// Inline the invoke: resolve the callee to a lambda, bind its
    /// parameters to the (already visited) arguments in a fresh frame, and
    /// rewrite the body in place of the whole node.
    fn visit_invoke(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, ExpandError> {
        let Expr::Invoke { callee, args, .. } = expr.as_ref() else {
            unreachable!("visit_invoke dispatched on a non-invoke node");
        };
        let lambda = self
            .resolve_lambda(callee)
            .ok_or(ExpandError::UnboundCallee {
                kind: callee.kind_name(),
            })?;
        let Some((params, body)) = lambda.as_lambda() else {
            unreachable!("resolve_lambda only returns lambda nodes");
        };
        let (visited_args, _) = visit_all(self, args)?;
        if params.len() != visited_args.len() {
            return Err(ExpandError::ArityMismatch {
                expected: params.len(),
                found: visited_args.len(),
            });
        }
        let frame = params
            .iter()
            .zip(visited_args)
            .map(|(param, arg)| (param.id, arg))
            .collect();
        self.frames.push(frame);
        let out = self.visit(body);
        self.frames.pop();
        out
    }

    /// Collapse reads of synthesized-closure fields: a quoted payload is
    /// expanded and spliced in; an ordinary captured value keeps its member
    /// read untouched.
    fn visit_member(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, ExpandError> {
        let Expr::Member {
            target: Some(target),
            member,
            ..
        } = expr.as_ref()
        else {
            return walk_member(self, expr);
        };
        if let Some(Value::Record(record)) = self.resolve_value(target) {
            if record.ty().is_synthesized_closure() {
                if let Some(Value::Quoted(inner)) = record.field(&member.name) {
                    let inner = inner.clone();
                    return self.visit(&inner);
                }
                return walk_member(self, expr);
            }
        }
        walk_member(self, expr)
    }

    /// Strip the no-op expandable marker; resolve compile calls whose target
    /// is statically a quoted lambda back to the underlying tree.
    fn visit_call(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, ExpandError> {
        let Expr::Call {
            target,
            method,
            args,
            ..
        } = expr.as_ref()
        else {
            unreachable!("visit_call dispatched on a non-call node");
        };
        if method.name == MARKER_METHOD && target.is_none() && args.len() == 1 {
            return self.visit(&args[0]);
        }
        if method.name == COMPILE_METHOD {
            if let Some(target) = target {
                if let Some(lambda) = self.resolve_lambda(target) {
                    return self.visit(&lambda);
                }
            }
        }
        walk_call(self, expr)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use qk_ast::{Expr, TypeRef, Value};
    use qk_compare::are_equal;

    use super::{ExpandError, expand};

    fn increment_lambda() -> Arc<Expr> {
        let x = Expr::parameter("x", TypeRef::int64());
        let body = Expr::add(x.expr(), Expr::constant(Value::Int64(1)));
        Expr::lambda(vec![x], body)
    }

    fn contains_invoke(expr: &Arc<Expr>) -> bool {
        expr.any_node(&mut |node| matches!(node, Expr::Invoke { .. }))
    }

    #[test]
    fn invoke_of_literal_lambda_is_inlined() {
        let tree = Expr::invoke(increment_lambda(), vec![Expr::constant(Value::Int64(5))])
            .expect("lambda is invokable");
        let expanded = expand(&tree).expect("expands");

        assert!(!contains_invoke(&expanded));
        let expected = Expr::add(
            Expr::constant(Value::Int64(5)),
            Expr::constant(Value::Int64(1)),
        );
        assert!(are_equal(&expanded, &expected));
    }

    #[test]
    fn arity_mismatch_is_a_distinct_error() {
        let lambda = increment_lambda();
        // Bypass the checked builder to model a malformed graph.
        let tree = Arc::new(Expr::Invoke {
            callee: lambda,
            args: vec![
                Expr::constant(Value::Int64(1)),
                Expr::constant(Value::Int64(2)),
            ],
            ty: TypeRef::int64(),
        });
        let err = expand(&tree).expect_err("arity is checked");
        assert_eq!(
            err,
            ExpandError::ArityMismatch {
                expected: 1,
                found: 2
            }
        );
    }

    #[test]
    fn unresolvable_callee_is_reported_distinctly() {
        let f = Expr::parameter("f", TypeRef::func(vec![TypeRef::int64()], TypeRef::int64()));
        let tree = Expr::invoke(f.expr(), vec![Expr::constant(Value::Int64(1))])
            .expect("function-typed parameter");
        let err = expand(&tree).expect_err("free parameter is not a lambda");
        assert_eq!(err, ExpandError::UnboundCallee { kind: "parameter" });
    }

    #[test]
    fn captured_lambda_reads_collapse_to_the_quoted_tree() {
        // p => f(p), with f captured from the environment.
        let captured = Expr::captured("f", increment_lambda());
        let p = Expr::parameter("p", TypeRef::int64());
        let body = Expr::invoke(captured, vec![p.expr()]).expect("captured lambda type");
        let tree = Expr::lambda(vec![p.clone()], body);

        let expanded = expand(&tree).expect("expands");
        assert!(!contains_invoke(&expanded));
        let expected = Expr::lambda(
            vec![p.clone()],
            Expr::add(p.expr(), Expr::constant(Value::Int64(1))),
        );
        assert!(are_equal(&expanded, &expected));
    }

    #[test]
    fn ordinary_captured_values_are_left_in_place() {
        // p => p > limit, with limit an ordinary captured int.
        let limit = Expr::captured_value("limit", Value::Int64(10));
        let p = Expr::parameter("p", TypeRef::int64());
        let tree = Expr::lambda(vec![p.clone()], Expr::gt(p.expr(), limit));

        let expanded = expand(&tree).expect("expands");
        assert!(expanded.any_node(&mut |node| {
            matches!(node, Expr::Member { member, .. } if member.name == "limit")
        }));
    }

    #[test]
    fn marker_calls_are_stripped() {
        let inner = increment_lambda();
        let marked = Expr::marked(inner.clone());
        let expanded = expand(&marked).expect("expands");
        assert!(are_equal(&expanded, &inner));
    }

    #[test]
    fn compile_calls_on_captured_lambdas_resolve_to_the_tree() {
        // p => f.compile()(p): the compile call dissolves and the invoke
        // inlines, leaving p + 1.
        let captured = Expr::captured("f", increment_lambda());
        let compiled = Expr::compile_call(captured).expect("function-typed target");
        let p = Expr::parameter("p", TypeRef::int64());
        let body = Expr::invoke(compiled, vec![p.expr()]).expect("invokable");
        let tree = Expr::lambda(vec![p.clone()], body);

        let expanded = expand(&tree).expect("expands");
        assert!(!contains_invoke(&expanded));
        let expected = Expr::lambda(
            vec![p.clone()],
            Expr::add(p.expr(), Expr::constant(Value::Int64(1))),
        );
        assert!(are_equal(&expanded, &expected));
    }

    #[test]
    fn expansion_is_idempotent() {
        let captured = Expr::captured("f", increment_lambda());
        let p = Expr::parameter("p", TypeRef::int64());
        let body = Expr::or_else(
            Expr::gt(
                Expr::invoke(captured, vec![p.expr()]).expect("invokable"),
                Expr::constant(Value::Int64(3)),
            ),
            Expr::lt(p.expr(), Expr::constant(Value::Int64(0))),
        );
        let tree = Expr::lambda(vec![p], body);

        let once = expand(&tree).expect("first pass");
        let twice = expand(&once).expect("second pass");
        assert!(are_equal(&once, &twice));
    }

    #[test]
    fn untouched_trees_come_back_with_the_same_identity() {
        let p = Expr::parameter("p", TypeRef::int64());
        let tree = Expr::lambda(vec![p.clone()], Expr::gt(p.expr(), Expr::constant(Value::Int64(2))));
        let expanded = expand(&tree).expect("expands");
        assert!(Arc::ptr_eq(&tree, &expanded));
    }
}
