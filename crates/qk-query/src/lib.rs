#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use qk_ast::{Expr, TypeRef, Value};
use qk_eval::EvalError;
use qk_expand::ExpandError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("provider cannot execute a tree containing a {kind} node")]
    UnsupportedNode { kind: &'static str },
    #[error("filter must evaluate to bool, found {found}")]
    NotABoolPredicate { found: TypeRef },
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// The queryable-provider boundary. A source receives predicate lambda
/// trees and decides how to run them; it never receives compiled callables.
pub trait QuerySource {
    /// Element type of the rows this source yields.
    fn element(&self) -> &TypeRef;

    /// Sequence callback: run a predicate and return the admitted rows.
    fn filter(&self, predicate: &Arc<Expr>) -> Result<Vec<Value>, QueryError>;

    /// Scalar callback: run a predicate and return how many rows it admits.
    fn count(&self, predicate: &Arc<Expr>) -> Result<Value, QueryError>;
}

/// Decorator that expands every incoming tree before forwarding it, and
/// nothing else. This is what lets invoke-composed predicates run against
/// providers that only understand literal trees.
#[derive(Debug)]
pub struct Expandable<S> {
    inner: S,
}

/// Wrap a source so every submitted expression is expanded first.
pub fn as_expandable<S: QuerySource>(source: S) -> Expandable<S> {
    Expandable { inner: source }
}

impl<S> Expandable<S> {
    #[must_use]
    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: QuerySource> QuerySource for Expandable<S> {
    fn element(&self) -> &TypeRef {
        self.inner.element()
    }

    fn filter(&self, predicate: &Arc<Expr>) -> Result<Vec<Value>, QueryError> {
        let expanded = qk_expand::expand(predicate)?;
        self.inner.filter(&expanded)
    }

    fn count(&self, predicate: &Arc<Expr>) -> Result<Value, QueryError> {
        let expanded = qk_expand::expand(predicate)?;
        self.inner.count(&expanded)
    }
}

/// In-memory rows behind a deliberately strict provider: like a translating
/// remote back end, it rejects trees that still carry invoke nodes or reads
/// of synthesized capture environments. Accepted filters are interpreted
/// row by row.
#[derive(Debug, Clone)]
pub struct VecSource {
    element: TypeRef,
    rows: Vec<Value>,
}

impl VecSource {
    #[must_use]
    pub fn new(element: TypeRef, rows: Vec<Value>) -> Self {
        Self { element, rows }
    }

    #[must_use]
    pub fn rows(&self) -> &[Value] {
        &self.rows
    }

    fn reject_unsupported(predicate: &Arc<Expr>) -> Result<(), QueryError> {
        let mut offending = None;
        predicate.any_node(&mut |node| match node {
            Expr::Invoke { .. } => {
                offending = Some("invoke");
                true
            }
            Expr::Member { member, .. } if member.declaring.is_synthesized_closure() => {
                offending = Some("closure member access");
                true
            }
            _ => false,
        });
        match offending {
            Some(kind) => Err(QueryError::UnsupportedNode { kind }),
            None => Ok(()),
        }
    }

    fn matches(&self, predicate: &Arc<Expr>) -> Result<Vec<Value>, QueryError> {
        Self::reject_unsupported(predicate)?;
        let compiled = qk_eval::compile(predicate)?;
        let mut out = Vec::new();
        for row in &self.rows {
            let verdict = compiled.call1(row)?;
            match verdict.as_bool() {
                Some(true) => out.push(row.clone()),
                Some(false) => {}
                None => {
                    return Err(QueryError::NotABoolPredicate {
                        found: verdict.type_of(),
                    });
                }
            }
        }
        Ok(out)
    }
}

impl QuerySource for VecSource {
    fn element(&self) -> &TypeRef {
        &self.element
    }

    fn filter(&self, predicate: &Arc<Expr>) -> Result<Vec<Value>, QueryError> {
        self.matches(predicate)
    }

    fn count(&self, predicate: &Arc<Expr>) -> Result<Value, QueryError> {
        Ok(Value::Int64(self.matches(predicate)?.len() as i64))
    }
}

/// Decorator that records every tree the wrapped source receives. Test
/// double for asserting what actually crosses the provider boundary.
#[derive(Debug)]
pub struct RecordingSource<S> {
    inner: S,
    seen: Mutex<Vec<Arc<Expr>>>,
}

impl<S> RecordingSource<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Trees received so far, in submission order.
    #[must_use]
    pub fn seen(&self) -> Vec<Arc<Expr>> {
        self.seen.lock().expect("recording mutex poisoned").clone()
    }

    fn record(&self, predicate: &Arc<Expr>) {
        self.seen
            .lock()
            .expect("recording mutex poisoned")
            .push(predicate.clone());
    }
}

impl<S: QuerySource> QuerySource for RecordingSource<S> {
    fn element(&self) -> &TypeRef {
        self.inner.element()
    }

    fn filter(&self, predicate: &Arc<Expr>) -> Result<Vec<Value>, QueryError> {
        self.record(predicate);
        self.inner.filter(predicate)
    }

    fn count(&self, predicate: &Arc<Expr>) -> Result<Value, QueryError> {
        self.record(predicate);
        self.inner.count(predicate)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use qk_ast::{Expr, Record, TypeRef, Value};

    use super::{QueryError, QuerySource, VecSource, as_expandable};

    fn person(name: &str, age: i64) -> Value {
        Value::Record(
            Record::new(TypeRef::named("Person"))
                .with_field("name", Value::from(name))
                .with_field("age", Value::Int64(age)),
        )
    }

    fn people() -> VecSource {
        VecSource::new(
            TypeRef::named("Person"),
            vec![person("Ada", 36), person("Bob", 12), person("Cyn", 54)],
        )
    }

    fn adult_filter() -> Arc<Expr> {
        let p = Expr::parameter("p", TypeRef::named("Person"));
        Expr::lambda(
            vec![p.clone()],
            Expr::ge(
                Expr::field(p.expr(), "age", TypeRef::int64()),
                Expr::constant(Value::Int64(18)),
            ),
        )
    }

    #[test]
    fn vec_source_filters_rows() {
        let rows = people().filter(&adult_filter()).expect("filters");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], person("Ada", 36));
    }

    #[test]
    fn vec_source_counts_rows() {
        let count = people().count(&adult_filter()).expect("counts");
        assert_eq!(count, Value::Int64(2));
    }

    #[test]
    fn strict_provider_rejects_invoke_trees() {
        let p = Expr::parameter("p", TypeRef::named("Person"));
        let body = Expr::invoke(adult_filter(), vec![p.expr()]).expect("invokable");
        let composed = Expr::lambda(vec![p], body);

        let err = people().filter(&composed).expect_err("raw invoke rejected");
        assert!(matches!(
            err,
            QueryError::UnsupportedNode { kind: "invoke" }
        ));
    }

    #[test]
    fn expandable_shim_makes_invoke_trees_acceptable() {
        let p = Expr::parameter("p", TypeRef::named("Person"));
        let body = Expr::invoke(adult_filter(), vec![p.expr()]).expect("invokable");
        let composed = Expr::lambda(vec![p], body);

        let rows = as_expandable(people())
            .filter(&composed)
            .expect("shim expands first");
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn non_boolean_filters_are_rejected() {
        let p = Expr::parameter("p", TypeRef::named("Person"));
        let age = Expr::field(p.expr(), "age", TypeRef::int64());
        // Deliberately bypass predicate validation: a lambda returning int.
        let not_a_filter = Expr::lambda(vec![p], age);

        let err = people()
            .filter(&not_a_filter)
            .expect_err("int lambda is not a filter");
        assert!(matches!(
            err,
            QueryError::NotABoolPredicate { found } if found == TypeRef::int64()
        ));
    }
}
