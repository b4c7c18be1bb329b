#![forbid(unsafe_code)]

use std::sync::{Arc, OnceLock};

use qk_ast::{AstError, Expr, TypeRef};
use qk_compare::{are_equal, structural_hash};
use qk_eval::{CompiledFn, EvalError};
use qk_expand::{ExpandError, expand};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredicateError {
    #[error("predicates wrap lambdas; found a {kind} node")]
    NotAPredicateLambda { kind: &'static str },
    #[error("predicate lambda must take exactly one parameter, found {found}")]
    WrongParameterCount { found: usize },
    #[error("predicate lambda must return bool, found {found}")]
    NotBoolean { found: TypeRef },
    #[error("cannot combine predicates over {left} and {right}")]
    SourceMismatch { left: TypeRef, right: TypeRef },
    #[error(transparent)]
    Ast(#[from] AstError),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error(transparent)]
    Eval(#[from] EvalError),
}

#[derive(Debug)]
enum NodeKind {
    Always,
    Never,
    Leaf(Arc<Expr>),
    And(Predicate, Predicate),
    Or(Predicate, Predicate),
    Not(Predicate),
}

#[derive(Debug)]
struct Node {
    kind: NodeKind,
    /// Compute-once cell for the materialized tree. Materialization is a
    /// pure function of the subtree, so the first result — success or
    /// failure — is the permanent one.
    cache: OnceLock<Result<Arc<Expr>, PredicateError>>,
}

/// An immutable, composable predicate over one source type. Combinators
/// build new nodes without materializing; [`Predicate::expression`]
/// materializes on first use and caches per node.
///
/// Cloning shares the node (and its cache); predicates are `Send + Sync`
/// and safe to materialize from several threads at once.
#[derive(Debug, Clone)]
pub struct Predicate {
    node: Arc<Node>,
    source: TypeRef,
}

impl Predicate {
    fn from_kind(kind: NodeKind, source: TypeRef) -> Self {
        Self {
            node: Arc::new(Node {
                kind,
                cache: OnceLock::new(),
            }),
            source,
        }
    }

    /// The predicate that admits every element.
    #[must_use]
    pub fn always(source: TypeRef) -> Self {
        Self::from_kind(NodeKind::Always, source)
    }

    /// The predicate that admits nothing.
    #[must_use]
    pub fn never(source: TypeRef) -> Self {
        Self::from_kind(NodeKind::Never, source)
    }

    /// Wrap a raw single-parameter boolean lambda. Validation happens here,
    /// before any combination or materialization.
    pub fn wrap(lambda: Arc<Expr>) -> Result<Self, PredicateError> {
        let source = {
            let Some((params, body)) = lambda.as_lambda() else {
                return Err(PredicateError::NotAPredicateLambda {
                    kind: lambda.kind_name(),
                });
            };
            if params.len() != 1 {
                return Err(PredicateError::WrongParameterCount {
                    found: params.len(),
                });
            }
            if !body.ty().is_bool() {
                return Err(PredicateError::NotBoolean {
                    found: body.ty().clone(),
                });
            }
            params[0].ty.clone()
        };
        Ok(Self::from_kind(NodeKind::Leaf(lambda), source))
    }

    #[must_use]
    pub fn source(&self) -> &TypeRef {
        &self.source
    }

    #[must_use]
    pub fn is_always(&self) -> bool {
        matches!(self.node.kind, NodeKind::Always)
    }

    #[must_use]
    pub fn is_never(&self) -> bool {
        matches!(self.node.kind, NodeKind::Never)
    }

    fn check_source(&self, other: &Self) -> Result<(), PredicateError> {
        if self.source == other.source {
            Ok(())
        } else {
            Err(PredicateError::SourceMismatch {
                left: self.source.clone(),
                right: other.source.clone(),
            })
        }
    }

    /// Conjunction. The constant predicates fold at combinator level —
    /// `p.and(always) = p`, `p.and(never) = never` — so the identity laws
    /// hold structurally, not just under evaluation.
    pub fn and(&self, other: &Self) -> Result<Self, PredicateError> {
        self.check_source(other)?;
        Ok(match (&self.node.kind, &other.node.kind) {
            (NodeKind::Always, _) => other.clone(),
            (_, NodeKind::Always) => self.clone(),
            (NodeKind::Never, _) => self.clone(),
            (_, NodeKind::Never) => other.clone(),
            _ => Self::from_kind(
                NodeKind::And(self.clone(), other.clone()),
                self.source.clone(),
            ),
        })
    }

    /// Disjunction, with the dual folds: `p.or(never) = p`,
    /// `p.or(always) = always`.
    pub fn or(&self, other: &Self) -> Result<Self, PredicateError> {
        self.check_source(other)?;
        Ok(match (&self.node.kind, &other.node.kind) {
            (NodeKind::Never, _) => other.clone(),
            (_, NodeKind::Never) => self.clone(),
            (NodeKind::Always, _) => self.clone(),
            (_, NodeKind::Always) => other.clone(),
            _ => Self::from_kind(
                NodeKind::Or(self.clone(), other.clone()),
                self.source.clone(),
            ),
        })
    }

    /// Negation. Constant predicates flip; everything else gets a Not node
    /// (double negation is not simplified away).
    #[must_use]
    pub fn not(&self) -> Self {
        match self.node.kind {
            NodeKind::Always => Self::never(self.source.clone()),
            NodeKind::Never => Self::always(self.source.clone()),
            _ => Self::from_kind(NodeKind::Not(self.clone()), self.source.clone()),
        }
    }

    /// Materialize this predicate as a single-parameter boolean lambda.
    /// Composite nodes build `p => left(p) && right(p)` over one shared
    /// fresh parameter and run the expander over it before caching, so the
    /// result contains no invoke nodes and is structurally identical on
    /// every call.
    pub fn expression(&self) -> Result<Arc<Expr>, PredicateError> {
        self.node.cache.get_or_init(|| self.materialize()).clone()
    }

    fn materialize(&self) -> Result<Arc<Expr>, PredicateError> {
        match &self.node.kind {
            NodeKind::Always => Ok(self.constant_lambda(true)),
            NodeKind::Never => Ok(self.constant_lambda(false)),
            NodeKind::Leaf(lambda) => Ok(lambda.clone()),
            NodeKind::And(left, right) => self.compose(left, right, Expr::and_also),
            NodeKind::Or(left, right) => self.compose(left, right, Expr::or_else),
            NodeKind::Not(inner) => {
                let p = Expr::parameter("p", self.source.clone());
                let applied = Expr::invoke(inner.expression()?, vec![p.expr()])?;
                let lambda = Expr::lambda(vec![p], Expr::not(applied));
                Ok(expand(&lambda)?)
            }
        }
    }

    fn constant_lambda(&self, admit: bool) -> Arc<Expr> {
        let p = Expr::parameter("p", self.source.clone());
        Expr::lambda(vec![p], Expr::constant(qk_ast::Value::Bool(admit)))
    }

    fn compose(
        &self,
        left: &Self,
        right: &Self,
        combine: fn(Arc<Expr>, Arc<Expr>) -> Arc<Expr>,
    ) -> Result<Arc<Expr>, PredicateError> {
        let p = Expr::parameter("p", self.source.clone());
        let left_applied = Expr::invoke(left.expression()?, vec![p.expr()])?;
        let right_applied = Expr::invoke(right.expression()?, vec![p.expr()])?;
        let lambda = Expr::lambda(vec![p], combine(left_applied, right_applied));
        Ok(expand(&lambda)?)
    }

    /// Compile the materialized tree for local execution.
    pub fn compiled(&self) -> Result<CompiledFn, PredicateError> {
        Ok(qk_eval::compile(&self.expression()?)?)
    }

    /// Structural equivalence of the materialized trees: two differently
    /// built predicates that reduce to the same expression compare equal.
    pub fn equivalent(&self, other: &Self) -> Result<bool, PredicateError> {
        Ok(are_equal(&*self.expression()?, &*other.expression()?))
    }

    /// Hash of the materialized tree, consistent with
    /// [`Predicate::equivalent`].
    pub fn tree_hash(&self) -> Result<u64, PredicateError> {
        Ok(structural_hash(&*self.expression()?))
    }
}
