#![forbid(unsafe_code)]

//! Facade over the querykit workspace.
//!
//! Predicate/selector computations are modeled as immutable, inspectable
//! expression trees instead of opaque closures. The pieces:
//!
//! - [`Expr`] and its descriptors — the closed node union ([`qk_ast`]).
//! - [`Visitor`] — structural traversal that rebuilds a node only when a
//!   child changed ([`qk_visit`]).
//! - [`are_equal`] / [`structural_hash`] — equality up to consistent
//!   renaming of bound parameters ([`qk_compare`]).
//! - [`expand`] — inline invoked lambdas, collapse captured-closure reads,
//!   strip marker calls ([`qk_expand`]).
//! - [`compile`] — interpret a materialized lambda locally ([`qk_eval`]).
//! - [`Predicate`] — the always/never/wrap/and/or/not algebra with memoized
//!   materialization ([`qk_predicate`]).
//! - [`as_expandable`] — the queryable seam that expands every tree before
//!   the provider sees it ([`qk_query`]).

pub use qk_ast::{
    ArrayBounds, AstError, BinaryOp, COMPILE_METHOD, CtorRef, ElementInit, Expr, MARKER_METHOD,
    MemberBinding, MemberRef, MethodRef, ParamId, Parameter, Record, TypeRef, UnaryOp, Value,
};
pub use qk_compare::{LeafCompare, are_equal, are_equal_with, structural_hash};
pub use qk_eval::{CompiledFn, EvalError, compile};
pub use qk_expand::{ExpandError, Expander, expand};
pub use qk_predicate::{Predicate, PredicateError};
pub use qk_query::{
    Expandable, QueryError, QuerySource, RecordingSource, VecSource, as_expandable,
};
pub use qk_visit::{
    Frames, Visitor, visit_all, visit_opt, walk, walk_binary, walk_call, walk_conditional,
    walk_invoke, walk_lambda, walk_list_init, walk_member, walk_member_init, walk_new,
    walk_new_array, walk_type_is, walk_unary,
};
