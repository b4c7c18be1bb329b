#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CLOSURE_PREFIX: &str = "__closure::";

/// Method name of the no-op "mark as expandable" wrapper call. The expander
/// strips calls to this method and continues on their single argument.
pub const MARKER_METHOD: &str = "expandable";

/// Method name of the "compile to a callable" call. When its target is
/// statically resolvable to a quoted lambda, rewriting continues on the
/// underlying tree instead of an opaque callable.
pub const COMPILE_METHOD: &str = "compile";

/// By-value type identity. There is no runtime reflection here: a type is
/// whatever its descriptor says it is, and two descriptors are the same type
/// exactly when they compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypeRef {
    Named { name: String },
    Func { params: Vec<TypeRef>, ret: Box<TypeRef> },
    Array { element: Box<TypeRef> },
}

impl TypeRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named { name: name.into() }
    }

    #[must_use]
    pub fn unit() -> Self {
        Self::named("unit")
    }

    #[must_use]
    pub fn null() -> Self {
        Self::named("null")
    }

    #[must_use]
    pub fn bool() -> Self {
        Self::named("bool")
    }

    #[must_use]
    pub fn int64() -> Self {
        Self::named("int64")
    }

    #[must_use]
    pub fn float64() -> Self {
        Self::named("float64")
    }

    #[must_use]
    pub fn utf8() -> Self {
        Self::named("utf8")
    }

    #[must_use]
    pub fn func(params: Vec<TypeRef>, ret: TypeRef) -> Self {
        Self::Func {
            params,
            ret: Box::new(ret),
        }
    }

    #[must_use]
    pub fn array(element: TypeRef) -> Self {
        Self::Array {
            element: Box::new(element),
        }
    }

    /// Mint a compiler-capture environment type. Only [`Expr::captured`] and
    /// [`Expr::captured_value`] produce values of such types.
    pub fn closure(tag: impl fmt::Display) -> Self {
        Self::named(format!("{CLOSURE_PREFIX}{tag}"))
    }

    /// Naming heuristic for capture environments: their type names carry the
    /// synthesized-closure prefix.
    #[must_use]
    pub fn is_synthesized_closure(&self) -> bool {
        matches!(self, Self::Named { name } if name.starts_with(CLOSURE_PREFIX))
    }

    #[must_use]
    pub fn is_bool(&self) -> bool {
        matches!(self, Self::Named { name } if name == "bool")
    }

    #[must_use]
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Named { name } if name == "float64")
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        matches!(self, Self::Named { name } if name == "int64" || name == "float64")
    }

    #[must_use]
    pub fn is_utf8(&self) -> bool {
        matches!(self, Self::Named { name } if name == "utf8")
    }

    /// Return type when this descriptor is a function type.
    #[must_use]
    pub fn ret(&self) -> Option<&TypeRef> {
        match self {
            Self::Func { ret, .. } => Some(ret),
            _ => None,
        }
    }

    #[must_use]
    pub fn func_params(&self) -> Option<&[TypeRef]> {
        match self {
            Self::Func { params, .. } => Some(params),
            _ => None,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named { name } => f.write_str(name),
            Self::Func { params, ret } => {
                f.write_str("Fn(")?;
                for (idx, param) in params.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{param}")?;
                }
                write!(f, ") -> {ret}")
            }
            Self::Array { element } => write!(f, "[{element}]"),
        }
    }
}

/// Identity of a lambda parameter. Fresh ids come from a process-wide
/// counter, so two independently built parameters never collide; equality of
/// free (unbound) parameters is equality of this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(u64);

impl ParamId {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Field/property reference comparable by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    pub declaring: TypeRef,
    pub name: String,
}

impl MemberRef {
    pub fn new(declaring: TypeRef, name: impl Into<String>) -> Self {
        Self {
            declaring,
            name: name.into(),
        }
    }
}

/// Method reference: declaring type plus full signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodRef {
    pub declaring: TypeRef,
    pub name: String,
    pub params: Vec<TypeRef>,
    pub ret: TypeRef,
}

impl MethodRef {
    pub fn new(
        declaring: TypeRef,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        ret: TypeRef,
    ) -> Self {
        Self {
            declaring,
            name: name.into(),
            params,
            ret,
        }
    }
}

/// Constructor reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CtorRef {
    pub declaring: TypeRef,
    pub params: Vec<TypeRef>,
}

impl CtorRef {
    #[must_use]
    pub fn new(declaring: TypeRef, params: Vec<TypeRef>) -> Self {
        Self { declaring, params }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AstError {
    #[error("callee of type {found} is not invokable")]
    NotInvokable { found: TypeRef },
    #[error("value of type {found} is not numeric")]
    NonNumericValue { found: TypeRef },
    #[error("value is null")]
    NullValue,
}

/// A typed field map: how object instances — including compiler-capture
/// environments — are modeled as constant payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    ty: TypeRef,
    fields: BTreeMap<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new(ty: TypeRef) -> Self {
        Self {
            ty,
            fields: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn ty(&self) -> &TypeRef {
        &self.ty
    }

    #[must_use]
    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }
}

/// Constant payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    Utf8(String),
    List(Vec<Value>),
    Record(Record),
    /// A captured expression value: the payload closure collapsing splices
    /// back into the surrounding tree.
    Quoted(Arc<Expr>),
}

impl Value {
    #[must_use]
    pub fn type_of(&self) -> TypeRef {
        match self {
            Self::Null => TypeRef::null(),
            Self::Bool(_) => TypeRef::bool(),
            Self::Int64(_) => TypeRef::int64(),
            Self::Float64(_) => TypeRef::float64(),
            Self::Utf8(_) => TypeRef::utf8(),
            Self::List(values) => TypeRef::array(
                values
                    .first()
                    .map_or_else(TypeRef::null, Value::type_of),
            ),
            Self::Record(record) => record.ty.clone(),
            Self::Quoted(expr) => expr.ty().clone(),
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Result<f64, AstError> {
        match self {
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            Self::Int64(v) => Ok(*v as f64),
            Self::Float64(v) => Ok(*v),
            Self::Null => Err(AstError::NullValue),
            other => Err(AstError::NonNumericValue {
                found: other.type_of(),
            }),
        }
    }

    /// Equality with NaN treated as equal to NaN, recursively through
    /// containers. Plain `==` keeps IEEE semantics.
    #[must_use]
    pub fn semantic_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Float64(a), Self::Float64(b)) => (a.is_nan() && b.is_nan()) || (a == b),
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.semantic_eq(y))
            }
            (Self::Record(a), Self::Record(b)) => {
                a.ty == b.ty
                    && a.fields.len() == b.fields.len()
                    && a.fields.iter().zip(&b.fields).all(|((ka, va), (kb, vb))| {
                        ka == kb && va.semantic_eq(vb)
                    })
            }
            _ => self == other,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int64(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Utf8(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Utf8(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "\"{v}\""),
            Self::List(values) => {
                f.write_str("[")?;
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str("]")
            }
            Self::Record(record) => {
                write!(f, "{} {{ ", record.ty)?;
                for (idx, (name, value)) in record.fields.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{name}: {value}")?;
                }
                f.write_str(" }")
            }
            Self::Quoted(expr) => write!(f, "quote({expr})"),
        }
    }
}

/// A lambda parameter declaration. The same (id, name, type) triple appears
/// as an [`Expr::Parameter`] node wherever the body references it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    pub id: ParamId,
    pub name: String,
    pub ty: TypeRef,
}

impl Parameter {
    /// Reference this parameter from an expression body.
    #[must_use]
    pub fn expr(&self) -> Arc<Expr> {
        Arc::new(Expr::Parameter {
            id: self.id,
            name: self.name.clone(),
            ty: self.ty.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Negate,
    Convert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAlso,
    OrElse,
}

/// Whether a NewArray lists its elements or allocates to a bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayBounds {
    Init,
    Sized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberBinding {
    pub member: MemberRef,
    pub value: Arc<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementInit {
    pub method: MethodRef,
    pub args: Vec<Arc<Expr>>,
}

/// The expression-tree node union. Closed: every traversal in the workspace
/// is an exhaustive `match`, so adding a kind forces a compile-time review
/// of every visitor.
///
/// Children are `Arc` so rewriters can preserve node identity when nothing
/// underneath changed, and so subtrees are shared rather than copied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Expr {
    Constant {
        value: Value,
        ty: TypeRef,
    },
    Parameter {
        id: ParamId,
        name: String,
        ty: TypeRef,
    },
    Member {
        target: Option<Arc<Expr>>,
        member: MemberRef,
        ty: TypeRef,
    },
    Call {
        target: Option<Arc<Expr>>,
        method: MethodRef,
        args: Vec<Arc<Expr>>,
        ty: TypeRef,
    },
    Unary {
        op: UnaryOp,
        operand: Arc<Expr>,
        lifted: bool,
        method: Option<MethodRef>,
        ty: TypeRef,
    },
    Binary {
        op: BinaryOp,
        left: Arc<Expr>,
        right: Arc<Expr>,
        lifted: bool,
        method: Option<MethodRef>,
        ty: TypeRef,
    },
    Conditional {
        test: Arc<Expr>,
        if_true: Arc<Expr>,
        if_false: Arc<Expr>,
        ty: TypeRef,
    },
    TypeIs {
        target: Arc<Expr>,
        candidate: TypeRef,
        ty: TypeRef,
    },
    New {
        ctor: CtorRef,
        args: Vec<Arc<Expr>>,
        members: Option<Vec<MemberRef>>,
        ty: TypeRef,
    },
    NewArray {
        element: TypeRef,
        elements: Vec<Arc<Expr>>,
        bounds: ArrayBounds,
        ty: TypeRef,
    },
    Invoke {
        callee: Arc<Expr>,
        args: Vec<Arc<Expr>>,
        ty: TypeRef,
    },
    Lambda {
        params: Vec<Parameter>,
        body: Arc<Expr>,
        ty: TypeRef,
    },
    MemberInit {
        new_expr: Arc<Expr>,
        bindings: Vec<MemberBinding>,
        ty: TypeRef,
    },
    ListInit {
        new_expr: Arc<Expr>,
        inits: Vec<ElementInit>,
        ty: TypeRef,
    },
}

impl Expr {
    /// Static result type of this node.
    #[must_use]
    pub fn ty(&self) -> &TypeRef {
        match self {
            Self::Constant { ty, .. }
            | Self::Parameter { ty, .. }
            | Self::Member { ty, .. }
            | Self::Call { ty, .. }
            | Self::Unary { ty, .. }
            | Self::Binary { ty, .. }
            | Self::Conditional { ty, .. }
            | Self::TypeIs { ty, .. }
            | Self::New { ty, .. }
            | Self::NewArray { ty, .. }
            | Self::Invoke { ty, .. }
            | Self::Lambda { ty, .. }
            | Self::MemberInit { ty, .. }
            | Self::ListInit { ty, .. } => ty,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Constant { .. } => "constant",
            Self::Parameter { .. } => "parameter",
            Self::Member { .. } => "member",
            Self::Call { .. } => "call",
            Self::Unary { .. } => "unary",
            Self::Binary { .. } => "binary",
            Self::Conditional { .. } => "conditional",
            Self::TypeIs { .. } => "type_is",
            Self::New { .. } => "new",
            Self::NewArray { .. } => "new_array",
            Self::Invoke { .. } => "invoke",
            Self::Lambda { .. } => "lambda",
            Self::MemberInit { .. } => "member_init",
            Self::ListInit { .. } => "list_init",
        }
    }

    /// Direct child expressions, in evaluation order. Constant payloads are
    /// not children even when they quote a tree.
    #[must_use]
    pub fn children(&self) -> Vec<&Arc<Expr>> {
        match self {
            Self::Constant { .. } | Self::Parameter { .. } => Vec::new(),
            Self::Member { target, .. } => target.iter().collect(),
            Self::Call { target, args, .. } => target.iter().chain(args).collect(),
            Self::Unary { operand, .. } => vec![operand],
            Self::Binary { left, right, .. } => vec![left, right],
            Self::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => vec![test, if_true, if_false],
            Self::TypeIs { target, .. } => vec![target],
            Self::New { args, .. } => args.iter().collect(),
            Self::NewArray { elements, .. } => elements.iter().collect(),
            Self::Invoke { callee, args, .. } => std::iter::once(callee).chain(args).collect(),
            Self::Lambda { body, .. } => vec![body],
            Self::MemberInit {
                new_expr, bindings, ..
            } => std::iter::once(new_expr)
                .chain(bindings.iter().map(|binding| &binding.value))
                .collect(),
            Self::ListInit {
                new_expr, inits, ..
            } => std::iter::once(new_expr)
                .chain(inits.iter().flat_map(|init| &init.args))
                .collect(),
        }
    }

    /// True if `pred` matches this node or any node reachable through
    /// structural children.
    pub fn any_node(&self, pred: &mut impl FnMut(&Expr) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        self.children().into_iter().any(|child| child.any_node(pred))
    }

    #[must_use]
    pub fn as_lambda(&self) -> Option<(&[Parameter], &Arc<Expr>)> {
        match self {
            Self::Lambda { params, body, .. } => Some((params, body)),
            _ => None,
        }
    }

    // ── Builders ────────────────────────────────────────────────────────

    #[must_use]
    pub fn constant(value: Value) -> Arc<Self> {
        let ty = value.type_of();
        Self::constant_typed(value, ty)
    }

    #[must_use]
    pub fn constant_typed(value: Value, ty: TypeRef) -> Arc<Self> {
        Arc::new(Self::Constant { value, ty })
    }

    /// Declare a fresh parameter. Each call mints a new identity.
    pub fn parameter(name: impl Into<String>, ty: TypeRef) -> Parameter {
        Parameter {
            id: ParamId::fresh(),
            name: name.into(),
            ty,
        }
    }

    #[must_use]
    pub fn lambda(params: Vec<Parameter>, body: Arc<Self>) -> Arc<Self> {
        let ty = TypeRef::func(
            params.iter().map(|param| param.ty.clone()).collect(),
            body.ty().clone(),
        );
        Arc::new(Self::Lambda { params, body, ty })
    }

    /// Apply a function-typed expression. The node's static type is the
    /// callee's declared return type.
    pub fn invoke(callee: Arc<Self>, args: Vec<Arc<Self>>) -> Result<Arc<Self>, AstError> {
        let ret = callee
            .ty()
            .ret()
            .cloned()
            .ok_or_else(|| AstError::NotInvokable {
                found: callee.ty().clone(),
            })?;
        Ok(Arc::new(Self::Invoke {
            callee,
            args,
            ty: ret,
        }))
    }

    #[must_use]
    pub fn member(target: Arc<Self>, member: MemberRef, ty: TypeRef) -> Arc<Self> {
        Arc::new(Self::Member {
            target: Some(target),
            member,
            ty,
        })
    }

    /// Member access with the descriptor derived from the target's type.
    #[must_use]
    pub fn field(target: Arc<Self>, name: &str, ty: TypeRef) -> Arc<Self> {
        let member = MemberRef::new(target.ty().clone(), name);
        Self::member(target, member, ty)
    }

    #[must_use]
    pub fn call(
        target: Option<Arc<Self>>,
        method: MethodRef,
        args: Vec<Arc<Self>>,
    ) -> Arc<Self> {
        let ty = method.ret.clone();
        Arc::new(Self::Call {
            target,
            method,
            args,
            ty,
        })
    }

    #[must_use]
    pub fn unary(op: UnaryOp, operand: Arc<Self>, ty: TypeRef) -> Arc<Self> {
        Arc::new(Self::Unary {
            op,
            operand,
            lifted: false,
            method: None,
            ty,
        })
    }

    #[must_use]
    pub fn not(operand: Arc<Self>) -> Arc<Self> {
        Self::unary(UnaryOp::Not, operand, TypeRef::bool())
    }

    #[must_use]
    pub fn neg(operand: Arc<Self>) -> Arc<Self> {
        let ty = operand.ty().clone();
        Self::unary(UnaryOp::Negate, operand, ty)
    }

    #[must_use]
    pub fn convert(operand: Arc<Self>, ty: TypeRef) -> Arc<Self> {
        Self::unary(UnaryOp::Convert, operand, ty)
    }

    #[must_use]
    pub fn binary(op: BinaryOp, left: Arc<Self>, right: Arc<Self>, ty: TypeRef) -> Arc<Self> {
        Arc::new(Self::Binary {
            op,
            left,
            right,
            lifted: false,
            method: None,
            ty,
        })
    }

    #[must_use]
    pub fn and_also(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Self::binary(BinaryOp::AndAlso, left, right, TypeRef::bool())
    }

    #[must_use]
    pub fn or_else(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Self::binary(BinaryOp::OrElse, left, right, TypeRef::bool())
    }

    #[must_use]
    pub fn eq(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Self::binary(BinaryOp::Eq, left, right, TypeRef::bool())
    }

    #[must_use]
    pub fn ne(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Self::binary(BinaryOp::Ne, left, right, TypeRef::bool())
    }

    #[must_use]
    pub fn lt(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Self::binary(BinaryOp::Lt, left, right, TypeRef::bool())
    }

    #[must_use]
    pub fn le(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Self::binary(BinaryOp::Le, left, right, TypeRef::bool())
    }

    #[must_use]
    pub fn gt(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Self::binary(BinaryOp::Gt, left, right, TypeRef::bool())
    }

    #[must_use]
    pub fn ge(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Self::binary(BinaryOp::Ge, left, right, TypeRef::bool())
    }

    #[must_use]
    pub fn add(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        let ty = common_arith(left.ty(), right.ty());
        Self::binary(BinaryOp::Add, left, right, ty)
    }

    #[must_use]
    pub fn sub(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        let ty = common_arith(left.ty(), right.ty());
        Self::binary(BinaryOp::Sub, left, right, ty)
    }

    #[must_use]
    pub fn mul(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        let ty = common_arith(left.ty(), right.ty());
        Self::binary(BinaryOp::Mul, left, right, ty)
    }

    /// Division always widens to float64, matching the evaluator.
    #[must_use]
    pub fn div(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        Self::binary(BinaryOp::Div, left, right, TypeRef::float64())
    }

    #[must_use]
    pub fn rem(left: Arc<Self>, right: Arc<Self>) -> Arc<Self> {
        let ty = common_arith(left.ty(), right.ty());
        Self::binary(BinaryOp::Mod, left, right, ty)
    }

    #[must_use]
    pub fn conditional(test: Arc<Self>, if_true: Arc<Self>, if_false: Arc<Self>) -> Arc<Self> {
        let ty = if_true.ty().clone();
        Arc::new(Self::Conditional {
            test,
            if_true,
            if_false,
            ty,
        })
    }

    #[must_use]
    pub fn type_is(target: Arc<Self>, candidate: TypeRef) -> Arc<Self> {
        Arc::new(Self::TypeIs {
            target,
            candidate,
            ty: TypeRef::bool(),
        })
    }

    #[must_use]
    pub fn new_object(
        ctor: CtorRef,
        args: Vec<Arc<Self>>,
        members: Option<Vec<MemberRef>>,
    ) -> Arc<Self> {
        let ty = ctor.declaring.clone();
        Arc::new(Self::New {
            ctor,
            args,
            members,
            ty,
        })
    }

    #[must_use]
    pub fn new_array(element: TypeRef, elements: Vec<Arc<Self>>) -> Arc<Self> {
        let ty = TypeRef::array(element.clone());
        Arc::new(Self::NewArray {
            element,
            elements,
            bounds: ArrayBounds::Init,
            ty,
        })
    }

    #[must_use]
    pub fn new_array_sized(element: TypeRef, len: Arc<Self>) -> Arc<Self> {
        let ty = TypeRef::array(element.clone());
        Arc::new(Self::NewArray {
            element,
            elements: vec![len],
            bounds: ArrayBounds::Sized,
            ty,
        })
    }

    #[must_use]
    pub fn member_init(new_expr: Arc<Self>, bindings: Vec<MemberBinding>) -> Arc<Self> {
        let ty = new_expr.ty().clone();
        Arc::new(Self::MemberInit {
            new_expr,
            bindings,
            ty,
        })
    }

    #[must_use]
    pub fn list_init(new_expr: Arc<Self>, inits: Vec<ElementInit>) -> Arc<Self> {
        let ty = new_expr.ty().clone();
        Arc::new(Self::ListInit {
            new_expr,
            inits,
            ty,
        })
    }

    /// Wrap a tree in the no-op expandable marker call.
    #[must_use]
    pub fn marked(inner: Arc<Self>) -> Arc<Self> {
        let ty = inner.ty().clone();
        let method = MethodRef::new(
            TypeRef::named("querykit"),
            MARKER_METHOD,
            vec![ty.clone()],
            ty,
        );
        Self::call(None, method, vec![inner])
    }

    /// A "compile this expression to a callable" call on a function-typed
    /// target. The static type stays the function type; rewriting resolves
    /// the call away when the target is statically known.
    pub fn compile_call(target: Arc<Self>) -> Result<Arc<Self>, AstError> {
        let func_ty = target.ty().clone();
        if func_ty.ret().is_none() {
            return Err(AstError::NotInvokable { found: func_ty });
        }
        let method = MethodRef::new(func_ty.clone(), COMPILE_METHOD, Vec::new(), func_ty);
        Ok(Self::call(Some(target), method, Vec::new()))
    }

    /// Model a lambda capturing `name` from its environment: a member read
    /// of a synthesized-closure constant whose field holds the quoted tree.
    #[must_use]
    pub fn captured(name: &str, quoted: Arc<Self>) -> Arc<Self> {
        let ty = quoted.ty().clone();
        Self::captured_raw(name, Value::Quoted(quoted), ty)
    }

    /// Same shape as [`Expr::captured`] for an ordinary (non-expression)
    /// captured value. The expander leaves these member reads in place.
    #[must_use]
    pub fn captured_value(name: &str, value: Value) -> Arc<Self> {
        let ty = value.type_of();
        Self::captured_raw(name, value, ty)
    }

    fn captured_raw(name: &str, value: Value, ty: TypeRef) -> Arc<Self> {
        let closure_ty = TypeRef::closure(name);
        let env = Record::new(closure_ty.clone()).with_field(name, value);
        let target = Self::constant_typed(Value::Record(env), closure_ty.clone());
        Self::member(target, MemberRef::new(closure_ty, name), ty)
    }
}

/// Arithmetic result type: utf8 concatenation stays utf8, any float operand
/// widens to float64, otherwise int64.
fn common_arith(left: &TypeRef, right: &TypeRef) -> TypeRef {
    if left.is_utf8() && right.is_utf8() {
        TypeRef::utf8()
    } else if left.is_float() || right.is_float() {
        TypeRef::float64()
    } else {
        TypeRef::int64()
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant { value, .. } => write!(f, "{value}"),
            Self::Parameter { name, .. } => f.write_str(name),
            Self::Member { target, member, .. } => match target {
                Some(target) => write!(f, "{target}.{}", member.name),
                None => write!(f, "{}::{}", member.declaring, member.name),
            },
            Self::Call {
                target,
                method,
                args,
                ..
            } => {
                if let Some(target) = target {
                    write!(f, "{target}.")?;
                }
                write!(f, "{}(", method.name)?;
                fmt_list(f, args)?;
                f.write_str(")")
            }
            Self::Unary { op, operand, .. } => match op {
                UnaryOp::Not => write!(f, "!{operand}"),
                UnaryOp::Negate => write!(f, "-{operand}"),
                UnaryOp::Convert => write!(f, "({}){operand}", self.ty()),
            },
            Self::Binary {
                op, left, right, ..
            } => {
                let symbol = match op {
                    BinaryOp::Add => "+",
                    BinaryOp::Sub => "-",
                    BinaryOp::Mul => "*",
                    BinaryOp::Div => "/",
                    BinaryOp::Mod => "%",
                    BinaryOp::Eq => "==",
                    BinaryOp::Ne => "!=",
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    BinaryOp::Ge => ">=",
                    BinaryOp::AndAlso => "&&",
                    BinaryOp::OrElse => "||",
                };
                write!(f, "({left} {symbol} {right})")
            }
            Self::Conditional {
                test,
                if_true,
                if_false,
                ..
            } => write!(f, "({test} ? {if_true} : {if_false})"),
            Self::TypeIs {
                target, candidate, ..
            } => write!(f, "({target} is {candidate})"),
            Self::New { ctor, args, .. } => {
                write!(f, "new {}(", ctor.declaring)?;
                fmt_list(f, args)?;
                f.write_str(")")
            }
            Self::NewArray {
                elements, bounds, ..
            } => match bounds {
                ArrayBounds::Init => {
                    f.write_str("[")?;
                    fmt_list(f, elements)?;
                    f.write_str("]")
                }
                ArrayBounds::Sized => {
                    write!(f, "array(len = ")?;
                    fmt_list(f, elements)?;
                    f.write_str(")")
                }
            },
            Self::Invoke { callee, args, .. } => {
                write!(f, "{callee}(")?;
                fmt_list(f, args)?;
                f.write_str(")")
            }
            Self::Lambda { params, body, .. } => {
                if params.len() == 1 {
                    write!(f, "{} => {body}", params[0].name)
                } else {
                    f.write_str("(")?;
                    for (idx, param) in params.iter().enumerate() {
                        if idx > 0 {
                            f.write_str(", ")?;
                        }
                        f.write_str(&param.name)?;
                    }
                    write!(f, ") => {body}")
                }
            }
            Self::MemberInit {
                new_expr, bindings, ..
            } => {
                write!(f, "{new_expr} {{ ")?;
                for (idx, binding) in bindings.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{} = {}", binding.member.name, binding.value)?;
                }
                f.write_str(" }")
            }
            Self::ListInit {
                new_expr, inits, ..
            } => {
                write!(f, "{new_expr} {{ ")?;
                for (idx, init) in inits.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(", ")?;
                    }
                    fmt_list(f, &init.args)?;
                }
                f.write_str(" }")
            }
        }
    }
}

fn fmt_list(f: &mut fmt::Formatter<'_>, items: &[Arc<Expr>]) -> fmt::Result {
    for (idx, item) in items.iter().enumerate() {
        if idx > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{Expr, TypeRef, Value};

    #[test]
    fn lambda_builder_derives_function_type() {
        let x = Expr::parameter("x", TypeRef::int64());
        let body = Expr::add(x.expr(), Expr::constant(Value::Int64(1)));
        let lambda = Expr::lambda(vec![x], body);

        assert_eq!(
            lambda.ty(),
            &TypeRef::func(vec![TypeRef::int64()], TypeRef::int64())
        );
        assert_eq!(lambda.ty().to_string(), "Fn(int64) -> int64");
    }

    #[test]
    fn fresh_parameters_have_distinct_identities() {
        let a = Expr::parameter("x", TypeRef::int64());
        let b = Expr::parameter("x", TypeRef::int64());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn captured_builds_a_synthesized_closure_read() {
        let x = Expr::parameter("x", TypeRef::int64());
        let lambda = Expr::lambda(vec![x.clone()], x.expr());
        let read = Expr::captured("f", lambda.clone());

        let Expr::Member { target, member, ty } = read.as_ref() else {
            panic!("expected a member read");
        };
        assert!(member.declaring.is_synthesized_closure());
        assert_eq!(ty, lambda.ty());
        let Some(target) = target else {
            panic!("capture read must have a target");
        };
        assert!(target.ty().is_synthesized_closure());
    }

    #[test]
    fn invoke_rejects_non_function_callees() {
        let err = Expr::invoke(Expr::constant(Value::Int64(3)), Vec::new())
            .expect_err("int64 is not invokable");
        assert_eq!(err.to_string(), "callee of type int64 is not invokable");
    }

    #[test]
    fn display_renders_composed_predicates() {
        let x = Expr::parameter("x", TypeRef::named("Person"));
        let body = Expr::gt(
            Expr::field(x.expr(), "age", TypeRef::int64()),
            Expr::constant(Value::Int64(5)),
        );
        let lambda = Expr::lambda(vec![x], body);
        assert_eq!(lambda.to_string(), "x => (x.age > 5)");
    }

    #[test]
    fn semantic_eq_treats_nan_as_equal() {
        let left = Value::Float64(f64::NAN);
        let right = Value::Float64(f64::NAN);
        assert!(left.semantic_eq(&right));
        assert_ne!(left, right);
    }

    #[test]
    fn expr_json_shape_is_tagged_by_kind() {
        let tree = Expr::eq(
            Expr::constant(Value::Int64(1)),
            Expr::constant(Value::Int64(1)),
        );
        let json = serde_json::to_value(tree.as_ref()).expect("serializes");
        assert_eq!(json["kind"], "binary");
        assert_eq!(json["op"], "eq");
        assert_eq!(json["left"]["kind"], "constant");
    }
}
