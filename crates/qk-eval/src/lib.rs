#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use qk_ast::{
    ArrayBounds, AstError, BinaryOp, COMPILE_METHOD, Expr, MARKER_METHOD, ParamId, Record,
    TypeRef, UnaryOp, Value,
};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("cannot compile a {kind} node; only lambdas compile to callables")]
    NotALambda { kind: &'static str },
    #[error("callable expects {expected} argument(s) but received {found}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("parameter `{name}` is unbound at evaluation time")]
    UnboundParameter { name: String },
    #[error("record of type {ty} has no member `{member}`")]
    UnknownMember { ty: TypeRef, member: String },
    #[error("static member access `{member}` is not supported")]
    StaticMember { member: String },
    #[error("member access requires a record target, found {found}")]
    NotARecord { found: TypeRef },
    #[error("no evaluation rule for method `{name}`")]
    UnknownMethod { name: String },
    #[error("value of type {found} is not invokable")]
    NotInvokable { found: TypeRef },
    #[error("expected a {expected} value, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: TypeRef,
    },
    #[error("cannot cast {from} to {to}")]
    InvalidCast { from: TypeRef, to: TypeRef },
    #[error("integer arithmetic overflowed")]
    NumericOverflow,
    #[error("integer division or remainder by zero")]
    DivideByZero,
    #[error("array length must be a non-negative integer")]
    InvalidLength,
    #[error("positional construction requires a member mapping")]
    ConstructorShape,
    #[error(transparent)]
    Value(#[from] AstError),
}

/// A lambda tree validated for local execution. Interpretation happens on
/// [`CompiledFn::call`]; the tree itself is shared, not copied.
#[derive(Debug, Clone)]
pub struct CompiledFn {
    lambda: Arc<Expr>,
}

/// Validate that `lambda` is a lambda node and wrap it as a callable.
pub fn compile(lambda: &Arc<Expr>) -> Result<CompiledFn, EvalError> {
    if lambda.as_lambda().is_none() {
        return Err(EvalError::NotALambda {
            kind: lambda.kind_name(),
        });
    }
    Ok(CompiledFn {
        lambda: lambda.clone(),
    })
}

impl CompiledFn {
    #[must_use]
    pub fn arity(&self) -> usize {
        match self.lambda.as_lambda() {
            Some((params, _)) => params.len(),
            None => 0,
        }
    }

    #[must_use]
    pub fn expr(&self) -> &Arc<Expr> {
        &self.lambda
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, EvalError> {
        let Expr::Lambda { params, body, .. } = self.lambda.as_ref() else {
            unreachable!("compile only accepts lambda nodes");
        };
        if params.len() != args.len() {
            return Err(EvalError::ArityMismatch {
                expected: params.len(),
                found: args.len(),
            });
        }
        let mut env: HashMap<ParamId, Value> = params
            .iter()
            .zip(args)
            .map(|(param, arg)| (param.id, arg.clone()))
            .collect();
        eval(body, &mut env)
    }

    pub fn call1(&self, arg: &Value) -> Result<Value, EvalError> {
        self.call(std::slice::from_ref(arg))
    }
}

fn eval(expr: &Expr, env: &mut HashMap<ParamId, Value>) -> Result<Value, EvalError> {
    match expr {
        Expr::Constant { value, .. } => Ok(value.clone()),
        Expr::Parameter { id, name, .. } => {
            env.get(id)
                .cloned()
                .ok_or_else(|| EvalError::UnboundParameter { name: name.clone() })
        }
        Expr::Member { target, member, .. } => {
            let Some(target) = target else {
                return Err(EvalError::StaticMember {
                    member: member.name.clone(),
                });
            };
            match eval(target, env)? {
                Value::Record(record) => record
                    .field(&member.name)
                    .cloned()
                    .ok_or_else(|| EvalError::UnknownMember {
                        ty: record.ty().clone(),
                        member: member.name.clone(),
                    }),
                other => Err(EvalError::NotARecord {
                    found: other.type_of(),
                }),
            }
        }
        Expr::Call {
            target,
            method,
            args,
            ..
        } => eval_call(target.as_deref(), &method.name, args, env),
        Expr::Unary { op, operand, ty, .. } => {
            let value = eval(operand, env)?;
            match op {
                UnaryOp::Not => match value.as_bool() {
                    Some(v) => Ok(Value::Bool(!v)),
                    None => Err(EvalError::TypeMismatch {
                        expected: "bool",
                        found: value.type_of(),
                    }),
                },
                UnaryOp::Negate => match value {
                    Value::Int64(v) => v
                        .checked_neg()
                        .map(Value::Int64)
                        .ok_or(EvalError::NumericOverflow),
                    Value::Float64(v) => Ok(Value::Float64(-v)),
                    other => Err(EvalError::TypeMismatch {
                        expected: "numeric",
                        found: other.type_of(),
                    }),
                },
                UnaryOp::Convert => cast_value(value, ty),
            }
        }
        Expr::Binary {
            op, left, right, ..
        } => eval_binary(*op, left, right, env),
        Expr::Conditional {
            test,
            if_true,
            if_false,
            ..
        } => {
            let test = eval(test, env)?;
            match test.as_bool() {
                Some(true) => eval(if_true, env),
                Some(false) => eval(if_false, env),
                None => Err(EvalError::TypeMismatch {
                    expected: "bool",
                    found: test.type_of(),
                }),
            }
        }
        Expr::TypeIs {
            target, candidate, ..
        } => {
            let value = eval(target, env)?;
            Ok(Value::Bool(&value.type_of() == candidate))
        }
        Expr::New {
            ctor,
            args,
            members,
            ..
        } => {
            if matches!(ctor.declaring, TypeRef::Array { .. }) {
                return Ok(Value::List(Vec::new()));
            }
            match members {
                Some(members) => {
                    if members.len() != args.len() {
                        return Err(EvalError::ConstructorShape);
                    }
                    let mut record = Record::new(ctor.declaring.clone());
                    for (member, arg) in members.iter().zip(args) {
                        let value = eval(arg, env)?;
                        record.set(member.name.clone(), value);
                    }
                    Ok(Value::Record(record))
                }
                None if args.is_empty() => Ok(Value::Record(Record::new(ctor.declaring.clone()))),
                None => Err(EvalError::ConstructorShape),
            }
        }
        Expr::NewArray {
            elements, bounds, ..
        } => match bounds {
            ArrayBounds::Init => {
                let values = elements
                    .iter()
                    .map(|element| eval(element, env))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List(values))
            }
            ArrayBounds::Sized => {
                let len = match elements.first() {
                    Some(expr) => eval(expr, env)?,
                    None => return Err(EvalError::InvalidLength),
                };
                let Value::Int64(len) = len else {
                    return Err(EvalError::InvalidLength);
                };
                let len = usize::try_from(len).map_err(|_| EvalError::InvalidLength)?;
                Ok(Value::List(vec![Value::Null; len]))
            }
        },
        Expr::Invoke { callee, args, .. } => {
            let lambda = match callee.as_ref() {
                Expr::Lambda { .. } => callee.clone(),
                _ => match eval(callee, env)? {
                    Value::Quoted(inner) if inner.as_lambda().is_some() => inner,
                    other => {
                        return Err(EvalError::NotInvokable {
                            found: other.type_of(),
                        });
                    }
                },
            };
            let Expr::Lambda { params, body, .. } = lambda.as_ref() else {
                unreachable!("checked to be a lambda above");
            };
            if params.len() != args.len() {
                return Err(EvalError::ArityMismatch {
                    expected: params.len(),
                    found: args.len(),
                });
            }
            for (param, arg) in params.iter().zip(args) {
                let value = eval(arg, env)?;
                env.insert(param.id, value);
            }
            eval(body, env)
        }
        Expr::Lambda { .. } => Ok(Value::Quoted(Arc::new(expr.clone()))),
        Expr::MemberInit {
            new_expr, bindings, ..
        } => match eval(new_expr, env)? {
            Value::Record(mut record) => {
                for binding in bindings {
                    let value = eval(&binding.value, env)?;
                    record.set(binding.member.name.clone(), value);
                }
                Ok(Value::Record(record))
            }
            other => Err(EvalError::NotARecord {
                found: other.type_of(),
            }),
        },
        Expr::ListInit {
            new_expr, inits, ..
        } => match eval(new_expr, env)? {
            Value::List(mut values) => {
                for init in inits {
                    let mut args = init
                        .args
                        .iter()
                        .map(|arg| eval(arg, env))
                        .collect::<Result<Vec<_>, _>>()?;
                    if args.len() == 1 {
                        values.push(args.remove(0));
                    } else {
                        values.push(Value::List(args));
                    }
                }
                Ok(Value::List(values))
            }
            other => Err(EvalError::TypeMismatch {
                expected: "list",
                found: other.type_of(),
            }),
        },
    }
}

fn eval_call(
    target: Option<&Expr>,
    name: &str,
    args: &[Arc<Expr>],
    env: &mut HashMap<ParamId, Value>,
) -> Result<Value, EvalError> {
    if name == MARKER_METHOD && target.is_none() && args.len() == 1 {
        return eval(&args[0], env);
    }
    match (target, name) {
        (Some(target), COMPILE_METHOD) => {
            // Compiling an in-memory tree is the identity: the callable is
            // the quoted lambda itself.
            match eval(target, env)? {
                quoted @ Value::Quoted(_) => Ok(quoted),
                other => Err(EvalError::NotInvokable {
                    found: other.type_of(),
                }),
            }
        }
        (Some(target), "len") => match eval(target, env)? {
            Value::Utf8(s) => Ok(Value::Int64(s.chars().count() as i64)),
            Value::List(values) => Ok(Value::Int64(values.len() as i64)),
            other => Err(EvalError::TypeMismatch {
                expected: "utf8 or list",
                found: other.type_of(),
            }),
        },
        (Some(target), "contains") if args.len() == 1 => {
            let haystack = eval(target, env)?;
            let needle = eval(&args[0], env)?;
            match (&haystack, &needle) {
                (Value::Utf8(s), Value::Utf8(sub)) => Ok(Value::Bool(s.contains(sub.as_str()))),
                (Value::List(values), needle) => {
                    Ok(Value::Bool(values.iter().any(|v| v.semantic_eq(needle))))
                }
                _ => Err(EvalError::TypeMismatch {
                    expected: "utf8 or list",
                    found: haystack.type_of(),
                }),
            }
        }
        (Some(target), "starts_with") if args.len() == 1 => {
            let haystack = eval(target, env)?;
            let prefix = eval(&args[0], env)?;
            match (&haystack, &prefix) {
                (Value::Utf8(s), Value::Utf8(p)) => Ok(Value::Bool(s.starts_with(p.as_str()))),
                _ => Err(EvalError::TypeMismatch {
                    expected: "utf8",
                    found: haystack.type_of(),
                }),
            }
        }
        _ => Err(EvalError::UnknownMethod {
            name: name.to_owned(),
        }),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    env: &mut HashMap<ParamId, Value>,
) -> Result<Value, EvalError> {
    // Short-circuit forms evaluate the right side only when needed.
    if matches!(op, BinaryOp::AndAlso | BinaryOp::OrElse) {
        let lhs = eval(left, env)?;
        let Some(lhs) = lhs.as_bool() else {
            return Err(EvalError::TypeMismatch {
                expected: "bool",
                found: lhs.type_of(),
            });
        };
        match (op, lhs) {
            (BinaryOp::AndAlso, false) => return Ok(Value::Bool(false)),
            (BinaryOp::OrElse, true) => return Ok(Value::Bool(true)),
            _ => {}
        }
        let rhs = eval(right, env)?;
        return match rhs.as_bool() {
            Some(rhs) => Ok(Value::Bool(rhs)),
            None => Err(EvalError::TypeMismatch {
                expected: "bool",
                found: rhs.type_of(),
            }),
        };
    }

    let lhs = eval(left, env)?;
    let rhs = eval(right, env)?;
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => compare(op, &lhs, &rhs),
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            arith(op, &lhs, &rhs)
        }
        BinaryOp::AndAlso | BinaryOp::OrElse => {
            unreachable!("short-circuit forms handled above")
        }
    }
}

fn is_numeric(value: &Value) -> bool {
    matches!(value, Value::Int64(_) | Value::Float64(_))
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int64(a), Value::Float64(b)) | (Value::Float64(b), Value::Int64(a)) => {
            (*a as f64) == *b
        }
        _ => lhs == rhs,
    }
}

fn compare(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    use std::cmp::Ordering;

    let ordering = match (lhs, rhs) {
        (Value::Utf8(a), Value::Utf8(b)) => Some(a.cmp(b)),
        _ if is_numeric(lhs) && is_numeric(rhs) => {
            let a = lhs.to_f64()?;
            let b = rhs.to_f64()?;
            a.partial_cmp(&b)
        }
        _ => {
            return Err(EvalError::TypeMismatch {
                expected: "comparable (numeric or utf8)",
                found: lhs.type_of(),
            });
        }
    };
    // NaN comparisons are false across the board.
    let out = match ordering {
        Some(Ordering::Less) => matches!(op, BinaryOp::Lt | BinaryOp::Le),
        Some(Ordering::Equal) => matches!(op, BinaryOp::Le | BinaryOp::Ge),
        Some(Ordering::Greater) => matches!(op, BinaryOp::Gt | BinaryOp::Ge),
        None => false,
    };
    Ok(Value::Bool(out))
}

fn arith(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    if let (Value::Utf8(a), Value::Utf8(b), BinaryOp::Add) = (lhs, rhs, op) {
        return Ok(Value::Utf8(format!("{a}{b}")));
    }
    if !is_numeric(lhs) || !is_numeric(rhs) {
        let found = if is_numeric(lhs) { rhs } else { lhs };
        return Err(EvalError::TypeMismatch {
            expected: "numeric",
            found: found.type_of(),
        });
    }
    // Division always widens to float64, matching the static type the
    // builders assign.
    if matches!(op, BinaryOp::Div) {
        return Ok(Value::Float64(lhs.to_f64()? / rhs.to_f64()?));
    }
    match (lhs, rhs) {
        (Value::Int64(a), Value::Int64(b)) => {
            let out = match op {
                BinaryOp::Add => a.checked_add(*b),
                BinaryOp::Sub => a.checked_sub(*b),
                BinaryOp::Mul => a.checked_mul(*b),
                BinaryOp::Mod => {
                    if *b == 0 {
                        return Err(EvalError::DivideByZero);
                    }
                    a.checked_rem(*b)
                }
                _ => unreachable!("non-arithmetic op in arith"),
            };
            out.map(Value::Int64).ok_or(EvalError::NumericOverflow)
        }
        _ => {
            let a = lhs.to_f64()?;
            let b = rhs.to_f64()?;
            let out = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Mod => a % b,
                _ => unreachable!("non-arithmetic op in arith"),
            };
            Ok(Value::Float64(out))
        }
    }
}

fn cast_value(value: Value, target: &TypeRef) -> Result<Value, EvalError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let from = value.type_of();
    if &from == target {
        return Ok(value);
    }
    match target {
        TypeRef::Named { name } if name == "int64" => match value {
            Value::Bool(v) => Ok(Value::Int64(i64::from(v))),
            Value::Float64(v) if v.is_finite() && v == v.trunc() => Ok(Value::Int64(v as i64)),
            _ => Err(EvalError::InvalidCast {
                from,
                to: target.clone(),
            }),
        },
        TypeRef::Named { name } if name == "float64" => match value {
            Value::Bool(v) => Ok(Value::Float64(if v { 1.0 } else { 0.0 })),
            Value::Int64(v) => Ok(Value::Float64(v as f64)),
            _ => Err(EvalError::InvalidCast {
                from,
                to: target.clone(),
            }),
        },
        _ => Err(EvalError::InvalidCast {
            from,
            to: target.clone(),
        }),
    }
}
