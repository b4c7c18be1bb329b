#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use qk_ast::{Expr, ParamId};

/// Recursive tree walker/rebuilder.
///
/// Every hook defaults to the structural recursion in the matching `walk_*`
/// function: visit all children, and rebuild the node only if some child's
/// identity changed — otherwise the original `Arc` is returned untouched, so
/// an untouched subtree stays shared. Implementations override only the node
/// kinds they care about.
///
/// Visiting is fallible; rewriters that can reject malformed trees set
/// `Error` accordingly. Pure traversals use `Infallible`.
pub trait Visitor {
    type Error;

    fn visit(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk(self, expr)
    }

    fn visit_constant(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        Ok(expr.clone())
    }

    fn visit_parameter(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        Ok(expr.clone())
    }

    fn visit_member(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_member(self, expr)
    }

    fn visit_call(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_call(self, expr)
    }

    fn visit_unary(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_unary(self, expr)
    }

    fn visit_binary(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_binary(self, expr)
    }

    fn visit_conditional(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_conditional(self, expr)
    }

    fn visit_type_is(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_type_is(self, expr)
    }

    fn visit_new(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_new(self, expr)
    }

    fn visit_new_array(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_new_array(self, expr)
    }

    fn visit_invoke(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_invoke(self, expr)
    }

    fn visit_lambda(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_lambda(self, expr)
    }

    fn visit_member_init(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_member_init(self, expr)
    }

    fn visit_list_init(&mut self, expr: &Arc<Expr>) -> Result<Arc<Expr>, Self::Error> {
        walk_list_init(self, expr)
    }
}

/// Kind dispatch. The union is closed, so this `match` is exhaustive by
/// construction.
pub fn walk<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    match expr.as_ref() {
        Expr::Constant { .. } => visitor.visit_constant(expr),
        Expr::Parameter { .. } => visitor.visit_parameter(expr),
        Expr::Member { .. } => visitor.visit_member(expr),
        Expr::Call { .. } => visitor.visit_call(expr),
        Expr::Unary { .. } => visitor.visit_unary(expr),
        Expr::Binary { .. } => visitor.visit_binary(expr),
        Expr::Conditional { .. } => visitor.visit_conditional(expr),
        Expr::TypeIs { .. } => visitor.visit_type_is(expr),
        Expr::New { .. } => visitor.visit_new(expr),
        Expr::NewArray { .. } => visitor.visit_new_array(expr),
        Expr::Invoke { .. } => visitor.visit_invoke(expr),
        Expr::Lambda { .. } => visitor.visit_lambda(expr),
        Expr::MemberInit { .. } => visitor.visit_member_init(expr),
        Expr::ListInit { .. } => visitor.visit_list_init(expr),
    }
}

/// Visit an optional child; absent stays absent.
pub fn visit_opt<V: Visitor + ?Sized>(
    visitor: &mut V,
    child: &Option<Arc<Expr>>,
) -> Result<Option<Arc<Expr>>, V::Error> {
    match child {
        Some(expr) => Ok(Some(visitor.visit(expr)?)),
        None => Ok(None),
    }
}

/// Visit a child list, reporting whether any element's identity changed.
pub fn visit_all<V: Visitor + ?Sized>(
    visitor: &mut V,
    children: &[Arc<Expr>],
) -> Result<(Vec<Arc<Expr>>, bool), V::Error> {
    let mut out = Vec::with_capacity(children.len());
    let mut changed = false;
    for child in children {
        let visited = visitor.visit(child)?;
        changed |= !Arc::ptr_eq(&visited, child);
        out.push(visited);
    }
    Ok((out, changed))
}

fn opt_changed(before: &Option<Arc<Expr>>, after: &Option<Arc<Expr>>) -> bool {
    match (before, after) {
        (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
        (None, None) => false,
        _ => true,
    }
}

pub fn walk_member<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::Member { target, member, ty } = expr.as_ref() else {
        unreachable!("walk_member dispatched on a non-member node");
    };
    let new_target = visit_opt(visitor, target)?;
    if opt_changed(target, &new_target) {
        Ok(Arc::new(Expr::Member {
            target: new_target,
            member: member.clone(),
            ty: ty.clone(),
        }))
    } else {
        Ok(expr.clone())
    }
}

pub fn walk_call<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::Call {
        target,
        method,
        args,
        ty,
    } = expr.as_ref()
    else {
        unreachable!("walk_call dispatched on a non-call node");
    };
    let new_target = visit_opt(visitor, target)?;
    let (new_args, args_changed) = visit_all(visitor, args)?;
    if opt_changed(target, &new_target) || args_changed {
        Ok(Arc::new(Expr::Call {
            target: new_target,
            method: method.clone(),
            args: new_args,
            ty: ty.clone(),
        }))
    } else {
        Ok(expr.clone())
    }
}

pub fn walk_unary<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::Unary {
        op,
        operand,
        lifted,
        method,
        ty,
    } = expr.as_ref()
    else {
        unreachable!("walk_unary dispatched on a non-unary node");
    };
    let new_operand = visitor.visit(operand)?;
    if Arc::ptr_eq(&new_operand, operand) {
        Ok(expr.clone())
    } else {
        Ok(Arc::new(Expr::Unary {
            op: *op,
            operand: new_operand,
            lifted: *lifted,
            method: method.clone(),
            ty: ty.clone(),
        }))
    }
}

pub fn walk_binary<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::Binary {
        op,
        left,
        right,
        lifted,
        method,
        ty,
    } = expr.as_ref()
    else {
        unreachable!("walk_binary dispatched on a non-binary node");
    };
    let new_left = visitor.visit(left)?;
    let new_right = visitor.visit(right)?;
    if Arc::ptr_eq(&new_left, left) && Arc::ptr_eq(&new_right, right) {
        Ok(expr.clone())
    } else {
        Ok(Arc::new(Expr::Binary {
            op: *op,
            left: new_left,
            right: new_right,
            lifted: *lifted,
            method: method.clone(),
            ty: ty.clone(),
        }))
    }
}

pub fn walk_conditional<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::Conditional {
        test,
        if_true,
        if_false,
        ty,
    } = expr.as_ref()
    else {
        unreachable!("walk_conditional dispatched on a non-conditional node");
    };
    let new_test = visitor.visit(test)?;
    let new_true = visitor.visit(if_true)?;
    let new_false = visitor.visit(if_false)?;
    if Arc::ptr_eq(&new_test, test)
        && Arc::ptr_eq(&new_true, if_true)
        && Arc::ptr_eq(&new_false, if_false)
    {
        Ok(expr.clone())
    } else {
        Ok(Arc::new(Expr::Conditional {
            test: new_test,
            if_true: new_true,
            if_false: new_false,
            ty: ty.clone(),
        }))
    }
}

pub fn walk_type_is<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::TypeIs {
        target,
        candidate,
        ty,
    } = expr.as_ref()
    else {
        unreachable!("walk_type_is dispatched on a non-type-is node");
    };
    let new_target = visitor.visit(target)?;
    if Arc::ptr_eq(&new_target, target) {
        Ok(expr.clone())
    } else {
        Ok(Arc::new(Expr::TypeIs {
            target: new_target,
            candidate: candidate.clone(),
            ty: ty.clone(),
        }))
    }
}

pub fn walk_new<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::New {
        ctor,
        args,
        members,
        ty,
    } = expr.as_ref()
    else {
        unreachable!("walk_new dispatched on a non-new node");
    };
    let (new_args, changed) = visit_all(visitor, args)?;
    if changed {
        Ok(Arc::new(Expr::New {
            ctor: ctor.clone(),
            args: new_args,
            members: members.clone(),
            ty: ty.clone(),
        }))
    } else {
        Ok(expr.clone())
    }
}

pub fn walk_new_array<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::NewArray {
        element,
        elements,
        bounds,
        ty,
    } = expr.as_ref()
    else {
        unreachable!("walk_new_array dispatched on a non-new-array node");
    };
    let (new_elements, changed) = visit_all(visitor, elements)?;
    if changed {
        Ok(Arc::new(Expr::NewArray {
            element: element.clone(),
            elements: new_elements,
            bounds: *bounds,
            ty: ty.clone(),
        }))
    } else {
        Ok(expr.clone())
    }
}

pub fn walk_invoke<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::Invoke { callee, args, ty } = expr.as_ref() else {
        unreachable!("walk_invoke dispatched on a non-invoke node");
    };
    let new_callee = visitor.visit(callee)?;
    let (new_args, args_changed) = visit_all(visitor, args)?;
    if Arc::ptr_eq(&new_callee, callee) && !args_changed {
        Ok(expr.clone())
    } else {
        Ok(Arc::new(Expr::Invoke {
            callee: new_callee,
            args: new_args,
            ty: ty.clone(),
        }))
    }
}

pub fn walk_lambda<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::Lambda { params, body, ty } = expr.as_ref() else {
        unreachable!("walk_lambda dispatched on a non-lambda node");
    };
    let new_body = visitor.visit(body)?;
    if Arc::ptr_eq(&new_body, body) {
        Ok(expr.clone())
    } else {
        Ok(Arc::new(Expr::Lambda {
            params: params.clone(),
            body: new_body,
            ty: ty.clone(),
        }))
    }
}

pub fn walk_member_init<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::MemberInit {
        new_expr,
        bindings,
        ty,
    } = expr.as_ref()
    else {
        unreachable!("walk_member_init dispatched on a non-member-init node");
    };
    let visited_new = visitor.visit(new_expr)?;
    let mut changed = !Arc::ptr_eq(&visited_new, new_expr);
    let mut new_bindings = Vec::with_capacity(bindings.len());
    for binding in bindings {
        let value = visitor.visit(&binding.value)?;
        changed |= !Arc::ptr_eq(&value, &binding.value);
        new_bindings.push(qk_ast::MemberBinding {
            member: binding.member.clone(),
            value,
        });
    }
    if changed {
        Ok(Arc::new(Expr::MemberInit {
            new_expr: visited_new,
            bindings: new_bindings,
            ty: ty.clone(),
        }))
    } else {
        Ok(expr.clone())
    }
}

pub fn walk_list_init<V: Visitor + ?Sized>(
    visitor: &mut V,
    expr: &Arc<Expr>,
) -> Result<Arc<Expr>, V::Error> {
    let Expr::ListInit {
        new_expr,
        inits,
        ty,
    } = expr.as_ref()
    else {
        unreachable!("walk_list_init dispatched on a non-list-init node");
    };
    let visited_new = visitor.visit(new_expr)?;
    let mut changed = !Arc::ptr_eq(&visited_new, new_expr);
    let mut new_inits = Vec::with_capacity(inits.len());
    for init in inits {
        let (args, args_changed) = visit_all(visitor, &init.args)?;
        changed |= args_changed;
        new_inits.push(qk_ast::ElementInit {
            method: init.method.clone(),
            args,
        });
    }
    if changed {
        Ok(Arc::new(Expr::ListInit {
            new_expr: visited_new,
            inits: new_inits,
            ty: ty.clone(),
        }))
    } else {
        Ok(expr.clone())
    }
}

/// Scoped binding environment: a stack of frames with innermost-to-outermost
/// lookup. Built fresh for every compare/rewrite call and discarded on
/// return; frames push on lambda entry and pop on exit.
#[derive(Debug)]
pub struct Frames<T> {
    stack: Vec<HashMap<ParamId, T>>,
}

// Manual impl: the derive would demand `T: Default` for no reason.
impl<T> Default for Frames<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Frames<T> {
    #[must_use]
    pub fn new() -> Self {
        Self { stack: Vec::new() }
    }

    pub fn push(&mut self, frame: HashMap<ParamId, T>) {
        self.stack.push(frame);
    }

    pub fn pop(&mut self) {
        self.stack.pop();
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Innermost binding wins; an unresolved lookup means the parameter is
    /// free at this point of the traversal.
    #[must_use]
    pub fn lookup(&self, id: ParamId) -> Option<&T> {
        self.stack.iter().rev().find_map(|frame| frame.get(&id))
    }
}
