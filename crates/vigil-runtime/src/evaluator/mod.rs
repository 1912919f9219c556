//! Compiled expression trees and their evaluation.
//!
//! A statement's expressions are compiled once by [`Compiler`] into [`Node`]
//! trees whose static types are already known. Per event, [`evaluate`] walks
//! the tree with an [`EvalContext`]: an immutable value carrying the events
//! of each input stream, the current aggregate values and the chain of
//! lambda scopes. Entering a lambda extends the context with
//! [`EvalContext::bind`]; nothing is mutated in place, so nested enumeration
//! chains such as `a.where(x => x.b.where(y => y.c > 0))` never see each
//! other's bindings.
//!
//! Evaluation is total. A missing stream, field, row or operand yields
//! [`Value::Null`], and every operator propagates it according to its own
//! rule. Nothing raised during evaluation crosses the tree boundary.

mod compiler;

pub use compiler::{AggregateSlot, Compiler, StreamBinding};

use std::cmp::Ordering;
use std::sync::Arc;
use vigil_core::{BinOp, EnumMethod, SharedEvent, Type, UnaryOp, Value};

use crate::enumeration;
use crate::table::NamedTable;

/// Expression tree node
#[derive(Debug, Clone)]
pub enum Node {
    Const(Value),
    Array(Vec<Node>),
    /// Whole event of an input stream
    Stream(usize),
    Property {
        stream: usize,
        field: String,
    },
    /// Lambda parameter `slot` of the scope opened at nesting `depth`
    Binding {
        depth: usize,
        slot: usize,
    },
    Member {
        target: Box<Node>,
        field: String,
    },
    Binary {
        op: BinOp,
        left: Box<Node>,
        right: Box<Node>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Node>,
    },
    If {
        cond: Box<Node>,
        then_branch: Box<Node>,
        else_branch: Box<Node>,
    },
    Coalesce(Vec<Node>),
    Enum(Box<EnumNode>),
    /// Value of aggregate slot `n` for the current group
    Aggregate(usize),
    Table(Box<TableRead>),
}

/// Enumeration method call
#[derive(Debug, Clone)]
pub struct EnumNode {
    pub target: Node,
    pub method: EnumMethod,
    /// Non-lambda argument: the second collection of a set operation or the
    /// count of `take`/`takeLast`
    pub operand: Option<Node>,
    pub lambda: Option<LambdaNode>,
}

#[derive(Debug, Clone)]
pub struct LambdaNode {
    pub depth: usize,
    pub body: Node,
}

/// `table[keys].column`
#[derive(Debug, Clone)]
pub struct TableRead {
    pub table: Arc<NamedTable>,
    pub keys: Vec<Node>,
    pub column: Option<usize>,
}

/// A node tree with its static type
#[derive(Debug, Clone)]
pub struct CompiledExpr {
    pub node: Node,
    pub ty: Type,
}

impl Node {
    /// Whether any part of the tree reads input stream `stream`.
    pub fn references_stream(&self, stream: usize) -> bool {
        match self {
            Node::Stream(s) | Node::Property { stream: s, .. } => *s == stream,
            Node::Const(_) | Node::Binding { .. } | Node::Aggregate(_) => false,
            Node::Array(items) | Node::Coalesce(items) => {
                items.iter().any(|n| n.references_stream(stream))
            }
            Node::Member { target, .. } => target.references_stream(stream),
            Node::Binary { left, right, .. } => {
                left.references_stream(stream) || right.references_stream(stream)
            }
            Node::Unary { operand, .. } => operand.references_stream(stream),
            Node::If {
                cond,
                then_branch,
                else_branch,
            } => {
                cond.references_stream(stream)
                    || then_branch.references_stream(stream)
                    || else_branch.references_stream(stream)
            }
            Node::Enum(e) => {
                e.target.references_stream(stream)
                    || e.operand.as_ref().is_some_and(|n| n.references_stream(stream))
                    || e.lambda.as_ref().is_some_and(|l| l.body.references_stream(stream))
            }
            Node::Table(t) => t.keys.iter().any(|n| n.references_stream(stream)),
        }
    }

    /// Names of the tables this tree reads.
    pub fn collect_tables<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Node::Table(t) => {
                out.push(t.table.name());
                for k in &t.keys {
                    k.collect_tables(out);
                }
            }
            Node::Const(_)
            | Node::Stream(_)
            | Node::Property { .. }
            | Node::Binding { .. }
            | Node::Aggregate(_) => {}
            Node::Array(items) | Node::Coalesce(items) => {
                items.iter().for_each(|n| n.collect_tables(out))
            }
            Node::Member { target, .. } => target.collect_tables(out),
            Node::Binary { left, right, .. } => {
                left.collect_tables(out);
                right.collect_tables(out);
            }
            Node::Unary { operand, .. } => operand.collect_tables(out),
            Node::If {
                cond,
                then_branch,
                else_branch,
            } => {
                cond.collect_tables(out);
                then_branch.collect_tables(out);
                else_branch.collect_tables(out);
            }
            Node::Enum(e) => {
                e.target.collect_tables(out);
                if let Some(op) = &e.operand {
                    op.collect_tables(out);
                }
                if let Some(l) = &e.lambda {
                    l.body.collect_tables(out);
                }
            }
        }
    }
}

// =============================================================================
// Evaluation context
// =============================================================================

/// One lambda invocation: the element being visited and its position
#[derive(Debug)]
pub struct Scope<'a> {
    depth: usize,
    element: &'a Value,
    index: usize,
    parent: Option<&'a Scope<'a>>,
}

/// Immutable per-evaluation state
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    streams: &'a [Option<SharedEvent>],
    aggregates: &'a [Value],
    scope: Option<&'a Scope<'a>>,
}

impl<'a> EvalContext<'a> {
    pub fn new(streams: &'a [Option<SharedEvent>]) -> Self {
        Self {
            streams,
            aggregates: &[],
            scope: None,
        }
    }

    pub fn with_aggregates(self, aggregates: &'a [Value]) -> Self {
        Self { aggregates, ..self }
    }

    /// A context one lambda level deeper. `self` is left untouched.
    pub fn bind<'s>(&self, scope: &'s Scope<'s>) -> EvalContext<'s>
    where
        'a: 's,
    {
        EvalContext {
            streams: self.streams,
            aggregates: self.aggregates,
            scope: Some(scope),
        }
    }

    /// Number of enclosing lambda scopes.
    pub fn depth(&self) -> usize {
        self.scope.map(|s| s.depth + 1).unwrap_or(0)
    }

    pub fn stream(&self, n: usize) -> Option<&'a SharedEvent> {
        self.streams.get(n).and_then(Option::as_ref)
    }

    fn binding(&self, depth: usize, slot: usize) -> Value {
        let mut current = self.scope;
        while let Some(scope) = current {
            if scope.depth == depth {
                return match slot {
                    0 => scope.element.clone(),
                    _ => Value::Int(scope.index as i64),
                };
            }
            current = scope.parent;
        }
        Value::Null
    }
}

/// Whether a filter or guard passes. Only a definite `true` does.
pub fn is_true(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

// =============================================================================
// Evaluation
// =============================================================================

pub fn evaluate(node: &Node, ctx: &EvalContext<'_>) -> Value {
    match node {
        Node::Const(v) => v.clone(),
        Node::Array(items) => Value::Array(items.iter().map(|n| evaluate(n, ctx)).collect()),
        Node::Stream(n) => ctx
            .stream(*n)
            .map(|e| Value::Event(Arc::clone(e)))
            .unwrap_or(Value::Null),
        Node::Property { stream, field } => ctx
            .stream(*stream)
            .and_then(|e| e.get(field))
            .cloned()
            .unwrap_or(Value::Null),
        Node::Binding { depth, slot } => ctx.binding(*depth, *slot),
        Node::Member { target, field } => evaluate(target, ctx)
            .get(field)
            .cloned()
            .unwrap_or(Value::Null),
        Node::Binary { op, left, right } => evaluate_binary(*op, left, right, ctx),
        Node::Unary { op, operand } => {
            let v = evaluate(operand, ctx);
            match (op, v) {
                (UnaryOp::Not, Value::Bool(b)) => Value::Bool(!b),
                (UnaryOp::Neg, Value::Int(n)) => n.checked_neg().map(Value::Int).unwrap_or_default(),
                (UnaryOp::Neg, Value::Float(x)) => Value::Float(-x),
                _ => Value::Null,
            }
        }
        Node::If {
            cond,
            then_branch,
            else_branch,
        } => {
            if is_true(&evaluate(cond, ctx)) {
                evaluate(then_branch, ctx)
            } else {
                evaluate(else_branch, ctx)
            }
        }
        Node::Coalesce(items) => items
            .iter()
            .map(|n| evaluate(n, ctx))
            .find(|v| !v.is_null())
            .unwrap_or(Value::Null),
        Node::Enum(e) => evaluate_enum(e, ctx),
        Node::Aggregate(slot) => ctx.aggregates.get(*slot).cloned().unwrap_or(Value::Null),
        Node::Table(t) => {
            let key = t.table.key_from(t.keys.iter().map(|k| evaluate(k, ctx)));
            match t.column {
                Some(column) => t.table.read_column(&key, column),
                None => t
                    .table
                    .lookup(&key)
                    .map(Value::Event)
                    .unwrap_or(Value::Null),
            }
        }
    }
}

fn evaluate_binary(op: BinOp, left: &Node, right: &Node, ctx: &EvalContext<'_>) -> Value {
    // Three-valued logic: a decisive operand wins over an absent one.
    match op {
        BinOp::And => {
            let l = evaluate(left, ctx);
            if l == Value::Bool(false) {
                return l;
            }
            let r = evaluate(right, ctx);
            return match (l, r) {
                (_, Value::Bool(false)) => Value::Bool(false),
                (Value::Bool(true), Value::Bool(true)) => Value::Bool(true),
                _ => Value::Null,
            };
        }
        BinOp::Or => {
            let l = evaluate(left, ctx);
            if l == Value::Bool(true) {
                return l;
            }
            let r = evaluate(right, ctx);
            return match (l, r) {
                (_, Value::Bool(true)) => Value::Bool(true),
                (Value::Bool(false), Value::Bool(false)) => Value::Bool(false),
                _ => Value::Null,
            };
        }
        _ => {}
    }

    let l = evaluate(left, ctx);
    let r = evaluate(right, ctx);
    if l.is_null() || r.is_null() {
        return Value::Null;
    }
    eval_binary_op(op, &l, &r).unwrap_or(Value::Null)
}

/// Apply a non-logical binary operator to two present operands.
pub fn eval_binary_op(op: BinOp, left: &Value, right: &Value) -> Option<Value> {
    match op {
        BinOp::Add => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a.checked_add(*b).map(Value::Int),
            (Value::Str(a), Value::Str(b)) => Some(Value::Str(format!("{}{}", a, b))),
            _ => Some(Value::Float(left.as_float()? + right.as_float()?)),
        },
        BinOp::Sub => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a.checked_sub(*b).map(Value::Int),
            _ => Some(Value::Float(left.as_float()? - right.as_float()?)),
        },
        BinOp::Mul => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a.checked_mul(*b).map(Value::Int),
            _ => Some(Value::Float(left.as_float()? * right.as_float()?)),
        },
        BinOp::Div => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a.checked_div(*b).map(Value::Int),
            _ => {
                let divisor = right.as_float()?;
                (divisor != 0.0).then(|| left.as_float().map(|x| Value::Float(x / divisor)))?
            }
        },
        BinOp::Mod => match (left, right) {
            (Value::Int(a), Value::Int(b)) => a.checked_rem(*b).map(Value::Int),
            _ => {
                let divisor = right.as_float()?;
                (divisor != 0.0).then(|| left.as_float().map(|x| Value::Float(x % divisor)))?
            }
        },
        BinOp::Eq => Some(Value::Bool(left.loose_eq(right))),
        BinOp::NotEq => Some(Value::Bool(!left.loose_eq(right))),
        BinOp::Lt => left.compare(right).map(|o| Value::Bool(o == Ordering::Less)),
        BinOp::Le => left.compare(right).map(|o| Value::Bool(o != Ordering::Greater)),
        BinOp::Gt => left.compare(right).map(|o| Value::Bool(o == Ordering::Greater)),
        BinOp::Ge => left.compare(right).map(|o| Value::Bool(o != Ordering::Less)),
        BinOp::StartsWith => match (left, right) {
            (Value::Str(s), Value::Str(prefix)) => Some(Value::Bool(s.starts_with(prefix.as_str()))),
            _ => None,
        },
        BinOp::And | BinOp::Or => None,
    }
}

// =============================================================================
// Enumeration methods
// =============================================================================

fn apply_lambda(lambda: &LambdaNode, ctx: &EvalContext<'_>, element: &Value, index: usize) -> Value {
    let scope = Scope {
        depth: lambda.depth,
        element,
        index,
        parent: ctx.scope,
    };
    evaluate(&lambda.body, &ctx.bind(&scope))
}

/// Evaluate an enumeration method. One dispatch point for every method.
fn evaluate_enum(node: &EnumNode, ctx: &EvalContext<'_>) -> Value {
    let Value::Array(items) = evaluate(&node.target, ctx) else {
        return Value::Null;
    };
    let lambda = node.lambda.as_ref();
    let matches = |item: &Value, i: usize| match lambda {
        Some(l) => is_true(&apply_lambda(l, ctx, item, i)),
        None => true,
    };

    match node.method {
        EnumMethod::Except | EnumMethod::Intersect | EnumMethod::Union => {
            let other = node
                .operand
                .as_ref()
                .map(|n| evaluate(n, ctx))
                .unwrap_or(Value::Null);
            let other = other.as_array();
            let result = match node.method {
                EnumMethod::Except => enumeration::except(Some(&items), other),
                EnumMethod::Intersect => enumeration::intersect(Some(&items), other),
                _ => enumeration::union(Some(&items), other),
            };
            result.map(Value::Array).unwrap_or(Value::Null)
        }
        EnumMethod::Where => Value::Array(
            items
                .iter()
                .enumerate()
                .filter(|(i, item)| matches(item, *i))
                .map(|(_, item)| item.clone())
                .collect(),
        ),
        EnumMethod::Select => match lambda {
            Some(l) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| apply_lambda(l, ctx, item, i))
                    .collect(),
            ),
            None => Value::Array(items),
        },
        EnumMethod::OrderBy | EnumMethod::OrderByDesc => {
            let descending = node.method == EnumMethod::OrderByDesc;
            let sorted = match lambda {
                Some(l) => {
                    let keys: Vec<Value> = items
                        .iter()
                        .enumerate()
                        .map(|(i, item)| apply_lambda(l, ctx, item, i))
                        .collect();
                    enumeration::order_by(&items, &keys, descending)
                }
                None => enumeration::order_by_natural(&items, descending),
            };
            Value::Array(sorted)
        }
        EnumMethod::CountOf => {
            let n = items
                .iter()
                .enumerate()
                .filter(|(i, item)| matches(item, *i))
                .count();
            Value::Int(n as i64)
        }
        EnumMethod::SumOf => match lambda {
            Some(l) => {
                let values: Vec<Value> = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| apply_lambda(l, ctx, item, i))
                    .collect();
                enumeration::sum_values(&values)
            }
            None => enumeration::sum_values(&items),
        },
        EnumMethod::Take | EnumMethod::TakeLast => {
            let n = node
                .operand
                .as_ref()
                .map(|n| evaluate(n, ctx))
                .and_then(|v| v.as_int());
            match n {
                Some(n) if node.method == EnumMethod::Take => Value::Array(enumeration::take(&items, n)),
                Some(n) => Value::Array(enumeration::take_last(&items, n)),
                None => Value::Null,
            }
        }
        EnumMethod::FirstOf => items
            .iter()
            .enumerate()
            .find(|(i, item)| matches(item, *i))
            .map(|(_, item)| item.clone())
            .unwrap_or(Value::Null),
        EnumMethod::LastOf => items
            .iter()
            .enumerate()
            .rev()
            .find(|(i, item)| matches(item, *i))
            .map(|(_, item)| item.clone())
            .unwrap_or(Value::Null),
        EnumMethod::AnyOf => Value::Bool(
            items
                .iter()
                .enumerate()
                .any(|(i, item)| matches(item, i)),
        ),
        EnumMethod::AllOf => Value::Bool(
            items
                .iter()
                .enumerate()
                .all(|(i, item)| matches(item, i)),
        ),
    }
}
