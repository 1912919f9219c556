//! Static type resolution of expressions
//!
//! The compiler runs once per statement. It resolves every identifier to a
//! stream, a stream property or a lambda parameter, checks operand types and
//! enumeration-method arguments, and collects aggregation functions into
//! numbered slots. Whatever it rejects is reported as a [`ValidationError`]
//! quoting the offending sub-expression; whatever it accepts evaluates
//! without further type checks.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use vigil_core::{
    AggFunc, BinOp, EnumMethod, EventType, Expr, SchemaRegistry, Type, UnaryOp,
    ValidationError, ValidationResult, Value,
};

use super::{CompiledExpr, EnumNode, LambdaNode, Node, TableRead};
use crate::aggregation::AggregatorSpec;
use crate::table::NamedTable;

/// An input stream visible to expressions, by stream number
#[derive(Debug, Clone)]
pub struct StreamBinding {
    /// Alias, or the event type name when no alias is given
    pub name: String,
    pub event_type: Arc<EventType>,
}

/// An aggregation function found in a statement
#[derive(Debug, Clone)]
pub struct AggregateSlot {
    pub spec: AggregatorSpec,
    /// Per-event input; `None` for `count(*)`
    pub arg: Option<Node>,
    expr: Expr,
}

#[derive(Debug)]
struct LambdaParam {
    name: String,
    depth: usize,
    slot: usize,
    ty: Type,
}

pub struct Compiler<'a> {
    streams: &'a [StreamBinding],
    schemas: &'a SchemaRegistry,
    tables: Option<&'a FxHashMap<String, Arc<NamedTable>>>,
    aggregates: Option<Vec<AggregateSlot>>,
    params: Vec<LambdaParam>,
    depth: usize,
    in_aggregate: bool,
}

impl<'a> Compiler<'a> {
    /// A compiler that rejects aggregations and table reads until enabled.
    pub fn new(streams: &'a [StreamBinding], schemas: &'a SchemaRegistry) -> Self {
        Self {
            streams,
            schemas,
            tables: None,
            aggregates: None,
            params: Vec::new(),
            depth: 0,
            in_aggregate: false,
        }
    }

    pub fn with_tables(mut self, tables: &'a FxHashMap<String, Arc<NamedTable>>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn with_aggregation(mut self) -> Self {
        self.aggregates = Some(Vec::new());
        self
    }

    /// Stop accepting aggregation functions, e.g. for a `where` clause.
    pub fn suspend_aggregation(&mut self) -> Option<Vec<AggregateSlot>> {
        self.aggregates.take()
    }

    pub fn resume_aggregation(&mut self, slots: Option<Vec<AggregateSlot>>) {
        self.aggregates = slots;
    }

    pub fn has_aggregates(&self) -> bool {
        self.aggregates.as_ref().is_some_and(|a| !a.is_empty())
    }

    pub fn into_aggregates(self) -> Vec<AggregateSlot> {
        self.aggregates.unwrap_or_default()
    }

    pub fn compile(&mut self, expr: &Expr) -> ValidationResult<CompiledExpr> {
        let (node, ty) = self.compile_expr(expr)?;
        Ok(CompiledExpr { node, ty })
    }

    /// Compile an expression used as a filter; it must yield a boolean.
    pub fn compile_condition(&mut self, expr: &Expr) -> ValidationResult<Node> {
        let (node, ty) = self.compile_expr(expr)?;
        if !is_boolean(&ty) {
            return Err(ValidationError::mismatch(expr, "a boolean", ty));
        }
        Ok(node)
    }

    fn compile_expr(&mut self, expr: &Expr) -> ValidationResult<(Node, Type)> {
        match expr {
            Expr::Literal(v) => Ok((Node::Const(v.clone()), literal_type(v))),
            Expr::Array(items) => {
                let mut nodes = Vec::with_capacity(items.len());
                let mut types = Vec::with_capacity(items.len());
                for item in items {
                    let (n, t) = self.compile_expr(item)?;
                    nodes.push(n);
                    types.push(t);
                }
                Ok((Node::Array(nodes), Type::array_of(unify(&types))))
            }
            Expr::Ident(name) => self.resolve_ident(expr, name),
            Expr::Member { expr: target, member } => self.compile_member(expr, target, member),
            Expr::Binary { op, left, right } => self.compile_binary(expr, *op, left, right),
            Expr::Unary { op, expr: operand } => {
                let (node, ty) = self.compile_expr(operand)?;
                let result = match op {
                    UnaryOp::Not if is_boolean(&ty) => Type::Bool,
                    UnaryOp::Not => return Err(ValidationError::mismatch(expr, "a boolean", ty)),
                    UnaryOp::Neg if ty.is_numeric() => ty,
                    UnaryOp::Neg if ty.is_dynamic() || ty == Type::Null => Type::Any,
                    UnaryOp::Neg => return Err(ValidationError::mismatch(expr, "a numeric type", ty)),
                };
                Ok((
                    Node::Unary {
                        op: *op,
                        operand: Box::new(node),
                    },
                    result,
                ))
            }
            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.compile_condition(cond)?;
                let (then_node, then_ty) = self.compile_expr(then_branch)?;
                let (else_node, else_ty) = self.compile_expr(else_branch)?;
                Ok((
                    Node::If {
                        cond: Box::new(cond),
                        then_branch: Box::new(then_node),
                        else_branch: Box::new(else_node),
                    },
                    unify(&[then_ty, else_ty]),
                ))
            }
            Expr::Coalesce(items) => {
                let mut nodes = Vec::with_capacity(items.len());
                let mut types = Vec::with_capacity(items.len());
                for item in items {
                    let (n, t) = self.compile_expr(item)?;
                    nodes.push(n);
                    types.push(t);
                }
                Ok((Node::Coalesce(nodes), unify(&types)))
            }
            Expr::EnumCall {
                target,
                method,
                args,
            } => self.compile_enum(expr, target, *method, args),
            Expr::Lambda { .. } => Err(ValidationError::invalid(format!(
                "lambda expression '{}' is only valid as an enumeration method parameter",
                expr
            ))),
            Expr::Aggregate { func, arg } => self.compile_aggregate(expr, *func, arg.as_deref()),
            Expr::TableAccess {
                table,
                keys,
                column,
            } => self.compile_table_access(expr, table, keys, column.as_deref()),
        }
    }

    // =========================================================================
    // Names
    // =========================================================================

    fn resolve_ident(&self, expr: &Expr, name: &str) -> ValidationResult<(Node, Type)> {
        if let Some(param) = self.params.iter().rev().find(|p| p.name == name) {
            return Ok((
                Node::Binding {
                    depth: param.depth,
                    slot: param.slot,
                },
                param.ty.clone(),
            ));
        }
        if let Some(stream) = self.stream_index(name) {
            let ty = Type::Named(self.streams[stream].event_type.name().to_string());
            return Ok((Node::Stream(stream), ty));
        }

        let mut found = self
            .streams
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.event_type.field_type(name).map(|ty| (i, ty)));
        match (found.next(), found.next()) {
            (Some((stream, ty)), None) => Ok((
                Node::Property {
                    stream,
                    field: name.to_string(),
                },
                ty.clone(),
            )),
            (Some(_), Some(_)) => Err(ValidationError::AmbiguousProperty {
                expr: expr.to_string(),
                property: name.to_string(),
            }),
            (None, _) => Err(ValidationError::UnknownProperty {
                expr: expr.to_string(),
                property: name.to_string(),
            }),
        }
    }

    fn stream_index(&self, name: &str) -> Option<usize> {
        self.streams
            .iter()
            .position(|s| s.name == name)
            .or_else(|| self.streams.iter().position(|s| s.event_type.name() == name))
    }

    /// Field type of an event type known to this statement: an input stream
    /// type, a registered type, or a table row type.
    fn named_field_type(&self, event_type: &str, field: &str) -> Option<Type> {
        if let Some(s) = self.streams.iter().find(|s| s.event_type.name() == event_type) {
            return s.event_type.field_type(field).cloned();
        }
        if let Some(t) = self.schemas.get(event_type) {
            return t.field_type(field).cloned();
        }
        self.tables
            .and_then(|tables| tables.get(event_type))
            .and_then(|t| t.row_type().field_type(field).cloned())
    }

    fn compile_member(
        &mut self,
        expr: &Expr,
        target: &Expr,
        member: &str,
    ) -> ValidationResult<(Node, Type)> {
        let (target_node, target_ty) = self.compile_expr(target)?;
        let unknown = || ValidationError::UnknownProperty {
            expr: expr.to_string(),
            property: member.to_string(),
        };

        match (&target_node, &target_ty) {
            (Node::Stream(stream), _) => {
                let ty = self.streams[*stream]
                    .event_type
                    .field_type(member)
                    .cloned()
                    .ok_or_else(unknown)?;
                Ok((
                    Node::Property {
                        stream: *stream,
                        field: member.to_string(),
                    },
                    ty,
                ))
            }
            (_, Type::Named(event_type)) => {
                let ty = self.named_field_type(event_type, member).ok_or_else(unknown)?;
                Ok((member_node(target_node, member), ty))
            }
            (_, Type::Map | Type::Any | Type::Unknown | Type::Null) => {
                Ok((member_node(target_node, member), Type::Any))
            }
            (_, other) => Err(ValidationError::mismatch(
                target,
                format!("an event or map to read property '{}'", member),
                other.clone(),
            )),
        }
    }

    // =========================================================================
    // Operators
    // =========================================================================

    fn compile_binary(
        &mut self,
        expr: &Expr,
        op: BinOp,
        left: &Expr,
        right: &Expr,
    ) -> ValidationResult<(Node, Type)> {
        let (l, lt) = self.compile_expr(left)?;
        let (r, rt) = self.compile_expr(right)?;
        let open = |t: &Type| t.is_dynamic() || *t == Type::Null;

        let ty = match op {
            BinOp::Add if lt == Type::Str && rt == Type::Str => Type::Str,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
                for (operand, t) in [(left, &lt), (right, &rt)] {
                    if !t.is_numeric() && !open(t) {
                        return Err(ValidationError::mismatch(operand, "a numeric type", t.clone()));
                    }
                }
                lt.numeric_result(&rt)
            }
            BinOp::Eq | BinOp::NotEq => {
                let compatible = open(&lt)
                    || open(&rt)
                    || (lt.is_numeric() && rt.is_numeric())
                    || lt.accepts(&rt)
                    || rt.accepts(&lt);
                if !compatible {
                    return Err(ValidationError::mismatch(expr, format!("{} on both sides", lt), rt));
                }
                Type::Bool
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                for (operand, t) in [(left, &lt), (right, &rt)] {
                    if !t.is_comparable() {
                        return Err(ValidationError::mismatch(operand, "a comparable type", t.clone()));
                    }
                }
                let compatible = open(&lt) || open(&rt) || lt == rt || (lt.is_numeric() && rt.is_numeric());
                if !compatible {
                    return Err(ValidationError::mismatch(expr, format!("{} on both sides", lt), rt));
                }
                Type::Bool
            }
            BinOp::And | BinOp::Or => {
                for (operand, t) in [(left, &lt), (right, &rt)] {
                    if !is_boolean(t) {
                        return Err(ValidationError::mismatch(operand, "a boolean", t.clone()));
                    }
                }
                Type::Bool
            }
            BinOp::StartsWith => {
                for (operand, t) in [(left, &lt), (right, &rt)] {
                    if *t != Type::Str && !open(t) {
                        return Err(ValidationError::mismatch(operand, "a string", t.clone()));
                    }
                }
                Type::Bool
            }
        };

        Ok((
            Node::Binary {
                op,
                left: Box::new(l),
                right: Box::new(r),
            },
            ty,
        ))
    }

    // =========================================================================
    // Enumeration methods
    // =========================================================================

    fn compile_enum(
        &mut self,
        expr: &Expr,
        target: &Expr,
        method: EnumMethod,
        args: &[Expr],
    ) -> ValidationResult<(Node, Type)> {
        let fail = |message: String| ValidationError::enum_argument(expr, method.name(), message);

        let (target_node, target_ty) = self.compile_expr(target)?;
        let element_ty = match &target_ty {
            Type::Array(inner) => inner.as_ref().clone(),
            t if t.is_dynamic() || *t == Type::Null => Type::Any,
            other => return Err(fail(format!("requires a collection input but receives {}", other))),
        };

        let (lambdas, plain): (Vec<&Expr>, Vec<&Expr>) =
            args.iter().partition(|a| matches!(a, Expr::Lambda { .. }));
        let max_args = match method {
            EnumMethod::Except
            | EnumMethod::Intersect
            | EnumMethod::Union
            | EnumMethod::Take
            | EnumMethod::TakeLast => (0, 1),
            _ => (1, 0),
        };
        if lambdas.len() > max_args.0 || plain.len() > max_args.1 {
            return Err(fail(format!(
                "received {} parameters but expects {}",
                args.len(),
                match max_args {
                    (0, _) => "exactly one non-lambda parameter",
                    _ => "at most one lambda parameter",
                }
            )));
        }

        let lambda = match lambdas.first() {
            Some(Expr::Lambda { params, body }) => {
                Some(self.compile_lambda(&fail, params, body, &element_ty)?)
            }
            _ => None,
        };

        let mut operand = None;
        let ty = match method {
            EnumMethod::Except | EnumMethod::Intersect | EnumMethod::Union => {
                let Some(arg) = plain.first() else {
                    return Err(fail("requires a collection input parameter".into()));
                };
                let (node, arg_ty) = self.compile_expr(arg)?;
                self.check_set_operand(&fail, &target_ty, &arg_ty)?;
                operand = Some(node);
                target_ty.clone()
            }
            EnumMethod::Take | EnumMethod::TakeLast => {
                let Some(arg) = plain.first() else {
                    return Err(fail("requires a numeric count parameter".into()));
                };
                let (node, arg_ty) = self.compile_expr(arg)?;
                if arg_ty != Type::Int && !arg_ty.is_dynamic() {
                    return Err(fail(format!("requires an int count parameter but receives {}", arg_ty)));
                }
                operand = Some(node);
                target_ty.clone()
            }
            EnumMethod::Where | EnumMethod::AnyOf | EnumMethod::AllOf => {
                let Some((_, body_ty)) = &lambda else {
                    return Err(fail("requires a lambda expression parameter".into()));
                };
                if !is_boolean(body_ty) {
                    return Err(fail(format!(
                        "requires a lambda expression yielding a boolean value but receives {}",
                        body_ty
                    )));
                }
                if method == EnumMethod::Where {
                    target_ty.clone()
                } else {
                    Type::Bool
                }
            }
            EnumMethod::CountOf | EnumMethod::FirstOf | EnumMethod::LastOf => {
                if let Some((_, body_ty)) = &lambda {
                    if !is_boolean(body_ty) {
                        return Err(fail(format!(
                            "requires a lambda expression yielding a boolean value but receives {}",
                            body_ty
                        )));
                    }
                }
                match method {
                    EnumMethod::CountOf => Type::Int,
                    _ => element_ty.clone(),
                }
            }
            EnumMethod::Select => {
                let Some((_, body_ty)) = &lambda else {
                    return Err(fail("requires a lambda expression parameter".into()));
                };
                Type::array_of(body_ty.clone())
            }
            EnumMethod::OrderBy | EnumMethod::OrderByDesc => {
                let key_ty = lambda.as_ref().map(|(_, t)| t).unwrap_or(&element_ty);
                if !key_ty.is_comparable() {
                    return Err(match lambda {
                        Some(_) => fail(format!(
                            "requires a lambda expression yielding a comparable value but receives {}",
                            key_ty
                        )),
                        None => fail(format!(
                            "requires a lambda expression when the input is a {}",
                            target_ty
                        )),
                    });
                }
                target_ty.clone()
            }
            EnumMethod::SumOf => {
                let value_ty = lambda.as_ref().map(|(_, t)| t).unwrap_or(&element_ty);
                match value_ty {
                    Type::Int | Type::Float => value_ty.clone(),
                    t if t.is_dynamic() || *t == Type::Null => Type::Any,
                    other => {
                        return Err(fail(format!(
                            "requires numeric values but receives {}",
                            other
                        )))
                    }
                }
            }
        };

        Ok((
            Node::Enum(Box::new(EnumNode {
                target: target_node,
                method,
                operand,
                lambda: lambda.map(|(l, _)| l),
            })),
            ty,
        ))
    }

    fn compile_lambda(
        &mut self,
        fail: &dyn Fn(String) -> ValidationError,
        params: &[String],
        body: &Expr,
        element_ty: &Type,
    ) -> ValidationResult<(LambdaNode, Type)> {
        if params.is_empty() || params.len() > 2 {
            return Err(fail(format!(
                "requires a lambda expression with one or two parameters but receives {}",
                params.len()
            )));
        }
        let depth = self.depth;
        let scope_start = self.params.len();
        for (slot, name) in params.iter().enumerate() {
            self.params.push(LambdaParam {
                name: name.clone(),
                depth,
                slot,
                ty: if slot == 0 { element_ty.clone() } else { Type::Int },
            });
        }
        self.depth += 1;
        let compiled = self.compile_expr(body);
        self.depth -= 1;
        self.params.truncate(scope_start);
        let (body, ty) = compiled?;
        Ok((LambdaNode { depth, body }, ty))
    }

    fn check_set_operand(
        &self,
        fail: &dyn Fn(String) -> ValidationError,
        target_ty: &Type,
        arg_ty: &Type,
    ) -> ValidationResult<()> {
        if arg_ty.is_dynamic() || *arg_ty == Type::Null {
            return Ok(());
        }
        match target_ty.event_type_name().filter(|_| target_ty.is_event_collection()) {
            Some(expected) => {
                let Some(actual) = arg_ty.event_type_name().filter(|_| arg_ty.is_event_collection())
                else {
                    return Err(fail(
                        "requires an expression yielding an event-collection as input parameter".into(),
                    ));
                };
                if !self.schemas.is_assignable(actual, expected) && actual != expected {
                    return Err(fail(format!(
                        "expects event type '{}' but receives event type '{}'",
                        expected, actual
                    )));
                }
                Ok(())
            }
            None if arg_ty.is_collection() => Ok(()),
            None => Err(fail(
                "requires an expression yielding a collection of values as input parameter".into(),
            )),
        }
    }

    // =========================================================================
    // Aggregations and tables
    // =========================================================================

    fn compile_aggregate(
        &mut self,
        expr: &Expr,
        func: AggFunc,
        arg: Option<&Expr>,
    ) -> ValidationResult<(Node, Type)> {
        if self.aggregates.is_none() || self.depth > 0 || self.in_aggregate {
            return Err(ValidationError::AggregationNotAllowed {
                expr: expr.to_string(),
            });
        }

        self.in_aggregate = true;
        let compiled = arg.map(|a| self.compile_expr(a)).transpose();
        self.in_aggregate = false;
        let compiled = compiled?;

        let (spec, arg_node) = match (func, compiled) {
            (AggFunc::Count, None) => (AggregatorSpec::new(AggFunc::Count, None), None),
            (AggFunc::Count, Some((node, ty))) => (AggregatorSpec::new(AggFunc::Count, Some(ty)), Some(node)),
            (AggFunc::Sum | AggFunc::Avg, None) => {
                return Err(ValidationError::invalid(format!(
                    "{}(*) requires an expression parameter",
                    func.name()
                )))
            }
            (AggFunc::Sum | AggFunc::Avg, Some((node, ty))) => {
                if !ty.is_numeric() && !ty.is_dynamic() {
                    return Err(ValidationError::mismatch(expr, "a numeric type", ty));
                }
                (AggregatorSpec::new(func, Some(ty)), Some(node))
            }
            (AggFunc::Window, None) => {
                let stream = self
                    .streams
                    .first()
                    .ok_or_else(|| ValidationError::AggregationNotAllowed {
                        expr: expr.to_string(),
                    })?;
                let ty = Type::Named(stream.event_type.name().to_string());
                (AggregatorSpec::new(AggFunc::Window, Some(ty)), Some(Node::Stream(0)))
            }
            (AggFunc::Window, Some((node, ty))) => match ty {
                Type::Named(_) => (AggregatorSpec::new(AggFunc::Window, Some(ty)), Some(node)),
                other => return Err(ValidationError::mismatch(expr, "an event", other)),
            },
        };

        let ty = spec.result_type();
        let Some(slots) = self.aggregates.as_mut() else {
            return Err(ValidationError::AggregationNotAllowed {
                expr: expr.to_string(),
            });
        };
        if let Some(existing) = slots.iter().position(|s| &s.expr == expr) {
            return Ok((Node::Aggregate(existing), ty));
        }
        slots.push(AggregateSlot {
            spec,
            arg: arg_node,
            expr: expr.clone(),
        });
        Ok((Node::Aggregate(slots.len() - 1), ty))
    }

    fn compile_table_access(
        &mut self,
        expr: &Expr,
        table: &str,
        keys: &[Expr],
        column: Option<&str>,
    ) -> ValidationResult<(Node, Type)> {
        let Some(tables) = self.tables else {
            return Err(ValidationError::TableAccessNotAllowed {
                expr: expr.to_string(),
            });
        };
        let table = tables
            .get(table)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownTable(table.to_string()))?;

        let key_types = table.key_types();
        if keys.len() != key_types.len() {
            return Err(ValidationError::invalid(format!(
                "expression '{}' provides {} key expressions but table '{}' has {} primary key columns",
                expr,
                keys.len(),
                table.name(),
                key_types.len()
            )));
        }
        let mut key_nodes = Vec::with_capacity(keys.len());
        for (key, expected) in keys.iter().zip(&key_types) {
            let (node, ty) = self.compile_expr(key)?;
            if !expected.accepts(&ty) && !(expected.is_numeric() && ty.is_numeric()) {
                return Err(ValidationError::mismatch(key, expected.to_string(), ty));
            }
            key_nodes.push(node);
        }

        let (column, ty) = match column {
            Some(name) => {
                let index = table
                    .column_index(name)
                    .ok_or_else(|| ValidationError::UnknownColumn {
                        table: table.name().to_string(),
                        column: name.to_string(),
                    })?;
                (Some(index), table.column_type(index))
            }
            None => (None, Type::Named(table.name().to_string())),
        };

        Ok((
            Node::Table(Box::new(TableRead {
                table,
                keys: key_nodes,
                column,
            })),
            ty,
        ))
    }
}

fn member_node(target: Node, member: &str) -> Node {
    Node::Member {
        target: Box::new(target),
        field: member.to_string(),
    }
}

fn is_boolean(ty: &Type) -> bool {
    matches!(ty, Type::Bool | Type::Null | Type::Any | Type::Unknown)
}

fn literal_type(value: &Value) -> Type {
    match value {
        Value::Null => Type::Null,
        Value::Bool(_) => Type::Bool,
        Value::Int(_) => Type::Int,
        Value::Float(_) => Type::Float,
        Value::Str(_) => Type::Str,
        Value::Timestamp(_) => Type::Timestamp,
        Value::Array(items) => {
            let types: Vec<Type> = items.iter().map(literal_type).collect();
            Type::array_of(unify(&types))
        }
        Value::Map(_) => Type::Map,
        Value::Event(e) => Type::Named(e.event_type.to_string()),
    }
}

/// Common type of branches or collection elements.
fn unify(types: &[Type]) -> Type {
    let mut result: Option<Type> = None;
    for ty in types.iter().filter(|t| **t != Type::Null) {
        result = Some(match result {
            None => ty.clone(),
            Some(current) if current == *ty => current,
            Some(current) if current.is_numeric() && ty.is_numeric() => Type::Float,
            Some(_) => return Type::Any,
        });
    }
    result.unwrap_or(if types.is_empty() { Type::Any } else { Type::Null })
}
