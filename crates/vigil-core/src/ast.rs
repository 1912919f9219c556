//! Typed statement and expression trees
//!
//! This is the construction contract of the engine: statement text is
//! parsed elsewhere, and the engine receives these trees. Names are resolved
//! and types checked when a statement is compiled, never per event.
//!
//! ```text
//! select contained.where(x => x.p00 > 1).countOf() as c0 from Bean
//! ```
//!
//! is built as
//!
//! ```
//! use vigil_core::ast::*;
//!
//! let c0 = Expr::ident("contained")
//!     .call(
//!         EnumMethod::Where,
//!         vec![Expr::lambda(["x"], Expr::ident("x").member("p00").gt(Expr::lit(1)))],
//!     )
//!     .call(EnumMethod::CountOf, vec![]);
//! let stmt = SelectDef::from_stream(StreamSpec::new("Bean")).select(c0, "c0");
//! assert_eq!(stmt.items.len(), 1);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::types::Type;
use crate::value::Value;

// ============================================================================
// Expressions
// ============================================================================

/// Expression node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    /// Property, stream alias or lambda parameter
    Ident(String),
    Member {
        expr: Box<Expr>,
        member: String,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
    /// First non-null operand
    Coalesce(Vec<Expr>),
    /// Enumeration method applied to a collection: `target.method(args)`
    EnumCall {
        target: Box<Expr>,
        method: EnumMethod,
        args: Vec<Expr>,
    },
    /// Lambda argument of an enumeration method: `x => body`, `(x, i) => body`
    Lambda {
        params: Vec<String>,
        body: Box<Expr>,
    },
    /// Aggregation function; `arg: None` means `*`
    Aggregate {
        func: AggFunc,
        arg: Option<Box<Expr>>,
    },
    /// Table read: `table[k1, k2].column`, or `table.column` for unkeyed tables
    TableAccess {
        table: String,
        keys: Vec<Expr>,
        column: Option<String>,
    },
}

impl Expr {
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn null() -> Self {
        Expr::Literal(Value::Null)
    }

    pub fn ident(name: impl Into<String>) -> Self {
        Expr::Ident(name.into())
    }

    pub fn member(self, member: impl Into<String>) -> Self {
        Expr::Member {
            expr: Box::new(self),
            member: member.into(),
        }
    }

    pub fn call(self, method: EnumMethod, args: Vec<Expr>) -> Self {
        Expr::EnumCall {
            target: Box::new(self),
            method,
            args,
        }
    }

    pub fn lambda<I, S>(params: I, body: Expr) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Expr::Lambda {
            params: params.into_iter().map(Into::into).collect(),
            body: Box::new(body),
        }
    }

    pub fn binary(op: BinOp, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn unary(op: UnaryOp, expr: Expr) -> Self {
        Expr::Unary {
            op,
            expr: Box::new(expr),
        }
    }

    pub fn equals(self, other: Expr) -> Self {
        Expr::binary(BinOp::Eq, self, other)
    }

    pub fn not_equals(self, other: Expr) -> Self {
        Expr::binary(BinOp::NotEq, self, other)
    }

    pub fn lt(self, other: Expr) -> Self {
        Expr::binary(BinOp::Lt, self, other)
    }

    pub fn le(self, other: Expr) -> Self {
        Expr::binary(BinOp::Le, self, other)
    }

    pub fn gt(self, other: Expr) -> Self {
        Expr::binary(BinOp::Gt, self, other)
    }

    pub fn ge(self, other: Expr) -> Self {
        Expr::binary(BinOp::Ge, self, other)
    }

    pub fn and(self, other: Expr) -> Self {
        Expr::binary(BinOp::And, self, other)
    }

    pub fn or(self, other: Expr) -> Self {
        Expr::binary(BinOp::Or, self, other)
    }

    pub fn add(self, other: Expr) -> Self {
        Expr::binary(BinOp::Add, self, other)
    }

    pub fn sub(self, other: Expr) -> Self {
        Expr::binary(BinOp::Sub, self, other)
    }

    pub fn mul(self, other: Expr) -> Self {
        Expr::binary(BinOp::Mul, self, other)
    }

    pub fn starts_with(self, prefix: Expr) -> Self {
        Expr::binary(BinOp::StartsWith, self, prefix)
    }

    pub fn count_star() -> Self {
        Expr::Aggregate {
            func: AggFunc::Count,
            arg: None,
        }
    }

    pub fn count(arg: Expr) -> Self {
        Expr::aggregate(AggFunc::Count, arg)
    }

    pub fn sum(arg: Expr) -> Self {
        Expr::aggregate(AggFunc::Sum, arg)
    }

    pub fn avg(arg: Expr) -> Self {
        Expr::aggregate(AggFunc::Avg, arg)
    }

    pub fn window_star() -> Self {
        Expr::Aggregate {
            func: AggFunc::Window,
            arg: None,
        }
    }

    pub fn aggregate(func: AggFunc, arg: Expr) -> Self {
        Expr::Aggregate {
            func,
            arg: Some(Box::new(arg)),
        }
    }

    /// `table[keys].column`; an empty `keys` addresses the single row of an
    /// unkeyed table
    pub fn table_column(
        table: impl Into<String>,
        keys: Vec<Expr>,
        column: impl Into<String>,
    ) -> Self {
        Expr::TableAccess {
            table: table.into(),
            keys,
            column: Some(column.into()),
        }
    }

    /// `table[keys]`, the whole row as a record
    pub fn table_row(table: impl Into<String>, keys: Vec<Expr>) -> Self {
        Expr::TableAccess {
            table: table.into(),
            keys,
            column: None,
        }
    }

    /// Whether the tree contains an aggregation function outside of lambdas.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Expr::Aggregate { .. } => true,
            Expr::Literal(_) | Expr::Ident(_) | Expr::Lambda { .. } => false,
            Expr::Array(items) | Expr::Coalesce(items) => {
                items.iter().any(Expr::contains_aggregate)
            }
            Expr::Member { expr, .. } | Expr::Unary { expr, .. } => expr.contains_aggregate(),
            Expr::Binary { left, right, .. } => {
                left.contains_aggregate() || right.contains_aggregate()
            }
            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => {
                cond.contains_aggregate()
                    || then_branch.contains_aggregate()
                    || else_branch.contains_aggregate()
            }
            Expr::EnumCall { target, args, .. } => {
                target.contains_aggregate() || args.iter().any(Expr::contains_aggregate)
            }
            Expr::TableAccess { keys, .. } => keys.iter().any(Expr::contains_aggregate),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Array(items) => {
                write!(f, "{{")?;
                write_list(f, items)?;
                write!(f, "}}")
            }
            Expr::Ident(name) => write!(f, "{}", name),
            Expr::Member { expr, member } => write!(f, "{}.{}", expr, member),
            Expr::Binary { op, left, right } => {
                write_operand(f, left)?;
                write!(f, " {} ", op)?;
                write_operand(f, right)
            }
            Expr::Unary { op, expr } => match op {
                UnaryOp::Not => write!(f, "not {}", expr),
                UnaryOp::Neg => write!(f, "-{}", expr),
            },
            Expr::If {
                cond,
                then_branch,
                else_branch,
            } => write!(
                f,
                "case when {} then {} else {} end",
                cond, then_branch, else_branch
            ),
            Expr::Coalesce(items) => {
                write!(f, "coalesce(")?;
                write_list(f, items)?;
                write!(f, ")")
            }
            Expr::EnumCall {
                target,
                method,
                args,
            } => {
                write!(f, "{}.{}(", target, method)?;
                write_list(f, args)?;
                write!(f, ")")
            }
            Expr::Lambda { params, body } => {
                if params.len() == 1 {
                    write!(f, "{} => {}", params[0], body)
                } else {
                    write!(f, "({}) => {}", params.join(", "), body)
                }
            }
            Expr::Aggregate { func, arg } => match arg {
                Some(arg) => write!(f, "{}({})", func, arg),
                None => write!(f, "{}(*)", func),
            },
            Expr::TableAccess {
                table,
                keys,
                column,
            } => {
                write!(f, "{}", table)?;
                if !keys.is_empty() {
                    write!(f, "[")?;
                    write_list(f, keys)?;
                    write!(f, "]")?;
                }
                match column {
                    Some(c) => write!(f, ".{}", c),
                    None => Ok(()),
                }
            }
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
    match expr {
        Expr::Binary { .. } => write!(f, "({})", expr),
        _ => write!(f, "{}", expr),
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    // Comparison
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,

    // Logical
    And,
    Or,

    // String
    StartsWith,
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Eq => "=",
            BinOp::NotEq => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::StartsWith => "starts with",
        }
    }

    pub fn is_arithmetic(&self) -> bool {
        matches!(
            self,
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod
        )
    }

    pub fn is_ordering(&self) -> bool {
        matches!(self, BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge)
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinOp::And | BinOp::Or)
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Enumeration methods applicable to collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnumMethod {
    Except,
    Intersect,
    Union,
    OrderBy,
    OrderByDesc,
    Where,
    Select,
    CountOf,
    SumOf,
    Take,
    TakeLast,
    FirstOf,
    LastOf,
    AnyOf,
    AllOf,
}

impl EnumMethod {
    pub const ALL: [EnumMethod; 15] = [
        EnumMethod::Except,
        EnumMethod::Intersect,
        EnumMethod::Union,
        EnumMethod::OrderBy,
        EnumMethod::OrderByDesc,
        EnumMethod::Where,
        EnumMethod::Select,
        EnumMethod::CountOf,
        EnumMethod::SumOf,
        EnumMethod::Take,
        EnumMethod::TakeLast,
        EnumMethod::FirstOf,
        EnumMethod::LastOf,
        EnumMethod::AnyOf,
        EnumMethod::AllOf,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            EnumMethod::Except => "except",
            EnumMethod::Intersect => "intersect",
            EnumMethod::Union => "union",
            EnumMethod::OrderBy => "orderBy",
            EnumMethod::OrderByDesc => "orderByDesc",
            EnumMethod::Where => "where",
            EnumMethod::Select => "select",
            EnumMethod::CountOf => "countOf",
            EnumMethod::SumOf => "sumOf",
            EnumMethod::Take => "take",
            EnumMethod::TakeLast => "takeLast",
            EnumMethod::FirstOf => "firstOf",
            EnumMethod::LastOf => "lastOf",
            EnumMethod::AnyOf => "anyOf",
            EnumMethod::AllOf => "allOf",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(name))
    }

    /// Set operators taking a second collection as their only argument
    pub fn is_set_operation(&self) -> bool {
        matches!(
            self,
            EnumMethod::Except | EnumMethod::Intersect | EnumMethod::Union
        )
    }
}

impl fmt::Display for EnumMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Aggregation functions usable in select clauses and as table columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Sum,
    Avg,
    /// Retained events of the window: `window(*)`
    Window,
}

impl AggFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Window => "window",
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Streams and windows
// ============================================================================

/// Retention policy of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WindowSpec {
    /// Last `n` events
    Length(usize),
    /// Events whose timestamp lies within the duration of the newest one
    Time(Duration),
    /// Every event, never evicted
    KeepAll,
}

impl WindowSpec {
    /// `#lastevent`
    pub fn last_event() -> Self {
        WindowSpec::Length(1)
    }
}

/// A stream consumed by a statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub event_type: String,
    pub alias: Option<String>,
    /// Applied before an event enters the window
    pub filter: Option<Expr>,
    pub window: Option<WindowSpec>,
}

impl StreamSpec {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            alias: None,
            filter: None,
            window: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn filter(mut self, filter: Expr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn window(mut self, window: WindowSpec) -> Self {
        self.window = Some(window);
        self
    }

    /// Name the stream is referenced by in expressions.
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.event_type)
    }
}

// ============================================================================
// Statements
// ============================================================================

/// One column of a select clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectItem {
    /// `*`
    Wildcard,
    Expr { expr: Expr, alias: Option<String> },
}

/// `select ... from A[, B] [where ...] [group by ...]`, optionally run as
/// one instance per partition of `partition_by`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectDef {
    pub streams: Vec<StreamSpec>,
    pub items: Vec<SelectItem>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub partition_by: Vec<String>,
}

impl SelectDef {
    pub fn from_stream(stream: StreamSpec) -> Self {
        Self {
            streams: vec![stream],
            items: Vec::new(),
            where_clause: None,
            group_by: Vec::new(),
            partition_by: Vec::new(),
        }
    }

    pub fn join(mut self, stream: StreamSpec) -> Self {
        self.streams.push(stream);
        self
    }

    pub fn select(mut self, expr: Expr, alias: impl Into<String>) -> Self {
        self.items.push(SelectItem::Expr {
            expr,
            alias: Some(alias.into()),
        });
        self
    }

    pub fn select_unnamed(mut self, expr: Expr) -> Self {
        self.items.push(SelectItem::Expr { expr, alias: None });
        self
    }

    pub fn select_all(mut self) -> Self {
        self.items.push(SelectItem::Wildcard);
        self
    }

    pub fn where_clause(mut self, cond: Expr) -> Self {
        self.where_clause = Some(cond);
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn partition_by(mut self, field: impl Into<String>) -> Self {
        self.partition_by.push(field.into());
        self
    }
}

/// `into table t select agg(...) as col ... from A group by ...`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntoTableDef {
    pub table: String,
    pub stream: StreamSpec,
    pub where_clause: Option<Expr>,
    /// One expression per primary-key column of the table, in key order
    pub group_by: Vec<Expr>,
    /// Target aggregation column and the aggregation feeding it
    pub columns: Vec<(String, Expr)>,
}

impl IntoTableDef {
    pub fn new(table: impl Into<String>, stream: StreamSpec) -> Self {
        Self {
            table: table.into(),
            stream,
            where_clause: None,
            group_by: Vec::new(),
            columns: Vec::new(),
        }
    }

    pub fn aggregate(mut self, column: impl Into<String>, aggregate: Expr) -> Self {
        self.columns.push((column.into(), aggregate));
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn where_clause(mut self, cond: Expr) -> Self {
        self.where_clause = Some(cond);
        self
    }
}

/// How a merge trigger finds its rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergeMatch {
    /// Primary-key equality with these trigger expressions, in key order
    Key(Vec<Expr>),
    /// Join condition evaluated per row; may match zero, one or many rows
    Where(Expr),
    /// Every row (the single row of an unkeyed table)
    All,
}

/// Action of a merge clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MergeAction {
    /// Insert a row; only in `when not matched` clauses
    Insert(Vec<(String, Expr)>),
    /// Assign non-key plain columns; only in `when matched` clauses
    Update(Vec<(String, Expr)>),
    /// Remove the matched row; only in `when matched` clauses
    Delete,
    /// Emit a derived event into the current processing tick
    InsertInto {
        event_type: String,
        columns: Vec<(String, Expr)>,
    },
}

/// `when [not] matched [and condition] then actions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeClause {
    pub matched: bool,
    pub condition: Option<Expr>,
    pub actions: Vec<MergeAction>,
}

impl MergeClause {
    pub fn matched() -> Self {
        Self {
            matched: true,
            condition: None,
            actions: Vec::new(),
        }
    }

    pub fn not_matched() -> Self {
        Self {
            matched: false,
            condition: None,
            actions: Vec::new(),
        }
    }

    pub fn when(mut self, condition: Expr) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn then(mut self, action: MergeAction) -> Self {
        self.actions.push(action);
        self
    }
}

/// `on A merge t [where ...] when ... then ...`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeDef {
    pub table: String,
    pub trigger: StreamSpec,
    pub matching: MergeMatch,
    pub clauses: Vec<MergeClause>,
}

impl MergeDef {
    pub fn new(table: impl Into<String>, trigger: StreamSpec, matching: MergeMatch) -> Self {
        Self {
            table: table.into(),
            trigger,
            matching,
            clauses: Vec::new(),
        }
    }

    pub fn clause(mut self, clause: MergeClause) -> Self {
        self.clauses.push(clause);
        self
    }
}

/// A compiled continuous query definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatementDef {
    Select(SelectDef),
    IntoTable(IntoTableDef),
    Merge(MergeDef),
}

impl From<SelectDef> for StatementDef {
    fn from(def: SelectDef) -> Self {
        StatementDef::Select(def)
    }
}

impl From<IntoTableDef> for StatementDef {
    fn from(def: IntoTableDef) -> Self {
        StatementDef::IntoTable(def)
    }
}

impl From<MergeDef> for StatementDef {
    fn from(def: MergeDef) -> Self {
        StatementDef::Merge(def)
    }
}

// ============================================================================
// Tables
// ============================================================================

/// Column content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnKind {
    Plain(Type),
    /// Aggregation state; `arg_type` is the aggregated value type, or the
    /// event type for `window(*)`
    Aggregate { func: AggFunc, arg_type: Type },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnKind,
    pub primary_key: bool,
}

/// `create table name (...)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    pub name: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    pub fn key(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            kind: ColumnKind::Plain(ty),
            primary_key: true,
        });
        self
    }

    pub fn column(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            kind: ColumnKind::Plain(ty),
            primary_key: false,
        });
        self
    }

    pub fn aggregate(mut self, name: impl Into<String>, func: AggFunc, arg_type: Type) -> Self {
        self.columns.push(ColumnDef {
            name: name.into(),
            kind: ColumnKind::Aggregate { func, arg_type },
            primary_key: false,
        });
        self
    }
}
