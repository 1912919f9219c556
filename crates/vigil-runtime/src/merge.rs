//! Table merge (`on T merge table ...`)
//!
//! A merge statement fires once per trigger event:
//!
//! 1. Find the candidate rows: a point lookup when the primary key is known
//!    from the trigger, otherwise a scan evaluating the join condition per
//!    row (zero, one or many rows may match).
//! 2. For every matched row, run the first `when matched` clause whose
//!    condition holds. If nothing matched, run the first `when not matched`
//!    clause whose condition holds. Later clauses are skipped.
//! 3. Apply the clause's actions in order and record a delta per mutation:
//!    inserts yield a new row, updates an old and a new row, deletes an old
//!    row. Actions after a delete still run; updates of the deleted row are
//!    dropped.
//!
//! Expressions see the trigger as stream 0 and the matched row, a snapshot
//! taken before the clause runs, as stream 1. Point lookups hold the row's
//! shard lock for the whole clause; scans hold every shard lock, so readers
//! never observe a half-applied merge.

use chrono::{DateTime, Utc};
use std::sync::{Arc, RwLockWriteGuard};
use tracing::{debug, warn};
use vigil_core::{
    BinOp, Event, EventTypeDef, Expr, FxIndexMap, GroupKey, MergeAction, MergeDef, MergeMatch,
    SchemaRegistry, SharedEvent, Type, ValidationError, ValidationResult,
};

use crate::config::DuplicateKeyPolicy;
use crate::error::MergeConflict;
use crate::evaluator::{evaluate, is_true, Compiler, EvalContext, Node, StreamBinding};
use crate::shard::Shard;
use crate::table::{NamedTable, TableRow};

#[derive(Debug)]
enum RowMatch {
    /// Key expressions over the trigger, in primary-key order, plus any
    /// condition left after lifting key equalities
    Key {
        keys: Vec<Node>,
        residual: Option<Node>,
    },
    /// Condition over trigger and row; `None` matches every row
    Scan(Option<Node>),
}

#[derive(Debug)]
struct Insert {
    keys: Vec<Node>,
    columns: Vec<(usize, Node)>,
}

#[derive(Debug)]
enum Action {
    Insert(Insert),
    Update(Vec<(usize, Node)>),
    Delete,
    InsertInto {
        event_type: Arc<str>,
        columns: Vec<(String, Node)>,
    },
}

#[derive(Debug)]
struct Clause {
    matched: bool,
    condition: Option<Node>,
    actions: Vec<Action>,
}

/// Everything one trigger event caused
#[derive(Debug, Default)]
pub struct MergeEffects {
    pub new_rows: Vec<SharedEvent>,
    pub old_rows: Vec<SharedEvent>,
    /// Events emitted by `insert into` actions
    pub emitted: Vec<Event>,
    pub conflicts: Vec<MergeConflict>,
}

#[derive(Debug)]
pub struct CompiledMerge {
    statement: Arc<str>,
    table: Arc<NamedTable>,
    matching: RowMatch,
    clauses: Vec<Clause>,
    derived: Vec<EventTypeDef>,
    policy: DuplicateKeyPolicy,
}

impl CompiledMerge {
    /// `trigger` is stream 0 of the statement; the table row becomes stream 1.
    pub fn compile(
        statement: &str,
        def: &MergeDef,
        trigger: StreamBinding,
        table: Arc<NamedTable>,
        schemas: &SchemaRegistry,
        policy: DuplicateKeyPolicy,
    ) -> ValidationResult<Self> {
        let streams = [
            trigger,
            StreamBinding {
                name: table.name().to_string(),
                event_type: Arc::clone(table.row_type()),
            },
        ];

        let matching = match &def.matching {
            MergeMatch::Key(keys) => {
                let trigger_only = &streams[..1];
                let keys = compile_keys(&table, keys, trigger_only, schemas)?;
                RowMatch::Key {
                    keys,
                    residual: None,
                }
            }
            MergeMatch::Where(cond) => lift_key_equalities(&table, cond, &streams, schemas)?,
            MergeMatch::All => RowMatch::Scan(None),
        };

        let mut derived: Vec<EventTypeDef> = Vec::new();
        let mut clauses = Vec::with_capacity(def.clauses.len());
        for clause in &def.clauses {
            let mut compiler = Compiler::new(&streams, schemas);
            let condition = clause
                .condition
                .as_ref()
                .map(|c| compiler.compile_condition(c))
                .transpose()?;
            let mut actions = Vec::with_capacity(clause.actions.len());
            for action in &clause.actions {
                actions.push(compile_action(
                    &mut compiler,
                    &table,
                    clause.matched,
                    action,
                    &mut derived,
                )?);
            }
            clauses.push(Clause {
                matched: clause.matched,
                condition,
                actions,
            });
        }

        Ok(Self {
            statement: Arc::from(statement),
            table,
            matching,
            clauses,
            derived,
            policy,
        })
    }

    pub fn table(&self) -> &Arc<NamedTable> {
        &self.table
    }

    /// Event types of the `insert into` actions, to be registered implicitly.
    pub fn derived_types(&self) -> &[EventTypeDef] {
        &self.derived
    }

    pub fn execute(&self, trigger: &SharedEvent) -> MergeEffects {
        let mut fx = MergeEffects::default();
        match &self.matching {
            RowMatch::Key { keys, residual } => {
                self.execute_point(trigger, keys, residual.as_ref(), &mut fx)
            }
            RowMatch::Scan(cond) => self.execute_scan(trigger, cond.as_ref(), &mut fx),
        }
        debug!(
            statement = %self.statement,
            table = %self.table.name(),
            inserted_or_updated = fx.new_rows.len(),
            removed_or_updated = fx.old_rows.len(),
            "merge applied"
        );
        fx
    }

    fn execute_point(
        &self,
        trigger: &SharedEvent,
        keys: &[Node],
        residual: Option<&Node>,
        fx: &mut MergeEffects,
    ) {
        let trigger_only = [Some(Arc::clone(trigger)), None];
        let key = self
            .table
            .key_from(keys.iter().map(|k| evaluate(k, &EvalContext::new(&trigger_only))));

        let rows = self.table.rows();
        let shard_index = rows.shard_of(&key);
        let mut shard = rows.write_shard(shard_index);
        let mut deferred = Vec::new();

        let snapshot = shard.get(&key).map(|row| self.table.snapshot(row));
        let matched = snapshot.filter(|snapshot| {
            residual.map_or(true, |cond| {
                let streams = [Some(Arc::clone(trigger)), Some(Arc::clone(snapshot))];
                is_true(&evaluate(cond, &EvalContext::new(&streams)))
            })
        });

        match matched {
            Some(snapshot) => self.apply_matched(trigger, &key, snapshot, &mut shard, fx),
            None => {
                for (insert_key, row) in self.apply_not_matched(trigger, fx) {
                    if rows.shard_of(&insert_key) == shard_index {
                        self.insert_row(&mut shard, insert_key, row, fx);
                    } else {
                        deferred.push((insert_key, row));
                    }
                }
            }
        }
        drop(shard);

        for (insert_key, row) in deferred {
            let mut other = rows.write(&insert_key);
            self.insert_row(&mut other, insert_key, row, fx);
        }
    }

    fn execute_scan(&self, trigger: &SharedEvent, cond: Option<&Node>, fx: &mut MergeEffects) {
        let rows = self.table.rows();
        let mut shards: Vec<RwLockWriteGuard<'_, Shard<TableRow>>> = rows.write_all();

        let mut matched: Vec<(usize, GroupKey, SharedEvent)> = Vec::new();
        for (index, shard) in shards.iter().enumerate() {
            for (key, row) in shard.iter() {
                let snapshot = self.table.snapshot(row);
                let passes = cond.map_or(true, |cond| {
                    let streams = [Some(Arc::clone(trigger)), Some(Arc::clone(&snapshot))];
                    is_true(&evaluate(cond, &EvalContext::new(&streams)))
                });
                if passes {
                    matched.push((index, key.clone(), snapshot));
                }
            }
        }

        if matched.is_empty() {
            for (key, row) in self.apply_not_matched(trigger, fx) {
                let index = rows.shard_of(&key);
                self.insert_row(&mut shards[index], key, row, fx);
            }
            return;
        }
        for (index, key, snapshot) in matched {
            self.apply_matched(trigger, &key, snapshot, &mut shards[index], fx);
        }
    }

    /// Run the first applicable `when matched` clause against one row.
    fn apply_matched(
        &self,
        trigger: &SharedEvent,
        key: &GroupKey,
        before: SharedEvent,
        shard: &mut Shard<TableRow>,
        fx: &mut MergeEffects,
    ) {
        let streams = [Some(Arc::clone(trigger)), Some(Arc::clone(&before))];
        let ctx = EvalContext::new(&streams);
        let Some(clause) = self.first_clause(true, &ctx) else {
            return;
        };

        let mut updated = false;
        let mut deleted = false;
        for action in &clause.actions {
            match action {
                Action::Update(_) if deleted => {}
                Action::Update(assignments) => {
                    let values: Vec<_> = assignments
                        .iter()
                        .map(|(column, node)| {
                            (*column, self.table.coerce(*column, evaluate(node, &ctx)))
                        })
                        .collect();
                    if let Some(row) = shard.get_mut(key) {
                        for (column, value) in values {
                            row.set(column, value);
                        }
                        row.touch(trigger.timestamp);
                        updated = true;
                    }
                }
                Action::Delete if deleted => {}
                Action::Delete => {
                    deleted = true;
                    let Some(row) = shard.remove(key) else {
                        continue;
                    };
                    if updated {
                        let last = self.table.snapshot(&row);
                        fx.new_rows.push(Arc::clone(&last));
                        fx.old_rows.push(Arc::clone(&before));
                        fx.old_rows.push(last);
                        updated = false;
                    } else {
                        fx.old_rows.push(Arc::clone(&before));
                    }
                }
                Action::InsertInto {
                    event_type,
                    columns,
                } => fx.emitted.push(derive_event(event_type, columns, &ctx, trigger.timestamp)),
                Action::Insert(_) => {}
            }
        }

        if updated && !deleted {
            if let Some(row) = shard.get(key) {
                fx.new_rows.push(self.table.snapshot(row));
                fx.old_rows.push(before);
            }
        }
    }

    /// Run the first applicable `when not matched` clause. Returns the rows
    /// to insert, which the caller places under the right shard lock.
    fn apply_not_matched(&self, trigger: &SharedEvent, fx: &mut MergeEffects) -> Vec<(GroupKey, TableRow)> {
        let streams = [Some(Arc::clone(trigger)), None];
        let ctx = EvalContext::new(&streams);
        let Some(clause) = self.first_clause(false, &ctx) else {
            return Vec::new();
        };

        let mut inserts = Vec::new();
        for action in &clause.actions {
            match action {
                Action::Insert(insert) => {
                    let key = self.table.key_from(insert.keys.iter().map(|k| evaluate(k, &ctx)));
                    let mut row = self.table.new_row(&key, trigger.timestamp);
                    for (column, node) in &insert.columns {
                        row.set(*column, self.table.coerce(*column, evaluate(node, &ctx)));
                    }
                    inserts.push((key, row));
                }
                Action::InsertInto {
                    event_type,
                    columns,
                } => fx.emitted.push(derive_event(event_type, columns, &ctx, trigger.timestamp)),
                Action::Update(_) | Action::Delete => {}
            }
        }
        inserts
    }

    fn first_clause(&self, matched: bool, ctx: &EvalContext<'_>) -> Option<&Clause> {
        self.clauses.iter().filter(|c| c.matched == matched).find(|c| {
            c.condition
                .as_ref()
                .map_or(true, |cond| is_true(&evaluate(cond, ctx)))
        })
    }

    fn insert_row(
        &self,
        shard: &mut Shard<TableRow>,
        key: GroupKey,
        row: TableRow,
        fx: &mut MergeEffects,
    ) {
        if shard.contains_key(&key) {
            match self.policy {
                DuplicateKeyPolicy::Reject => {
                    warn!(
                        statement = %self.statement,
                        table = %self.table.name(),
                        key = %key,
                        "insert rejected: primary key already exists"
                    );
                    fx.conflicts.push(MergeConflict {
                        statement: self.statement.to_string(),
                        table: self.table.name().to_string(),
                        key,
                    });
                }
                DuplicateKeyPolicy::Ignore => {
                    debug!(table = %self.table.name(), key = %key, "duplicate insert ignored");
                }
            }
            return;
        }
        fx.new_rows.push(self.table.snapshot(&row));
        shard.insert(key, row);
    }
}

fn derive_event(
    event_type: &Arc<str>,
    columns: &[(String, Node)],
    ctx: &EvalContext<'_>,
    at: DateTime<Utc>,
) -> Event {
    let mut data = FxIndexMap::with_capacity_and_hasher(columns.len(), Default::default());
    for (name, node) in columns {
        data.insert(name.clone(), evaluate(node, ctx));
    }
    Event::from_fields(Arc::clone(event_type), at, data)
}

// =============================================================================
// Compilation
// =============================================================================

fn compile_keys(
    table: &NamedTable,
    keys: &[Expr],
    streams: &[StreamBinding],
    schemas: &SchemaRegistry,
) -> ValidationResult<Vec<Node>> {
    let key_types = table.key_types();
    if keys.len() != key_types.len() {
        return Err(ValidationError::invalid(format!(
            "merge into table '{}' provides {} key expressions but the table has {} primary key columns",
            table.name(),
            keys.len(),
            key_types.len()
        )));
    }
    let mut compiler = Compiler::new(streams, schemas);
    keys.iter()
        .zip(&key_types)
        .map(|(expr, expected)| {
            let compiled = compiler.compile(expr)?;
            check_assignable(expr, expected, &compiled.ty)?;
            Ok(compiled.node)
        })
        .collect()
}

/// Turn `row.k = <trigger expr>` conjuncts covering every primary-key column
/// into a point lookup. Anything else stays a per-row condition.
fn lift_key_equalities(
    table: &NamedTable,
    cond: &Expr,
    streams: &[StreamBinding],
    schemas: &SchemaRegistry,
) -> ValidationResult<RowMatch> {
    let mut conjuncts = Vec::new();
    split_conjuncts(cond, &mut conjuncts);

    let mut compiler = Compiler::new(streams, schemas);
    let key_columns = table.key_columns();
    let mut lifted: Vec<Option<Node>> = vec![None; key_columns.len()];
    let mut residual: Vec<Node> = Vec::new();
    let mut all: Vec<Node> = Vec::with_capacity(conjuncts.len());

    for conjunct in conjuncts {
        let node = compiler.compile_condition(conjunct)?;
        all.push(node.clone());
        match key_equality(table, &node) {
            Some((position, trigger_side)) if lifted[position].is_none() => {
                lifted[position] = Some(trigger_side);
            }
            _ => residual.push(node),
        }
    }

    if key_columns.is_empty() || lifted.iter().any(Option::is_none) {
        return Ok(RowMatch::Scan(conjoin(all)));
    }
    Ok(RowMatch::Key {
        keys: lifted.into_iter().flatten().collect(),
        residual: conjoin(residual),
    })
}

fn split_conjuncts<'e>(expr: &'e Expr, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::Binary {
            op: BinOp::And,
            left,
            right,
        } => {
            split_conjuncts(left, out);
            split_conjuncts(right, out);
        }
        other => out.push(other),
    }
}

/// `(key position, trigger-side node)` when `node` is `row.key = trigger expr`.
fn key_equality(table: &NamedTable, node: &Node) -> Option<(usize, Node)> {
    let Node::Binary {
        op: BinOp::Eq,
        left,
        right,
    } = node
    else {
        return None;
    };
    let row_key = |n: &Node| match n {
        Node::Property { stream: 1, field } => table
            .column_index(field)
            .and_then(|c| table.key_columns().iter().position(|&k| k == c)),
        _ => None,
    };
    match (row_key(left), row_key(right)) {
        (Some(pos), None) if !right.references_stream(1) => Some((pos, right.as_ref().clone())),
        (None, Some(pos)) if !left.references_stream(1) => Some((pos, left.as_ref().clone())),
        _ => None,
    }
}

fn conjoin(nodes: Vec<Node>) -> Option<Node> {
    nodes.into_iter().reduce(|acc, n| Node::Binary {
        op: BinOp::And,
        left: Box::new(acc),
        right: Box::new(n),
    })
}

fn compile_action(
    compiler: &mut Compiler<'_>,
    table: &NamedTable,
    matched: bool,
    action: &MergeAction,
    derived: &mut Vec<EventTypeDef>,
) -> ValidationResult<Action> {
    let misplaced = |what: &str, clause: &str| {
        ValidationError::invalid(format!(
            "merge into table '{}': {} is only valid in a 'when {}' clause",
            table.name(),
            what,
            clause
        ))
    };

    match action {
        MergeAction::Insert(assignments) => {
            if matched {
                return Err(misplaced("insert", "not matched"));
            }
            let mut keys: Vec<Option<Node>> = vec![None; table.key_columns().len()];
            let mut columns = Vec::new();
            for (name, expr) in assignments {
                let column = writable_column(table, name)?;
                let compiled = compiler.compile(expr)?;
                check_assignable(expr, &table.column_type(column), &compiled.ty)?;
                match table.key_columns().iter().position(|&k| k == column) {
                    Some(position) => keys[position] = Some(compiled.node),
                    None => columns.push((column, compiled.node)),
                }
            }
            if let Some(missing) = keys.iter().position(Option::is_none) {
                let column = table.key_columns()[missing];
                return Err(ValidationError::invalid(format!(
                    "insert into table '{}' does not assign primary key column '{}'",
                    table.name(),
                    table.columns()[column].name
                )));
            }
            Ok(Action::Insert(Insert {
                keys: keys.into_iter().flatten().collect(),
                columns,
            }))
        }
        MergeAction::Update(assignments) => {
            if !matched {
                return Err(misplaced("update", "matched"));
            }
            let mut columns = Vec::with_capacity(assignments.len());
            for (name, expr) in assignments {
                let column = writable_column(table, name)?;
                if table.columns()[column].is_key() {
                    return Err(ValidationError::KeyColumnUpdate {
                        table: table.name().to_string(),
                        column: name.clone(),
                    });
                }
                let compiled = compiler.compile(expr)?;
                check_assignable(expr, &table.column_type(column), &compiled.ty)?;
                columns.push((column, compiled.node));
            }
            Ok(Action::Update(columns))
        }
        MergeAction::Delete => {
            if !matched {
                return Err(misplaced("delete", "matched"));
            }
            Ok(Action::Delete)
        }
        MergeAction::InsertInto {
            event_type,
            columns,
        } => {
            let mut def = EventTypeDef::new(event_type.clone());
            let mut nodes = Vec::with_capacity(columns.len());
            for (name, expr) in columns {
                let compiled = compiler.compile(expr)?;
                def = def.field(name.clone(), compiled.ty);
                nodes.push((name.clone(), compiled.node));
            }
            derived.push(def);
            Ok(Action::InsertInto {
                event_type: Arc::from(event_type.as_str()),
                columns: nodes,
            })
        }
    }
}

fn writable_column(table: &NamedTable, name: &str) -> ValidationResult<usize> {
    let column = table
        .column_index(name)
        .ok_or_else(|| ValidationError::UnknownColumn {
            table: table.name().to_string(),
            column: name.to_string(),
        })?;
    if table.columns()[column].is_aggregate() {
        return Err(ValidationError::InvalidColumn {
            table: table.name().to_string(),
            column: name.to_string(),
            message: "is an aggregation column and cannot be assigned".into(),
        });
    }
    Ok(column)
}

fn check_assignable(expr: &Expr, expected: &Type, actual: &Type) -> ValidationResult<()> {
    if expected.accepts(actual) {
        Ok(())
    } else {
        Err(ValidationError::mismatch(expr, expected.to_string(), actual.clone()))
    }
}
