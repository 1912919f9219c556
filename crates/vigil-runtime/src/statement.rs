//! Compiled statements
//!
//! A [`Statement`] is the runtime form of a [`StatementDef`]: compiled
//! expression trees plus whatever state the statement keeps between events.
//!
//! | Kind                         | State                                   | Rows emitted                     |
//! |------------------------------|-----------------------------------------|----------------------------------|
//! | select, no window/aggregates | none                                    | new row per passing event        |
//! | select, window               | window                                  | new rows in, old rows evicted    |
//! | select with aggregations     | window + per-group aggregation          | old and new row per group change |
//! | select over two streams      | one window per side                     | joined pairs in and out          |
//! | into table                   | optional window, table aggregations     | old and new table row            |
//! | merge                        | the target table                        | old and new table rows           |
//!
//! `partition_by` gives every partition key its own window and aggregation
//! state. Partitions live in a [`Sharded`] map, so partitions in different
//! shards are processed in parallel.
//!
//! The statement's logic sits behind a `RwLock<Option<_>>` gate: event
//! processing holds the read side, and [`Statement::shutdown`] takes the
//! write side, so teardown waits for in-flight events before dropping state.

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;
use vigil_core::{
    AggFunc, Event, EventType, EventTypeDef, Expr, FieldDef, FxIndexMap, GroupKey, IntoTableDef,
    MergeDef, SchemaRegistry, SelectDef, SelectItem, SharedEvent, StatementDef, StreamSpec, Type,
    ValidationError, ValidationResult, Value, WindowSpec,
};

use crate::aggregation::{AggregationTable, AggregatorSpec};
use crate::config::EngineConfig;
use crate::error::MergeConflict;
use crate::evaluator::{evaluate, is_true, Compiler, EvalContext, Node, StreamBinding};
use crate::join::{JoinState, Pair};
use crate::merge::CompiledMerge;
use crate::shard::Sharded;
use crate::table::{ColumnSlot, NamedTable};
use crate::window::{RetentionWindow, Timestamped};

/// Rows and side effects produced by one statement for one event
#[derive(Debug, Default)]
pub struct StatementOutput {
    pub new_rows: Vec<SharedEvent>,
    pub old_rows: Vec<SharedEvent>,
    /// Events to process within the same tick
    pub emitted: Vec<Event>,
    pub conflicts: Vec<MergeConflict>,
}

impl StatementOutput {
    pub fn is_empty(&self) -> bool {
        self.new_rows.is_empty()
            && self.old_rows.is_empty()
            && self.emitted.is_empty()
            && self.conflicts.is_empty()
    }
}

/// What statements are compiled against
pub struct CompileContext<'a> {
    pub schemas: &'a SchemaRegistry,
    pub tables: &'a FxHashMap<String, Arc<NamedTable>>,
    pub config: &'a EngineConfig,
}

pub struct Statement {
    name: Arc<str>,
    inputs: Vec<String>,
    tables: Vec<String>,
    output_type: Arc<EventType>,
    derived: Vec<EventTypeDef>,
    gate: RwLock<Option<Logic>>,
}

enum Logic {
    Select(SelectLogic),
    Join(JoinLogic),
    IntoTable(IntoTableLogic),
    Merge(MergeLogic),
}

impl Statement {
    pub fn compile(name: &str, def: &StatementDef, cx: &CompileContext<'_>) -> ValidationResult<Self> {
        let name: Arc<str> = Arc::from(name);
        let compiled = match def {
            StatementDef::Select(def) if def.streams.len() == 2 => compile_join(&name, def, cx)?,
            StatementDef::Select(def) => compile_select(&name, def, cx)?,
            StatementDef::IntoTable(def) => compile_into_table(def, cx)?,
            StatementDef::Merge(def) => compile_merge(&name, def, cx)?,
        };
        Ok(Self {
            name,
            inputs: compiled.inputs,
            tables: compiled.tables,
            output_type: compiled.output_type,
            derived: compiled.derived,
            gate: RwLock::new(Some(compiled.logic)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared_name(&self) -> &Arc<str> {
        &self.name
    }

    /// Event type of each input stream, by stream number.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    /// Tables read or written.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn output_type(&self) -> &Arc<EventType> {
        &self.output_type
    }

    /// Event types the statement emits into (`insert into`).
    pub fn derived_types(&self) -> &[EventTypeDef] {
        &self.derived
    }

    pub fn references_event_type(&self, event_type: &str) -> bool {
        self.inputs.iter().any(|t| t == event_type)
            || self.derived.iter().any(|d| d.name == event_type)
            || self
                .output_type
                .fields()
                .iter()
                .any(|f| f.ty.event_type_name() == Some(event_type))
    }

    pub fn is_active(&self) -> bool {
        self.gate.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Process one event arriving on input stream `stream`. Returns `None`
    /// once the statement has been shut down.
    pub fn process(&self, stream: usize, event: &SharedEvent) -> Option<StatementOutput> {
        let gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
        let logic = gate.as_ref()?;
        let mut out = StatementOutput::default();
        match logic {
            Logic::Select(select) => select.on_event(&self.name, event, &mut out),
            Logic::Join(join) => join.on_event(&self.name, stream, event, &mut out),
            Logic::IntoTable(into) => into.on_event(event, &mut out),
            Logic::Merge(merge) => merge.on_event(event, &mut out),
        }
        Some(out)
    }

    /// Expire time windows as of `now`.
    pub fn advance_watermark(&self, now: DateTime<Utc>) -> Option<StatementOutput> {
        let gate = self.gate.read().unwrap_or_else(|e| e.into_inner());
        let logic = gate.as_ref()?;
        let mut out = StatementOutput::default();
        match logic {
            Logic::Select(select) => select.expire(&self.name, now, &mut out),
            Logic::Join(join) => join.expire(&self.name, now, &mut out),
            Logic::IntoTable(into) => into.expire(now, &mut out),
            Logic::Merge(_) => {}
        }
        Some(out)
    }

    /// Wait for in-flight events to finish, then drop all state.
    pub fn shutdown(&self) {
        let mut gate = self.gate.write().unwrap_or_else(|e| e.into_inner());
        if gate.take().is_some() {
            debug!(statement = %self.name, "statement state released");
        }
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("tables", &self.tables)
            .field("active", &self.is_active())
            .finish()
    }
}

struct Compiled {
    logic: Logic,
    inputs: Vec<String>,
    tables: Vec<String>,
    output_type: Arc<EventType>,
    derived: Vec<EventTypeDef>,
}

// =============================================================================
// Shared pieces
// =============================================================================

/// An event retained by a window, with what it contributed when it entered
#[derive(Debug, Clone)]
struct Entry {
    event: SharedEvent,
    passed: bool,
    group: GroupKey,
    inputs: Vec<Value>,
}

impl Timestamped for Entry {
    fn timestamp(&self) -> DateTime<Utc> {
        self.event.timestamp
    }
}

fn passes(node: Option<&Node>, ctx: &EvalContext<'_>) -> bool {
    node.map_or(true, |n| is_true(&evaluate(n, ctx)))
}

fn single(event: &SharedEvent) -> [Option<SharedEvent>; 1] {
    [Some(Arc::clone(event))]
}

fn bind_stream(spec: &StreamSpec, schemas: &SchemaRegistry) -> ValidationResult<StreamBinding> {
    if spec.window == Some(WindowSpec::Length(0)) {
        return Err(ValidationError::invalid(format!(
            "length window on stream '{}' must retain at least one event",
            spec.reference_name()
        )));
    }
    Ok(StreamBinding {
        name: spec.reference_name().to_string(),
        event_type: schemas.require(&spec.event_type)?,
    })
}

/// Compile a stream's own filter; it sees only that stream.
fn compile_filter(
    spec: &StreamSpec,
    binding: &StreamBinding,
    cx: &CompileContext<'_>,
    allow_tables: bool,
) -> ValidationResult<Option<Node>> {
    let Some(filter) = &spec.filter else {
        return Ok(None);
    };
    let streams = std::slice::from_ref(binding);
    let mut compiler = Compiler::new(streams, cx.schemas);
    if allow_tables {
        compiler = compiler.with_tables(cx.tables);
    }
    compiler.compile_condition(filter).map(Some)
}

fn tables_of<'a>(nodes: impl IntoIterator<Item = &'a Node>) -> Vec<String> {
    let mut names: Vec<&str> = Vec::new();
    for node in nodes {
        node.collect_tables(&mut names);
    }
    let mut seen = FxHashSet::default();
    names
        .into_iter()
        .filter(|n| seen.insert(*n))
        .map(String::from)
        .collect()
}

/// How output rows are built
enum Projection {
    /// `select *` from one stream: the event itself
    Passthrough,
    /// `select *` from a join: one field per stream holding its event
    Streams(Vec<String>),
    Columns(Vec<(String, Node)>),
}

impl Projection {
    fn compile(
        items: &[SelectItem],
        streams: &[StreamBinding],
        compiler: &mut Compiler<'_>,
        statement: &str,
    ) -> ValidationResult<(Self, Arc<EventType>)> {
        if items.is_empty() {
            return Err(ValidationError::invalid(format!(
                "statement '{}' selects nothing",
                statement
            )));
        }
        if items.iter().any(|i| matches!(i, SelectItem::Wildcard)) {
            if items.len() > 1 {
                return Err(ValidationError::invalid(
                    "'*' cannot be combined with other select items",
                ));
            }
            if let [only] = streams {
                return Ok((Projection::Passthrough, Arc::clone(&only.event_type)));
            }
            let fields = streams
                .iter()
                .map(|s| FieldDef {
                    name: s.name.clone(),
                    ty: Type::Named(s.event_type.name().to_string()),
                })
                .collect();
            let names = streams.iter().map(|s| s.name.clone()).collect();
            return Ok((
                Projection::Streams(names),
                Arc::new(EventType::anonymous(statement, fields)),
            ));
        }

        let mut columns = Vec::with_capacity(items.len());
        let mut fields: Vec<FieldDef> = Vec::with_capacity(items.len());
        for item in items {
            let SelectItem::Expr { expr, alias } = item else {
                continue;
            };
            let compiled = compiler.compile(expr)?;
            let name = alias.clone().unwrap_or_else(|| expr.to_string());
            if fields.iter().any(|f| f.name == name) {
                return Err(ValidationError::invalid(format!(
                    "select item '{}' is declared more than once",
                    name
                )));
            }
            fields.push(FieldDef {
                name: name.clone(),
                ty: compiled.ty,
            });
            columns.push((name, compiled.node));
        }
        Ok((
            Projection::Columns(columns),
            Arc::new(EventType::anonymous(statement, fields)),
        ))
    }

    fn nodes(&self) -> Vec<&Node> {
        match self {
            Projection::Columns(columns) => columns.iter().map(|(_, n)| n).collect(),
            _ => Vec::new(),
        }
    }

    fn project(
        &self,
        statement: &Arc<str>,
        streams: &[Option<SharedEvent>],
        aggregates: &[Value],
    ) -> Option<SharedEvent> {
        let at = streams
            .iter()
            .flatten()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or_else(Utc::now);
        match self {
            Projection::Passthrough => streams.first().cloned().flatten(),
            Projection::Streams(names) => {
                let mut data = FxIndexMap::with_capacity_and_hasher(names.len(), Default::default());
                for (name, event) in names.iter().zip(streams) {
                    let value = event.clone().map(Value::Event).unwrap_or_default();
                    data.insert(name.clone(), value);
                }
                Some(Arc::new(Event::from_fields(Arc::clone(statement), at, data)))
            }
            Projection::Columns(columns) => {
                let ctx = EvalContext::new(streams).with_aggregates(aggregates);
                let mut data = FxIndexMap::with_capacity_and_hasher(columns.len(), Default::default());
                for (name, node) in columns {
                    data.insert(name.clone(), evaluate(node, &ctx));
                }
                Some(Arc::new(Event::from_fields(Arc::clone(statement), at, data)))
            }
        }
    }
}

// =============================================================================
// Single-stream select
// =============================================================================

struct Instance {
    window: Option<RetentionWindow<Entry>>,
    aggregates: AggregationTable,
}

enum Runtime {
    Stateless,
    Single(Mutex<Instance>),
    Partitioned(Sharded<Instance>),
}

struct SelectLogic {
    filter: Option<Node>,
    where_clause: Option<Node>,
    group_by: Vec<Node>,
    projection: Projection,
    specs: Arc<[AggregatorSpec]>,
    agg_args: Vec<Option<Node>>,
    window: Option<WindowSpec>,
    partition_by: Vec<String>,
    runtime: Runtime,
}

fn compile_select(name: &Arc<str>, def: &SelectDef, cx: &CompileContext<'_>) -> ValidationResult<Compiled> {
    let [spec] = def.streams.as_slice() else {
        return Err(ValidationError::invalid(format!(
            "statement '{}' must select from one or two streams",
            name
        )));
    };
    let binding = bind_stream(spec, cx.schemas)?;
    let filter = compile_filter(spec, &binding, cx, true)?;

    for field in &def.partition_by {
        if !binding.event_type.has_field(field) {
            return Err(ValidationError::UnknownProperty {
                expr: field.clone(),
                property: field.clone(),
            });
        }
    }

    let streams = std::slice::from_ref(&binding);
    let mut compiler = Compiler::new(streams, cx.schemas)
        .with_tables(cx.tables)
        .with_aggregation();

    let slots = compiler.suspend_aggregation();
    let where_clause = def
        .where_clause
        .as_ref()
        .map(|w| compiler.compile_condition(w))
        .transpose()?;
    let group_by = def
        .group_by
        .iter()
        .map(|g| compiler.compile(g).map(|c| c.node))
        .collect::<ValidationResult<Vec<_>>>()?;
    compiler.resume_aggregation(slots);

    let (projection, output_type) = Projection::compile(&def.items, streams, &mut compiler, name)?;
    let aggregates = compiler.into_aggregates();
    if aggregates.is_empty() && !group_by.is_empty() {
        return Err(ValidationError::invalid(format!(
            "statement '{}' groups rows but selects no aggregation function",
            name
        )));
    }

    let tables = tables_of(
        filter
            .iter()
            .chain(where_clause.iter())
            .chain(group_by.iter())
            .chain(projection.nodes()),
    );
    let specs: Arc<[AggregatorSpec]> = aggregates.iter().map(|s| s.spec.clone()).collect();
    let agg_args = aggregates.into_iter().map(|s| s.arg).collect();

    let stateful = spec.window.is_some() || !specs.is_empty();
    let mut logic = SelectLogic {
        filter,
        where_clause,
        group_by,
        projection,
        specs,
        agg_args,
        window: spec.window,
        partition_by: def.partition_by.clone(),
        runtime: Runtime::Stateless,
    };
    logic.runtime = match (stateful, def.partition_by.is_empty()) {
        (false, _) => Runtime::Stateless,
        (true, true) => Runtime::Single(Mutex::new(logic.new_instance())),
        (true, false) => Runtime::Partitioned(Sharded::new(cx.config.shards)),
    };

    Ok(Compiled {
        logic: Logic::Select(logic),
        inputs: vec![spec.event_type.clone()],
        tables,
        output_type,
        derived: Vec::new(),
    })
}

impl SelectLogic {
    fn new_instance(&self) -> Instance {
        Instance {
            window: self.window.map(RetentionWindow::new),
            aggregates: AggregationTable::new(Arc::clone(&self.specs)),
        }
    }

    fn is_aggregated(&self) -> bool {
        !self.specs.is_empty()
    }

    fn on_event(&self, name: &Arc<str>, event: &SharedEvent, out: &mut StatementOutput) {
        let streams = single(event);
        let ctx = EvalContext::new(&streams);
        if !passes(self.filter.as_ref(), &ctx) {
            return;
        }
        let passed = passes(self.where_clause.as_ref(), &ctx);

        let (group, inputs) = if self.is_aggregated() && passed {
            let group: GroupKey = self.group_by.iter().map(|g| evaluate(g, &ctx)).collect();
            let inputs = self
                .agg_args
                .iter()
                .map(|arg| arg.as_ref().map(|a| evaluate(a, &ctx)).unwrap_or_default())
                .collect();
            (group, inputs)
        } else {
            (GroupKey::empty(), Vec::new())
        };
        let entry = Entry {
            event: Arc::clone(event),
            passed,
            group,
            inputs,
        };

        match &self.runtime {
            Runtime::Stateless => {
                if passed {
                    out.new_rows.extend(self.projection.project(name, &streams, &[]));
                }
            }
            Runtime::Single(instance) => {
                let mut instance = instance.lock().unwrap_or_else(|e| e.into_inner());
                self.advance(name, &mut instance, Some(entry), out);
            }
            Runtime::Partitioned(partitions) => {
                let key: GroupKey = self
                    .partition_by
                    .iter()
                    .map(|f| event.get(f).cloned().unwrap_or_default())
                    .collect();
                let mut shard = partitions.write(&key);
                let instance = shard.entry(key).or_insert_with(|| self.new_instance());
                self.advance(name, instance, Some(entry), out);
            }
        }
    }

    fn expire(&self, name: &Arc<str>, now: DateTime<Utc>, out: &mut StatementOutput) {
        if !matches!(self.window, Some(WindowSpec::Time(_))) {
            return;
        }
        match &self.runtime {
            Runtime::Stateless => {}
            Runtime::Single(instance) => {
                let mut instance = instance.lock().unwrap_or_else(|e| e.into_inner());
                self.advance_to(name, &mut instance, now, out);
            }
            Runtime::Partitioned(partitions) => {
                for index in 0..partitions.shard_count() {
                    let mut shard = partitions.write_shard(index);
                    for instance in shard.values_mut() {
                        self.advance_to(name, instance, now, out);
                    }
                }
            }
        }
    }

    fn advance_to(&self, name: &Arc<str>, instance: &mut Instance, now: DateTime<Utc>, out: &mut StatementOutput) {
        let evicted = instance
            .window
            .as_mut()
            .map(|w| w.expire(now))
            .unwrap_or_default();
        if !evicted.is_empty() {
            self.apply(name, instance, None, evicted, out);
        }
    }

    fn advance(&self, name: &Arc<str>, instance: &mut Instance, entry: Option<Entry>, out: &mut StatementOutput) {
        let evicted = match (&mut instance.window, &entry) {
            (Some(window), Some(entry)) => window.insert(entry.clone()),
            _ => Vec::new(),
        };
        self.apply(name, instance, entry, evicted, out);
    }

    fn apply(
        &self,
        name: &Arc<str>,
        instance: &mut Instance,
        added: Option<Entry>,
        evicted: Vec<Entry>,
        out: &mut StatementOutput,
    ) {
        if !self.is_aggregated() {
            if let Some(added) = added.filter(|e| e.passed) {
                out.new_rows
                    .extend(self.projection.project(name, &single(&added.event), &[]));
            }
            for gone in evicted.iter().filter(|e| e.passed) {
                out.old_rows
                    .extend(self.projection.project(name, &single(&gone.event), &[]));
            }
            return;
        }

        // Groups touched by this step, in first-touched order, with the
        // event that represents each group in its output rows.
        let mut affected: Vec<GroupKey> = Vec::new();
        let mut representative: FxHashMap<GroupKey, SharedEvent> = FxHashMap::default();
        for entry in evicted.iter().chain(added.iter()).filter(|e| e.passed) {
            if !representative.contains_key(&entry.group) {
                affected.push(entry.group.clone());
            }
            representative.insert(entry.group.clone(), Arc::clone(&entry.event));
        }
        if affected.is_empty() {
            return;
        }

        let before: Vec<Option<Vec<Value>>> = affected
            .iter()
            .map(|g| instance.aggregates.values(g))
            .collect();
        if let Some(added) = added.as_ref().filter(|e| e.passed) {
            instance.aggregates.add(&added.group, &added.inputs);
        }
        for gone in evicted.iter().filter(|e| e.passed) {
            instance.aggregates.remove(&gone.group, &gone.inputs);
        }

        for (group, before) in affected.iter().zip(before) {
            let Some(event) = representative.get(group) else {
                continue;
            };
            let streams = single(event);
            if let Some(before) = before {
                out.old_rows
                    .extend(self.projection.project(name, &streams, &before));
            }
            let after = instance
                .aggregates
                .values(group)
                .unwrap_or_else(|| instance.aggregates.empty_values());
            out.new_rows
                .extend(self.projection.project(name, &streams, &after));
        }
    }
}

// =============================================================================
// Two-stream join
// =============================================================================

struct JoinLogic {
    filters: [Option<Node>; 2],
    where_clause: Option<Node>,
    projection: Projection,
    state: Mutex<JoinState>,
}

fn compile_join(name: &Arc<str>, def: &SelectDef, cx: &CompileContext<'_>) -> ValidationResult<Compiled> {
    if !def.group_by.is_empty() || !def.partition_by.is_empty() {
        return Err(ValidationError::invalid(format!(
            "join statement '{}' cannot group or partition its rows",
            name
        )));
    }
    let bindings = [
        bind_stream(&def.streams[0], cx.schemas)?,
        bind_stream(&def.streams[1], cx.schemas)?,
    ];
    if bindings[0].name == bindings[1].name {
        return Err(ValidationError::invalid(format!(
            "join statement '{}' needs distinct stream names but both streams are named '{}'",
            name, bindings[0].name
        )));
    }
    let filters = [
        compile_filter(&def.streams[0], &bindings[0], cx, true)?,
        compile_filter(&def.streams[1], &bindings[1], cx, true)?,
    ];

    let mut compiler = Compiler::new(&bindings, cx.schemas).with_tables(cx.tables);
    let where_clause = def
        .where_clause
        .as_ref()
        .map(|w| compiler.compile_condition(w))
        .transpose()?;
    let (projection, output_type) = Projection::compile(&def.items, &bindings, &mut compiler, name)?;

    let tables = tables_of(
        filters
            .iter()
            .flatten()
            .chain(where_clause.iter())
            .chain(projection.nodes()),
    );
    let windows = [
        def.streams[0].window.unwrap_or(WindowSpec::KeepAll),
        def.streams[1].window.unwrap_or(WindowSpec::KeepAll),
    ];

    Ok(Compiled {
        logic: Logic::Join(JoinLogic {
            filters,
            where_clause,
            projection,
            state: Mutex::new(JoinState::new(windows)),
        }),
        inputs: def.streams.iter().map(|s| s.event_type.clone()).collect(),
        tables,
        output_type,
        derived: Vec::new(),
    })
}

impl JoinLogic {
    fn matches(&self, pair: &Pair) -> bool {
        passes(self.where_clause.as_ref(), &EvalContext::new(pair))
    }

    fn on_event(&self, name: &Arc<str>, side: usize, event: &SharedEvent, out: &mut StatementOutput) {
        let Some(filter) = self.filters.get(side) else {
            return;
        };
        if !passes(filter.as_ref(), &EvalContext::new(&single(event))) {
            return;
        }
        let delta = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.insert(side, Arc::clone(event), |pair| self.matches(pair))
        };
        for pair in &delta.new_pairs {
            out.new_rows.extend(self.projection.project(name, pair, &[]));
        }
        for pair in &delta.old_pairs {
            out.old_rows.extend(self.projection.project(name, pair, &[]));
        }
    }

    fn expire(&self, name: &Arc<str>, now: DateTime<Utc>, out: &mut StatementOutput) {
        let old = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.expire(now, |pair| self.matches(pair))
        };
        for pair in &old {
            out.old_rows.extend(self.projection.project(name, pair, &[]));
        }
    }
}

// =============================================================================
// Into table
// =============================================================================

struct IntoTableLogic {
    table: Arc<NamedTable>,
    filter: Option<Node>,
    where_clause: Option<Node>,
    keys: Vec<Node>,
    /// Target column of each aggregation input
    columns: Vec<usize>,
    args: Vec<Option<Node>>,
    window: Option<Mutex<RetentionWindow<Entry>>>,
}

fn compile_into_table(def: &IntoTableDef, cx: &CompileContext<'_>) -> ValidationResult<Compiled> {
    let table = cx
        .tables
        .get(&def.table)
        .cloned()
        .ok_or_else(|| ValidationError::UnknownTable(def.table.clone()))?;
    let binding = bind_stream(&def.stream, cx.schemas)?;
    let filter = compile_filter(&def.stream, &binding, cx, true)?;
    let streams = std::slice::from_ref(&binding);
    let mut compiler = Compiler::new(streams, cx.schemas).with_tables(cx.tables);

    let where_clause = def
        .where_clause
        .as_ref()
        .map(|w| compiler.compile_condition(w))
        .transpose()?;

    let key_types = table.key_types();
    if def.group_by.len() != key_types.len() {
        return Err(ValidationError::invalid(format!(
            "into table '{}' groups by {} expressions but the table has {} primary key columns",
            table.name(),
            def.group_by.len(),
            key_types.len()
        )));
    }
    let mut keys = Vec::with_capacity(def.group_by.len());
    for (expr, expected) in def.group_by.iter().zip(&key_types) {
        let compiled = compiler.compile(expr)?;
        if !expected.accepts(&compiled.ty) {
            return Err(ValidationError::mismatch(expr, expected.to_string(), compiled.ty));
        }
        keys.push(compiled.node);
    }

    let mut compiler = compiler.with_aggregation();
    let mut targets: Vec<(usize, usize, AggregatorSpec)> = Vec::with_capacity(def.columns.len());
    for (column_name, expr) in &def.columns {
        let invalid = |message: String| ValidationError::InvalidColumn {
            table: table.name().to_string(),
            column: column_name.clone(),
            message,
        };
        let column = table
            .column_index(column_name)
            .ok_or_else(|| ValidationError::UnknownColumn {
                table: table.name().to_string(),
                column: column_name.clone(),
            })?;
        let Some(ColumnSlot::Aggregate(column_spec)) = table.column(column).map(|c| &c.slot) else {
            return Err(invalid("is not an aggregation column".into()));
        };
        if !matches!(expr, Expr::Aggregate { .. }) {
            return Err(invalid(format!("must be fed by an aggregation function, not '{}'", expr)));
        }
        let Node::Aggregate(slot) = compiler.compile(expr)?.node else {
            return Err(invalid(format!("must be fed by an aggregation function, not '{}'", expr)));
        };
        targets.push((column, slot, column_spec.clone()));
    }

    let slots = compiler.into_aggregates();
    let mut columns = Vec::with_capacity(targets.len());
    let mut args = Vec::with_capacity(targets.len());
    for ((column, slot, column_spec), (column_name, expr)) in targets.into_iter().zip(&def.columns) {
        let Some(fed) = slots.get(slot) else {
            continue;
        };
        if !feeds(&column_spec, &fed.spec, cx.schemas) {
            return Err(ValidationError::InvalidColumn {
                table: table.name().to_string(),
                column: column_name.clone(),
                message: format!(
                    "holds {} but receives '{}' of type {}",
                    column_spec.result_type(),
                    expr,
                    fed.spec.result_type()
                ),
            });
        }
        columns.push(column);
        args.push(fed.arg.clone());
    }

    let tables = tables_of(filter.iter().chain(where_clause.iter()).chain(keys.iter()))
        .into_iter()
        .chain(std::iter::once(table.name().to_string()))
        .collect();

    Ok(Compiled {
        output_type: Arc::clone(table.row_type()),
        logic: Logic::IntoTable(IntoTableLogic {
            window: def.stream.window.map(|w| Mutex::new(RetentionWindow::new(w))),
            table,
            filter,
            where_clause,
            keys,
            columns,
            args,
        }),
        inputs: vec![def.stream.event_type.clone()],
        tables,
        derived: Vec::new(),
    })
}

/// Whether aggregation `fed` may update a column holding `column`.
fn feeds(column: &AggregatorSpec, fed: &AggregatorSpec, schemas: &SchemaRegistry) -> bool {
    if column.func != fed.func {
        return false;
    }
    match (column.func, &column.arg_type, &fed.arg_type) {
        (AggFunc::Count, _, _) => true,
        (AggFunc::Window, Some(Type::Named(expected)), Some(Type::Named(actual))) => {
            schemas.is_assignable(actual, expected)
        }
        (_, Some(expected), Some(actual)) => expected.accepts(actual),
        _ => false,
    }
}

impl IntoTableLogic {
    fn on_event(&self, event: &SharedEvent, out: &mut StatementOutput) {
        let streams = single(event);
        let ctx = EvalContext::new(&streams);
        if !passes(self.filter.as_ref(), &ctx) {
            return;
        }
        let passed = passes(self.where_clause.as_ref(), &ctx);
        if !passed && self.window.is_none() {
            return;
        }
        let (group, inputs) = if passed {
            let group = self.table.key_from(self.keys.iter().map(|k| evaluate(k, &ctx)));
            let inputs = self
                .args
                .iter()
                .map(|a| a.as_ref().map(|a| evaluate(a, &ctx)).unwrap_or_default())
                .collect();
            (group, inputs)
        } else {
            (GroupKey::empty(), Vec::new())
        };
        let entry = Entry {
            event: Arc::clone(event),
            passed,
            group,
            inputs,
        };

        match &self.window {
            Some(window) => {
                let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
                let evicted = window.insert(entry.clone());
                self.remove_all(&evicted, event.timestamp, out);
                self.add(&entry, out);
            }
            None => self.add(&entry, out),
        }
    }

    fn expire(&self, now: DateTime<Utc>, out: &mut StatementOutput) {
        if let Some(window) = &self.window {
            let mut window = window.lock().unwrap_or_else(|e| e.into_inner());
            let evicted = window.expire(now);
            self.remove_all(&evicted, now, out);
        }
    }

    fn add(&self, entry: &Entry, out: &mut StatementOutput) {
        if !entry.passed {
            return;
        }
        let change = self
            .table
            .aggregate_add(&entry.group, &self.columns, &entry.inputs, entry.event.timestamp);
        out.old_rows.extend(change.old);
        out.new_rows.extend(change.new);
    }

    fn remove_all(&self, evicted: &[Entry], at: DateTime<Utc>, out: &mut StatementOutput) {
        for gone in evicted.iter().filter(|e| e.passed) {
            if let Some(change) = self
                .table
                .aggregate_remove(&gone.group, &self.columns, &gone.inputs, at)
            {
                out.old_rows.extend(change.old);
                out.new_rows.extend(change.new);
            }
        }
    }
}

// =============================================================================
// Merge
// =============================================================================

struct MergeLogic {
    filter: Option<Node>,
    merge: CompiledMerge,
}

fn compile_merge(name: &Arc<str>, def: &MergeDef, cx: &CompileContext<'_>) -> ValidationResult<Compiled> {
    let table = cx
        .tables
        .get(&def.table)
        .cloned()
        .ok_or_else(|| ValidationError::UnknownTable(def.table.clone()))?;
    if def.trigger.window.is_some() {
        return Err(ValidationError::invalid(format!(
            "merge statement '{}' cannot declare a window on its trigger stream",
            name
        )));
    }
    let binding = bind_stream(&def.trigger, cx.schemas)?;
    // Merge expressions never read tables; the target is reached via its row.
    let filter = compile_filter(&def.trigger, &binding, cx, false)?;
    let merge = CompiledMerge::compile(
        name,
        def,
        binding,
        Arc::clone(&table),
        cx.schemas,
        cx.config.duplicate_key_policy,
    )?;

    Ok(Compiled {
        inputs: vec![def.trigger.event_type.clone()],
        tables: vec![table.name().to_string()],
        output_type: Arc::clone(table.row_type()),
        derived: merge.derived_types().to_vec(),
        logic: Logic::Merge(MergeLogic { filter, merge }),
    })
}

impl MergeLogic {
    fn on_event(&self, event: &SharedEvent, out: &mut StatementOutput) {
        if !passes(self.filter.as_ref(), &EvalContext::new(&single(event))) {
            return;
        }
        let fx = self.merge.execute(event);
        out.new_rows.extend(fx.new_rows);
        out.old_rows.extend(fx.old_rows);
        out.emitted.extend(fx.emitted);
        out.conflicts.extend(fx.conflicts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::TableDef;

    fn context_parts() -> (SchemaRegistry, FxHashMap<String, Arc<NamedTable>>, EngineConfig) {
        let mut reg = SchemaRegistry::new();
        reg.register(
            vigil_core::EventTypeDef::new("SupportBean")
                .field("theString", Type::Str)
                .field("intPrimitive", Type::Int),
        )
        .unwrap();
        (reg, FxHashMap::default(), EngineConfig::default())
    }

    fn bean(id: &str, value: i64) -> SharedEvent {
        Arc::new(
            Event::new("SupportBean")
                .with_field("theString", id)
                .with_field("intPrimitive", value),
        )
    }

    fn ints(rows: &[SharedEvent], field: &str) -> Vec<Option<i64>> {
        rows.iter().map(|r| r.get_int(field)).collect()
    }

    #[test]
    fn test_stateless_select_passthrough() {
        let (reg, tables, config) = context_parts();
        let cx = CompileContext {
            schemas: &reg,
            tables: &tables,
            config: &config,
        };
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean"))
            .select_all()
            .where_clause(Expr::ident("intPrimitive").gt(Expr::lit(0i64)));
        let stmt = Statement::compile("s", &def.into(), &cx).unwrap();
        let event = bean("E1", 1);
        let out = stmt.process(0, &event).unwrap();
        assert!(Arc::ptr_eq(&out.new_rows[0], &event));
        assert!(stmt.process(0, &bean("E2", -1)).unwrap().new_rows.is_empty());
        assert_eq!(stmt.output_type().name(), "SupportBean");
    }

    #[test]
    fn test_grouped_sum_emits_old_and_new_rows() {
        let (reg, tables, config) = context_parts();
        let cx = CompileContext {
            schemas: &reg,
            tables: &tables,
            config: &config,
        };
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean").window(WindowSpec::Length(2)))
            .select(Expr::ident("theString"), "key")
            .select(Expr::sum(Expr::ident("intPrimitive")), "total")
            .group_by(Expr::ident("theString"));
        let stmt = Statement::compile("agg", &def.into(), &cx).unwrap();

        let out = stmt.process(0, &bean("G1", 10)).unwrap();
        assert!(out.old_rows.is_empty());
        assert_eq!(ints(&out.new_rows, "total"), vec![Some(10)]);

        let out = stmt.process(0, &bean("G1", 5)).unwrap();
        assert_eq!(ints(&out.old_rows, "total"), vec![Some(10)]);
        assert_eq!(ints(&out.new_rows, "total"), vec![Some(15)]);

        // G2 pushes the first G1 event out of the window: two groups change.
        let out = stmt.process(0, &bean("G2", 1)).unwrap();
        let keys: Vec<_> = out.new_rows.iter().filter_map(|r| r.get_str("key")).collect();
        assert_eq!(keys, vec!["G1", "G2"]);
        assert_eq!(ints(&out.new_rows, "total"), vec![Some(5), Some(1)]);
        assert_eq!(ints(&out.old_rows, "total"), vec![Some(15)]);
    }

    #[test]
    fn test_plain_window_emits_evicted_as_old() {
        let (reg, tables, config) = context_parts();
        let cx = CompileContext {
            schemas: &reg,
            tables: &tables,
            config: &config,
        };
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean").window(WindowSpec::last_event()))
            .select(Expr::ident("intPrimitive"), "v");
        let stmt = Statement::compile("plain", &def.into(), &cx).unwrap();
        stmt.process(0, &bean("a", 1));
        let out = stmt.process(0, &bean("b", 2)).unwrap();
        assert_eq!(ints(&out.new_rows, "v"), vec![Some(2)]);
        assert_eq!(ints(&out.old_rows, "v"), vec![Some(1)]);
        assert_eq!(&*out.new_rows[0].event_type, "plain");
    }

    #[test]
    fn test_partitions_are_isolated() {
        let (reg, tables, config) = context_parts();
        let cx = CompileContext {
            schemas: &reg,
            tables: &tables,
            config: &config,
        };
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean"))
            .select(Expr::count_star(), "n")
            .partition_by("theString");
        let stmt = Statement::compile("p", &def.into(), &cx).unwrap();
        stmt.process(0, &bean("a", 1));
        stmt.process(0, &bean("a", 1));
        let out = stmt.process(0, &bean("b", 1)).unwrap();
        assert_eq!(ints(&out.new_rows, "n"), vec![Some(1)]);
    }

    #[test]
    fn test_shutdown_stops_processing() {
        let (reg, tables, config) = context_parts();
        let cx = CompileContext {
            schemas: &reg,
            tables: &tables,
            config: &config,
        };
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean")).select_all();
        let stmt = Statement::compile("s", &def.into(), &cx).unwrap();
        assert!(stmt.is_active());
        stmt.shutdown();
        assert!(!stmt.is_active());
        assert!(stmt.process(0, &bean("a", 1)).is_none());
    }

    #[test]
    fn test_into_table_columns_validated() {
        let (reg, mut tables, config) = context_parts();
        let table = NamedTable::new(
            &TableDef::new("varagg")
                .key("key", Type::Str)
                .aggregate("total", AggFunc::Sum, Type::Int)
                .column("note", Type::Str),
            &reg,
            2,
        )
        .unwrap();
        tables.insert("varagg".into(), Arc::new(table));
        let cx = CompileContext {
            schemas: &reg,
            tables: &tables,
            config: &config,
        };

        let wrong_func = IntoTableDef::new("varagg", StreamSpec::new("SupportBean"))
            .group_by(Expr::ident("theString"))
            .aggregate("total", Expr::count_star());
        assert!(matches!(
            Statement::compile("w", &wrong_func.into(), &cx),
            Err(ValidationError::InvalidColumn { .. })
        ));

        let plain_target = IntoTableDef::new("varagg", StreamSpec::new("SupportBean"))
            .group_by(Expr::ident("theString"))
            .aggregate("note", Expr::count_star());
        assert!(Statement::compile("p", &plain_target.into(), &cx).is_err());

        let ok = IntoTableDef::new("varagg", StreamSpec::new("SupportBean"))
            .group_by(Expr::ident("theString"))
            .aggregate("total", Expr::sum(Expr::ident("intPrimitive")));
        let stmt = Statement::compile("ok", &ok.into(), &cx).unwrap();
        assert_eq!(stmt.tables(), &["varagg".to_string()]);
        let out = stmt.process(0, &bean("E1", 3)).unwrap();
        assert_eq!(ints(&out.new_rows, "total"), vec![Some(3)]);
    }

    #[test]
    fn test_join_rejects_aggregation() {
        let (reg, tables, config) = context_parts();
        let cx = CompileContext {
            schemas: &reg,
            tables: &tables,
            config: &config,
        };
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean").alias("a"))
            .join(StreamSpec::new("SupportBean").alias("b"))
            .select(Expr::count_star(), "n");
        assert!(matches!(
            Statement::compile("j", &def.into(), &cx),
            Err(ValidationError::AggregationNotAllowed { .. })
        ));
    }
}
