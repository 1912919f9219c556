//! Engine facade
//!
//! The [`Engine`] owns the schema registry, the named tables, the compiled
//! statements and the listener registry. Every method takes `&self`, so
//! producers share one engine through an `Arc` and submit concurrently.
//!
//! # Processing a submitted event
//!
//! 1. The event is routed to every statement consuming its type or one of
//!    its declared supertypes, in statement registration order.
//! 2. Each statement updates its state and reports new and old rows.
//!    Table writes commit immediately, so later statements of the same tick
//!    read the post-merge rows.
//! 3. Events produced by `insert into` merge actions are queued and
//!    processed within the same tick, up to `max_cascade_depth`.
//! 4. After the tick, one [`ResultBatch`] per statement is delivered to that
//!    statement's listeners, in statement registration order.
//!
//! Administrative operations (registering types, creating tables, compiling
//! statements) take the registry locks in the order schemas, tables,
//! statements, routes.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use rustc_hash::{FxBuildHasher, FxHashMap};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vigil_core::{
    Event, EventType, EventTypeDef, SchemaRegistry, SharedEvent, StatementDef, TableDef,
    ValidationError, Value,
};

use crate::config::EngineConfig;
use crate::dispatch::{Listener, ListenerId, ListenerRegistry, ResultBatch};
use crate::error::{EngineError, EngineResult, MergeConflict};
use crate::statement::{CompileContext, Statement, StatementOutput};
use crate::table::NamedTable;

type Route = (Arc<Statement>, usize);
type Routes = FxHashMap<String, Arc<[Route]>>;
type Tables = FxHashMap<String, Arc<NamedTable>>;

/// Returned by [`Engine::compile_statement`]
#[derive(Debug, Clone)]
pub struct StatementHandle {
    name: Arc<str>,
    output_type: Arc<EventType>,
}

impl StatementHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema of the rows the statement emits.
    pub fn output_type(&self) -> &Arc<EventType> {
        &self.output_type
    }
}

/// Outcome of one submission or watermark advance
#[derive(Debug, Default)]
pub struct SubmitReport {
    /// Non-empty batches produced during the tick, in delivery order
    pub batches: Vec<ResultBatch>,
    /// Inserts refused under `DuplicateKeyPolicy::Reject`
    pub conflicts: Vec<MergeConflict>,
    /// Events processed through `insert into` cascades
    pub cascaded: usize,
    /// Cascaded events dropped past `max_cascade_depth`
    pub dropped: usize,
}

impl SubmitReport {
    pub fn batch(&self, statement: &str) -> Option<&ResultBatch> {
        self.batches.iter().find(|b| &*b.statement == statement)
    }

    pub fn new_rows(&self) -> usize {
        self.batches.iter().map(|b| b.new_rows.len()).sum()
    }

    pub fn old_rows(&self) -> usize {
        self.batches.iter().map(|b| b.old_rows.len()).sum()
    }
}

/// Collects per-statement output during a tick
#[derive(Default)]
struct Tick {
    batches: IndexMap<Arc<str>, ResultBatch, FxBuildHasher>,
    conflicts: Vec<MergeConflict>,
}

impl Tick {
    fn absorb(&mut self, statement: &Arc<str>, output: StatementOutput) -> Vec<Event> {
        self.conflicts.extend(output.conflicts);
        if !output.new_rows.is_empty() || !output.old_rows.is_empty() {
            let batch = self
                .batches
                .entry(Arc::clone(statement))
                .or_insert_with(|| ResultBatch::new(Arc::clone(statement)));
            batch.new_rows.extend(output.new_rows);
            batch.old_rows.extend(output.old_rows);
        }
        output.emitted
    }
}

pub struct Engine {
    config: EngineConfig,
    schemas: RwLock<SchemaRegistry>,
    tables: RwLock<Tables>,
    statements: RwLock<IndexMap<String, Arc<Statement>, FxBuildHasher>>,
    routes: RwLock<Routes>,
    listeners: ListenerRegistry,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        info!(
            shards = config.shards,
            policy = ?config.duplicate_key_policy,
            max_cascade_depth = config.max_cascade_depth,
            "engine created"
        );
        Self {
            config,
            schemas: RwLock::new(SchemaRegistry::new()),
            tables: RwLock::new(FxHashMap::default()),
            statements: RwLock::new(IndexMap::default()),
            routes: RwLock::new(FxHashMap::default()),
            listeners: ListenerRegistry::new(),
        }
    }

    /// Validate `config` before building the engine.
    pub fn with_config(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // =========================================================================
    // Event types
    // =========================================================================

    pub fn register_event_type(&self, def: EventTypeDef) -> EngineResult<Arc<EventType>> {
        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        if self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&def.name)
        {
            return Err(ValidationError::invalid(format!(
                "event type '{}' would shadow the table of the same name",
                def.name
            ))
            .into());
        }
        let registered = schemas.register(def)?;
        info!(event_type = %registered.name(), fields = registered.fields().len(), "event type registered");
        self.rebuild_routes(&schemas);
        Ok(registered)
    }

    /// Refused while a statement or table still refers to the type.
    pub fn remove_event_type(&self, name: &str) -> EngineResult<()> {
        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        if !schemas.contains(name) {
            return Err(EngineError::UnknownEventType(name.to_string()));
        }
        {
            let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
            if let Some(table) = tables
                .values()
                .find(|t| t.referenced_event_types().any(|t| t == name))
            {
                return Err(EngineError::InUse {
                    kind: "Event type",
                    name: name.to_string(),
                    statement: format!("table {}", table.name()),
                });
            }
        }
        {
            let statements = self.statements.read().unwrap_or_else(|e| e.into_inner());
            if let Some(stmt) = statements.values().find(|s| s.references_event_type(name)) {
                return Err(EngineError::InUse {
                    kind: "Event type",
                    name: name.to_string(),
                    statement: stmt.name().to_string(),
                });
            }
        }
        schemas.remove(name)?;
        info!(event_type = %name, "event type removed");
        self.rebuild_routes(&schemas);
        Ok(())
    }

    pub fn event_type(&self, name: &str) -> Option<Arc<EventType>> {
        self.schemas
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
    }

    // =========================================================================
    // Tables
    // =========================================================================

    pub fn create_table(&self, def: &TableDef) -> EngineResult<()> {
        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        if schemas.contains(&def.name) {
            return Err(ValidationError::invalid(format!(
                "table '{}' would shadow the event type of the same name",
                def.name
            ))
            .into());
        }
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if tables.contains_key(&def.name) {
            return Err(ValidationError::DuplicateTable(def.name.clone()).into());
        }
        let table = NamedTable::new(def, &*schemas, self.config.shards)?;
        info!(
            table = %def.name,
            columns = table.columns().len(),
            keys = table.key_columns().len(),
            "table created"
        );
        tables.insert(def.name.clone(), Arc::new(table));
        Ok(())
    }

    /// Refused while a statement reads or writes the table.
    pub fn drop_table(&self, name: &str) -> EngineResult<()> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        if !tables.contains_key(name) {
            return Err(EngineError::UnknownTable(name.to_string()));
        }
        let statements = self.statements.read().unwrap_or_else(|e| e.into_inner());
        if let Some(stmt) = statements.values().find(|s| s.tables().iter().any(|t| t == name)) {
            return Err(EngineError::InUse {
                kind: "Table",
                name: name.to_string(),
                statement: stmt.name().to_string(),
            });
        }
        tables.remove(name);
        info!(table = %name, "table dropped");
        Ok(())
    }

    fn table(&self, name: &str) -> EngineResult<Arc<NamedTable>> {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTable(name.to_string()))
    }

    /// Snapshot of the row stored under `keys`, in primary-key column order.
    pub fn table_lookup(&self, name: &str, keys: &[Value]) -> EngineResult<Option<SharedEvent>> {
        let table = self.table(name)?;
        let expected = table.key_columns().len();
        if keys.len() != expected {
            return Err(EngineError::KeyArity {
                table: name.to_string(),
                key: keys.iter().cloned().collect(),
                expected,
                actual: keys.len(),
            });
        }
        Ok(table.lookup(&table.key_from(keys.iter().cloned())))
    }

    /// Snapshots of every row, in no particular order.
    pub fn table_rows(&self, name: &str) -> EngineResult<Vec<SharedEvent>> {
        Ok(self.table(name)?.snapshot_rows())
    }

    // =========================================================================
    // Statements
    // =========================================================================

    pub fn compile_statement(&self, name: &str, def: StatementDef) -> EngineResult<StatementHandle> {
        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut statements = self.statements.write().unwrap_or_else(|e| e.into_inner());
        if statements.contains_key(name) {
            return Err(EngineError::DuplicateStatement(name.to_string()));
        }

        let cx = CompileContext {
            schemas: &*schemas,
            tables: &*tables,
            config: &self.config,
        };
        let statement = Statement::compile(name, &def, &cx).map_err(|e| {
            debug!(statement = %name, error = %e, "statement rejected");
            e
        })?;
        let mut registered: Vec<&str> = Vec::new();
        for derived in statement.derived_types() {
            match register_derived(&mut schemas, &tables, derived) {
                Ok(true) => registered.push(&derived.name),
                Ok(false) => {}
                Err(e) => {
                    for name in registered {
                        if let Err(err) = schemas.remove(name) {
                            warn!(
                                event_type = %name,
                                error = %err,
                                "derived event type not rolled back"
                            );
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        let handle = StatementHandle {
            name: Arc::clone(statement.shared_name()),
            output_type: Arc::clone(statement.output_type()),
        };
        info!(
            statement = %name,
            inputs = ?statement.inputs(),
            tables = ?statement.tables(),
            "statement compiled"
        );
        statements.insert(name.to_string(), Arc::new(statement));
        drop(statements);
        self.rebuild_routes(&schemas);
        Ok(handle)
    }

    /// Detach the statement, wait for events it is processing, then free
    /// its state and listeners.
    pub fn destroy_statement(&self, name: &str) -> EngineResult<()> {
        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        let removed = self
            .statements
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .shift_remove(name)
            .ok_or_else(|| EngineError::UnknownStatement(name.to_string()))?;
        self.rebuild_routes(&schemas);
        drop(schemas);

        removed.shutdown();
        let listeners = self.listeners.remove_statement(name);
        info!(statement = %name, listeners, "statement destroyed");
        Ok(())
    }

    pub fn statement_names(&self) -> Vec<String> {
        self.statements
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    fn require_statement(&self, name: &str) -> EngineResult<()> {
        let statements = self.statements.read().unwrap_or_else(|e| e.into_inner());
        if statements.contains_key(name) {
            Ok(())
        } else {
            Err(EngineError::UnknownStatement(name.to_string()))
        }
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    pub fn add_listener<L>(&self, statement: &str, listener: L) -> EngineResult<ListenerId>
    where
        L: Listener + 'static,
    {
        self.require_statement(statement)?;
        Ok(self.listeners.add(statement, Arc::new(listener)))
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Channel receiving every batch of `statement`.
    pub fn subscribe(&self, statement: &str) -> EngineResult<mpsc::UnboundedReceiver<ResultBatch>> {
        self.require_statement(statement)?;
        Ok(self.listeners.subscribe(statement))
    }

    // =========================================================================
    // Event processing
    // =========================================================================

    pub fn submit_event(&self, event: Event) -> EngineResult<SubmitReport> {
        if self.event_type(&event.event_type).is_none() {
            return Err(EngineError::UnknownEventType(event.event_type.to_string()));
        }
        debug!(event_type = %event.event_type, fields = event.data.len(), "event submitted");

        let mut tick = Tick::default();
        let mut report = SubmitReport::default();
        let mut queue: VecDeque<(SharedEvent, usize)> = VecDeque::new();
        queue.push_back((Arc::new(event), 0));

        while let Some((event, depth)) = queue.pop_front() {
            for (statement, stream) in self.routes_for(&event.event_type).iter() {
                let Some(output) = statement.process(*stream, &event) else {
                    continue;
                };
                for emitted in tick.absorb(statement.shared_name(), output) {
                    if depth >= self.config.max_cascade_depth {
                        warn!(
                            statement = %statement.name(),
                            event_type = %emitted.event_type,
                            depth,
                            "cascade depth exceeded, event dropped"
                        );
                        report.dropped += 1;
                        continue;
                    }
                    report.cascaded += 1;
                    queue.push_back((Arc::new(emitted), depth + 1));
                }
            }
        }

        self.finish(tick, report)
    }

    /// Expire time-based windows of every statement as of `now`.
    pub fn advance_watermark(&self, now: DateTime<Utc>) -> EngineResult<SubmitReport> {
        debug!(watermark = %now, "watermark advanced");
        let statements: Vec<Arc<Statement>> = self
            .statements
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut tick = Tick::default();
        for statement in &statements {
            if let Some(output) = statement.advance_watermark(now) {
                tick.absorb(statement.shared_name(), output);
            }
        }
        self.finish(tick, SubmitReport::default())
    }

    fn finish(&self, tick: Tick, mut report: SubmitReport) -> EngineResult<SubmitReport> {
        report.conflicts = tick.conflicts;
        let mut batches: Vec<ResultBatch> = tick.batches.into_values().collect();
        {
            // Cascades can make a later statement produce rows first.
            let statements = self.statements.read().unwrap_or_else(|e| e.into_inner());
            batches.sort_by_key(|b| statements.get_index_of(&*b.statement).unwrap_or(usize::MAX));
        }
        for batch in batches {
            self.listeners.deliver(&batch);
            report.batches.push(batch);
        }
        Ok(report)
    }

    fn routes_for(&self, event_type: &str) -> Arc<[Route]> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .cloned()
            .unwrap_or_else(|| Arc::from(Vec::new()))
    }

    /// Recompute event type to statement routes. Callers hold the schema
    /// lock, which keeps registrations from racing the rebuild.
    fn rebuild_routes(&self, schemas: &SchemaRegistry) {
        let statements = self.statements.read().unwrap_or_else(|e| e.into_inner());
        let mut routes: Routes = FxHashMap::default();
        for event_type in schemas.names() {
            let mut targets: Vec<Route> = Vec::new();
            for statement in statements.values() {
                for (stream, input) in statement.inputs().iter().enumerate() {
                    if schemas.inherits(event_type, input) {
                        targets.push((Arc::clone(statement), stream));
                    }
                }
            }
            if !targets.is_empty() {
                routes.insert(event_type.to_string(), Arc::from(targets));
            }
        }
        *self.routes.write().unwrap_or_else(|e| e.into_inner()) = routes;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("statements", &self.statement_names())
            .finish()
    }
}

/// Register an event type produced by `insert into`, or check an existing
/// registration can hold it. Returns true when the type was newly registered.
fn register_derived(
    schemas: &mut SchemaRegistry,
    tables: &Tables,
    def: &EventTypeDef,
) -> Result<bool, ValidationError> {
    if tables.contains_key(&def.name) {
        return Err(ValidationError::invalid(format!(
            "insert into '{}' names a table, not an event type",
            def.name
        )));
    }
    let Some(existing) = schemas.get(&def.name) else {
        schemas.register(def.clone())?;
        return Ok(true);
    };
    for (field, ty) in &def.fields {
        match existing.field_type(field) {
            Some(declared) if declared.accepts(ty) => {}
            Some(declared) => {
                return Err(ValidationError::mismatch(
                    format!("{}.{}", def.name, field),
                    declared.to_string(),
                    ty.clone(),
                ))
            }
            None => {
                return Err(ValidationError::UnknownProperty {
                    expr: format!("insert into {}", def.name),
                    property: field.clone(),
                })
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vigil_core::{Expr, SelectDef, StreamSpec, Type};

    fn engine() -> Engine {
        let engine = Engine::default();
        engine
            .register_event_type(
                EventTypeDef::new("SupportBean")
                    .field("theString", Type::Str)
                    .field("intPrimitive", Type::Int),
            )
            .unwrap();
        engine
    }

    fn bean(id: &str, value: i64) -> Event {
        Event::new("SupportBean")
            .with_field("theString", id)
            .with_field("intPrimitive", value)
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.submit_event(Event::new("Nope")),
            Err(EngineError::UnknownEventType(_))
        ));
    }

    #[test]
    fn test_duplicate_and_unknown_statement() {
        let engine = engine();
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean")).select_all();
        engine.compile_statement("s", def.clone().into()).unwrap();
        assert!(matches!(
            engine.compile_statement("s", def.into()),
            Err(EngineError::DuplicateStatement(_))
        ));
        assert!(matches!(
            engine.destroy_statement("missing"),
            Err(EngineError::UnknownStatement(_))
        ));
        assert!(engine.subscribe("missing").is_err());
    }

    #[test]
    fn test_supertype_statement_receives_subtype_events() {
        let engine = engine();
        engine
            .register_event_type(EventTypeDef::new("SubBean").inherits("SupportBean"))
            .unwrap();
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean"))
            .select(Expr::ident("intPrimitive"), "v");
        engine.compile_statement("s", def.into()).unwrap();

        let sub = Event::new("SubBean")
            .with_field("theString", "x")
            .with_field("intPrimitive", 7i64);
        let report = engine.submit_event(sub).unwrap();
        assert_eq!(report.new_rows(), 1);
    }

    #[test]
    fn test_listener_sees_one_batch_per_tick() {
        let engine = engine();
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean"))
            .select(Expr::ident("intPrimitive"), "v")
            .where_clause(Expr::ident("intPrimitive").gt(Expr::lit(0i64)));
        engine.compile_statement("s", def.into()).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine
            .add_listener("s", move |batch: &ResultBatch| -> anyhow::Result<()> {
                assert_eq!(batch.new_rows.len(), 1);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        engine.submit_event(bean("a", 1)).unwrap();
        engine.submit_event(bean("b", -1)).unwrap();
        engine.submit_event(bean("c", 2)).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_remove_event_type_in_use() {
        let engine = engine();
        let def = SelectDef::from_stream(StreamSpec::new("SupportBean")).select_all();
        engine.compile_statement("s", def.into()).unwrap();
        assert!(matches!(
            engine.remove_event_type("SupportBean"),
            Err(EngineError::InUse { .. })
        ));
        engine.destroy_statement("s").unwrap();
        engine.remove_event_type("SupportBean").unwrap();
        assert!(engine.event_type("SupportBean").is_none());
    }

    #[test]
    fn test_table_name_cannot_shadow_event_type() {
        let engine = engine();
        let def = TableDef::new("SupportBean").key("k", Type::Str);
        assert!(matches!(
            engine.create_table(&def),
            Err(EngineError::Validation(ValidationError::InvalidStatement(_)))
        ));
    }
}
