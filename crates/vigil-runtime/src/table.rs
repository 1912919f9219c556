//! Named tables
//!
//! A [`NamedTable`] is a keyed row store shared between statements. Rows are
//! keyed by the tuple of their primary-key column values and sharded by that
//! key (see [`Sharded`]), so writers on different keys do not contend.
//!
//! | Column kind | Cell                      | Written by                      |
//! |-------------|---------------------------|---------------------------------|
//! | key         | value, fixed at insertion | merge `insert`, into-table rows |
//! | plain       | value                     | merge `insert` / `update`       |
//! | aggregate   | [`Accumulator`]           | into-table statements           |
//!
//! Readers get immutable snapshots: a row is rendered into a [`SharedEvent`]
//! named after the table, so a snapshot taken before a mutation never
//! changes afterwards.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use vigil_core::{
    AggFunc, ColumnKind, Event, EventType, FieldDef, FxIndexMap, GroupKey, SchemaRegistry,
    SharedEvent, TableDef, Type, ValidationError, ValidationResult, Value,
};

use crate::aggregation::{Accumulator, AggregatorSpec};
use crate::shard::Sharded;

/// Compiled column content
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnSlot {
    Key(Type),
    Plain(Type),
    Aggregate(AggregatorSpec),
}

#[derive(Debug, Clone)]
pub struct TableColumn {
    pub name: String,
    pub slot: ColumnSlot,
}

impl TableColumn {
    pub fn ty(&self) -> Type {
        match &self.slot {
            ColumnSlot::Key(ty) | ColumnSlot::Plain(ty) => ty.clone(),
            ColumnSlot::Aggregate(spec) => spec.result_type(),
        }
    }

    pub fn is_key(&self) -> bool {
        matches!(self.slot, ColumnSlot::Key(_))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.slot, ColumnSlot::Aggregate(_))
    }
}

#[derive(Debug, Clone)]
pub enum Cell {
    Plain(Value),
    Agg(Accumulator),
}

impl Cell {
    pub fn value(&self) -> Value {
        match self {
            Cell::Plain(v) => v.clone(),
            Cell::Agg(acc) => acc.value(),
        }
    }
}

/// One row; cells are parallel to the table's columns
#[derive(Debug, Clone)]
pub struct TableRow {
    cells: Vec<Cell>,
    updated: DateTime<Utc>,
}

impl TableRow {
    pub fn get(&self, column: usize) -> Value {
        self.cells.get(column).map(Cell::value).unwrap_or(Value::Null)
    }

    /// Assign a plain cell. Aggregate cells are left untouched.
    pub fn set(&mut self, column: usize, value: Value) {
        if let Some(cell @ Cell::Plain(_)) = self.cells.get_mut(column) {
            *cell = Cell::Plain(value);
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.updated = at;
    }

    pub fn cells_mut(&mut self) -> &mut [Cell] {
        &mut self.cells
    }
}

/// Old and new snapshots of a row mutation
#[derive(Debug, Clone, Default)]
pub struct RowChange {
    pub old: Option<SharedEvent>,
    pub new: Option<SharedEvent>,
}

#[derive(Debug)]
pub struct NamedTable {
    name: Arc<str>,
    columns: Vec<TableColumn>,
    key_columns: Vec<usize>,
    row_type: Arc<EventType>,
    rows: Sharded<TableRow>,
}

impl NamedTable {
    /// Validate a table definition against the registered event types.
    pub fn new(def: &TableDef, schemas: &SchemaRegistry, shards: usize) -> ValidationResult<Self> {
        let invalid = |column: &str, message: String| ValidationError::InvalidColumn {
            table: def.name.clone(),
            column: column.to_string(),
            message,
        };

        let mut columns: Vec<TableColumn> = Vec::with_capacity(def.columns.len());
        for col in &def.columns {
            if columns.iter().any(|c| c.name == col.name) {
                return Err(invalid(&col.name, "is declared more than once".into()));
            }
            let slot = match (&col.kind, col.primary_key) {
                (ColumnKind::Plain(ty), true) => {
                    if !ty.is_comparable() || ty.is_dynamic() {
                        return Err(invalid(
                            &col.name,
                            format!("cannot be a primary key of type {}", ty),
                        ));
                    }
                    ColumnSlot::Key(ty.clone())
                }
                (ColumnKind::Plain(ty), false) => {
                    if let Some(event_type) = ty.event_type_name() {
                        schemas.require(event_type)?;
                    }
                    ColumnSlot::Plain(ty.clone())
                }
                (ColumnKind::Aggregate { .. }, true) => {
                    return Err(invalid(&col.name, "is an aggregation and cannot be a primary key".into()))
                }
                (ColumnKind::Aggregate { func, arg_type }, false) => {
                    let spec = match func {
                        AggFunc::Count => AggregatorSpec::new(AggFunc::Count, None),
                        AggFunc::Sum | AggFunc::Avg if arg_type.is_numeric() => {
                            AggregatorSpec::new(*func, Some(arg_type.clone()))
                        }
                        AggFunc::Sum | AggFunc::Avg => {
                            return Err(invalid(
                                &col.name,
                                format!("aggregates {} over non-numeric {}", func.name(), arg_type),
                            ))
                        }
                        AggFunc::Window => match arg_type {
                            Type::Named(event_type) => {
                                schemas.require(event_type)?;
                                AggregatorSpec::new(AggFunc::Window, Some(arg_type.clone()))
                            }
                            other => {
                                return Err(invalid(
                                    &col.name,
                                    format!("window(*) requires an event type but receives {}", other),
                                ))
                            }
                        },
                    };
                    ColumnSlot::Aggregate(spec)
                }
            };
            columns.push(TableColumn {
                name: col.name.clone(),
                slot,
            });
        }

        let key_columns = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_key())
            .map(|(i, _)| i)
            .collect();
        let fields = columns
            .iter()
            .map(|c| FieldDef {
                name: c.name.clone(),
                ty: c.ty(),
            })
            .collect();
        let row_type = Arc::new(EventType::anonymous(def.name.clone(), fields));

        Ok(Self {
            name: Arc::from(def.name.as_str()),
            columns,
            key_columns,
            row_type,
            rows: Sharded::new(shards),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn row_type(&self) -> &Arc<EventType> {
        &self.row_type
    }

    pub fn columns(&self) -> &[TableColumn] {
        &self.columns
    }

    pub fn column(&self, index: usize) -> Option<&TableColumn> {
        self.columns.get(index)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_type(&self, index: usize) -> Type {
        self.columns.get(index).map(TableColumn::ty).unwrap_or(Type::Unknown)
    }

    /// Positions of the primary-key columns, in key order.
    pub fn key_columns(&self) -> &[usize] {
        &self.key_columns
    }

    pub fn key_types(&self) -> Vec<Type> {
        self.key_columns.iter().map(|&i| self.column_type(i)).collect()
    }

    /// Event types referenced by window or plain event columns.
    pub fn referenced_event_types(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().filter_map(|c| match &c.slot {
            ColumnSlot::Aggregate(spec) => spec.arg_type.as_ref().and_then(Type::event_type_name),
            ColumnSlot::Plain(ty) | ColumnSlot::Key(ty) => ty.event_type_name(),
        })
    }

    pub(crate) fn rows(&self) -> &Sharded<TableRow> {
        &self.rows
    }

    /// A fresh row for `key`: key cells set, plain cells null, aggregations
    /// empty.
    pub fn new_row(&self, key: &GroupKey, at: DateTime<Utc>) -> TableRow {
        let mut key_parts = key.parts().iter();
        let cells = self
            .columns
            .iter()
            .map(|c| match &c.slot {
                ColumnSlot::Key(_) => Cell::Plain(key_parts.next().cloned().unwrap_or_default()),
                ColumnSlot::Plain(_) => Cell::Plain(Value::Null),
                ColumnSlot::Aggregate(spec) => Cell::Agg(spec.accumulator()),
            })
            .collect();
        TableRow { cells, updated: at }
    }

    /// Primary key from evaluated key expressions, each converted to its
    /// column's declared type so `1` and `1.0` address the same row.
    pub fn key_from(&self, values: impl IntoIterator<Item = Value>) -> GroupKey {
        self.key_columns
            .iter()
            .zip(values)
            .map(|(&i, v)| v.coerce_to(&self.column_type(i)))
            .collect()
    }

    /// `value` converted to the declared type of `column`.
    pub fn coerce(&self, column: usize, value: Value) -> Value {
        value.coerce_to(&self.column_type(column))
    }

    /// Primary key of a row.
    pub fn key_of(&self, row: &TableRow) -> GroupKey {
        self.key_columns.iter().map(|&i| row.get(i)).collect()
    }

    /// Immutable rendering of a row.
    pub fn snapshot(&self, row: &TableRow) -> SharedEvent {
        let mut data = FxIndexMap::with_capacity_and_hasher(self.columns.len(), Default::default());
        for (i, col) in self.columns.iter().enumerate() {
            data.insert(col.name.clone(), row.get(i));
        }
        Arc::new(Event::from_fields(Arc::clone(&self.name), row.updated, data))
    }

    pub fn lookup(&self, key: &GroupKey) -> Option<SharedEvent> {
        let shard = self.rows.read(key);
        shard.get(key).map(|row| self.snapshot(row))
    }

    pub fn read_column(&self, key: &GroupKey, column: usize) -> Value {
        let shard = self.rows.read(key);
        shard.get(key).map(|row| row.get(column)).unwrap_or(Value::Null)
    }

    /// Snapshots of every row, shard by shard.
    pub fn snapshot_rows(&self) -> Vec<SharedEvent> {
        self.rows
            .read_all()
            .iter()
            .flat_map(|shard| shard.values().map(|row| self.snapshot(row)).collect::<Vec<_>>())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Feed aggregation inputs into the row of `key`, creating it if absent.
    /// `columns[i]` receives `inputs[i]`.
    pub fn aggregate_add(
        &self,
        key: &GroupKey,
        columns: &[usize],
        inputs: &[Value],
        at: DateTime<Utc>,
    ) -> RowChange {
        let mut shard = self.rows.write(key);
        let old = shard.get(key).map(|row| self.snapshot(row));
        let row = shard
            .entry(key.clone())
            .or_insert_with(|| self.new_row(key, at));
        apply_to_cells(row, columns, inputs, Accumulator::add);
        row.touch(at);
        RowChange {
            old,
            new: Some(self.snapshot(row)),
        }
    }

    /// Take back inputs previously added. A row deleted in the meantime is
    /// not recreated.
    pub fn aggregate_remove(
        &self,
        key: &GroupKey,
        columns: &[usize],
        inputs: &[Value],
        at: DateTime<Utc>,
    ) -> Option<RowChange> {
        let mut shard = self.rows.write(key);
        let row = shard.get_mut(key)?;
        let old = self.snapshot(row);
        apply_to_cells(row, columns, inputs, Accumulator::remove);
        row.touch(at);
        Some(RowChange {
            old: Some(old),
            new: Some(self.snapshot(row)),
        })
    }

    pub fn clear(&self) {
        for mut shard in self.rows.write_all() {
            shard.clear();
        }
    }
}

fn apply_to_cells(
    row: &mut TableRow,
    columns: &[usize],
    inputs: &[Value],
    op: fn(&mut Accumulator, &Value),
) {
    for (&column, input) in columns.iter().zip(inputs) {
        if let Some(Cell::Agg(acc)) = row.cells_mut().get_mut(column) {
            op(acc, input);
        }
    }
}
