//! Incremental aggregation state.
//!
//! Aggregations are maintained with an add/remove contract: a window reports
//! every event entering it (`add`) and every event leaving it (`remove`), and
//! each accumulator updates its running value in O(1) (window(*) removal is
//! linear in the retained events) without rescanning what is retained.
//!
//! # Available Aggregations
//!
//! | Function      | add                  | remove                        | Empty value |
//! |---------------|----------------------|-------------------------------|-------------|
//! | `count(*)`    | increment            | decrement                     | `0`         |
//! | `count(expr)` | increment if non-null| decrement if non-null         | `0`         |
//! | `sum(expr)`   | add                  | subtract                      | `null`      |
//! | `avg(expr)`   | add to sum and count | subtract from sum and count   | `null`      |
//! | `window(*)`   | append event         | remove the *same* event (`Arc::ptr_eq`) | `[]` |
//!
//! Integer sums use wrapping arithmetic so that every `remove` exactly
//! reverses its `add`.
//!
//! # Group State
//!
//! [`AggregationTable`] keys one [`GroupState`] per group key. A group is
//! created by its first `add` and deleted when its last live member is
//! removed; a later `add` starts it again from empty accumulators.

use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;
use vigil_core::{AggFunc, GroupKey, SharedEvent, Type, Value};

/// Compiled description of one aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorSpec {
    pub func: AggFunc,
    /// Type of the aggregated argument; `None` for `*`
    pub arg_type: Option<Type>,
}

impl AggregatorSpec {
    pub fn new(func: AggFunc, arg_type: Option<Type>) -> Self {
        Self { func, arg_type }
    }

    /// Static type of the aggregated value.
    pub fn result_type(&self) -> Type {
        match self.func {
            AggFunc::Count => Type::Int,
            AggFunc::Sum => match self.arg_type {
                Some(Type::Int) => Type::Int,
                Some(Type::Float) => Type::Float,
                _ => Type::Any,
            },
            AggFunc::Avg => Type::Float,
            AggFunc::Window => match &self.arg_type {
                Some(Type::Named(name)) => Type::events(name.clone()),
                _ => Type::array_of(Type::Any),
            },
        }
    }

    pub fn accumulator(&self) -> Accumulator {
        match self.func {
            AggFunc::Count => Accumulator::Count {
                count: 0,
                star: self.arg_type.is_none(),
            },
            AggFunc::Sum => Accumulator::Sum {
                int_total: 0,
                float_total: 0.0,
                count: 0,
                integral: matches!(self.arg_type, Some(Type::Int)),
            },
            AggFunc::Avg => Accumulator::Avg {
                total: 0.0,
                count: 0,
            },
            AggFunc::Window => Accumulator::Window {
                events: VecDeque::new(),
            },
        }
    }
}

/// Running value of one aggregation
#[derive(Debug, Clone)]
pub enum Accumulator {
    Count {
        count: i64,
        star: bool,
    },
    Sum {
        int_total: i64,
        float_total: f64,
        count: i64,
        integral: bool,
    },
    Avg {
        total: f64,
        count: i64,
    },
    Window {
        events: VecDeque<SharedEvent>,
    },
}

impl Accumulator {
    pub fn add(&mut self, input: &Value) {
        match self {
            Accumulator::Count { count, star } => {
                if *star || !input.is_null() {
                    *count += 1;
                }
            }
            Accumulator::Sum {
                int_total,
                float_total,
                count,
                integral,
            } => {
                if *integral {
                    if let Some(n) = input.as_int() {
                        *int_total = int_total.wrapping_add(n);
                        *count += 1;
                    }
                } else if let Some(x) = input.as_float() {
                    *float_total += x;
                    *count += 1;
                }
            }
            Accumulator::Avg { total, count } => {
                if let Some(x) = input.as_float() {
                    *total += x;
                    *count += 1;
                }
            }
            Accumulator::Window { events } => {
                if let Value::Event(e) = input {
                    events.push_back(Arc::clone(e));
                }
            }
        }
    }

    /// Reverse a prior `add` of the same input.
    pub fn remove(&mut self, input: &Value) {
        match self {
            Accumulator::Count { count, star } => {
                if (*star || !input.is_null()) && *count > 0 {
                    *count -= 1;
                }
            }
            Accumulator::Sum {
                int_total,
                float_total,
                count,
                integral,
            } => {
                if *integral {
                    if let Some(n) = input.as_int() {
                        *int_total = int_total.wrapping_sub(n);
                        *count -= 1;
                    }
                } else if let Some(x) = input.as_float() {
                    *float_total -= x;
                    *count -= 1;
                }
                if *count <= 0 {
                    *count = 0;
                    *int_total = 0;
                    *float_total = 0.0;
                }
            }
            Accumulator::Avg { total, count } => {
                if let Some(x) = input.as_float() {
                    *total -= x;
                    *count -= 1;
                }
                if *count <= 0 {
                    *count = 0;
                    *total = 0.0;
                }
            }
            Accumulator::Window { events } => {
                if let Value::Event(e) = input {
                    if let Some(pos) = events.iter().position(|held| Arc::ptr_eq(held, e)) {
                        events.remove(pos);
                    }
                }
            }
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Accumulator::Count { count, .. } => Value::Int(*count),
            Accumulator::Sum {
                int_total,
                float_total,
                count,
                integral,
            } => {
                if *count == 0 {
                    Value::Null
                } else if *integral {
                    Value::Int(*int_total)
                } else {
                    Value::Float(*float_total)
                }
            }
            Accumulator::Avg { total, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Float(*total / *count as f64)
                }
            }
            Accumulator::Window { events } => {
                Value::Array(events.iter().cloned().map(Value::Event).collect())
            }
        }
    }
}

/// Accumulators of one group plus the number of live members feeding them
#[derive(Debug, Clone)]
pub struct GroupState {
    accumulators: Vec<Accumulator>,
    members: usize,
}

impl GroupState {
    pub fn values(&self) -> Vec<Value> {
        self.accumulators.iter().map(Accumulator::value).collect()
    }

    pub fn members(&self) -> usize {
        self.members
    }
}

/// Per-group aggregation state of one statement instance.
///
/// Not synchronized itself: the owning statement instance is locked for the
/// whole add/remove/read sequence of one event.
#[derive(Debug)]
pub struct AggregationTable {
    specs: Arc<[AggregatorSpec]>,
    groups: FxHashMap<GroupKey, GroupState>,
}

impl AggregationTable {
    pub fn new(specs: Arc<[AggregatorSpec]>) -> Self {
        Self {
            specs,
            groups: FxHashMap::default(),
        }
    }

    /// Feed one event's aggregation inputs (one per spec) into its group.
    pub fn add(&mut self, key: &GroupKey, inputs: &[Value]) {
        let specs = &self.specs;
        let state = self
            .groups
            .entry(key.clone())
            .or_insert_with(|| GroupState {
                accumulators: specs.iter().map(AggregatorSpec::accumulator).collect(),
                members: 0,
            });
        for (acc, input) in state.accumulators.iter_mut().zip(inputs) {
            acc.add(input);
        }
        state.members += 1;
    }

    /// Take back inputs previously added to `key`. Returns false when the
    /// group holds no state.
    pub fn remove(&mut self, key: &GroupKey, inputs: &[Value]) -> bool {
        let Some(state) = self.groups.get_mut(key) else {
            debug!(group = %key, "remove for a group without aggregation state");
            return false;
        };
        for (acc, input) in state.accumulators.iter_mut().zip(inputs) {
            acc.remove(input);
        }
        state.members = state.members.saturating_sub(1);
        if state.members == 0 {
            self.groups.remove(key);
        }
        true
    }

    /// Current aggregate values of a group, `None` when it has no state.
    pub fn values(&self, key: &GroupKey) -> Option<Vec<Value>> {
        self.groups.get(key).map(GroupState::values)
    }

    /// Values reported for a group without state.
    pub fn empty_values(&self) -> Vec<Value> {
        self.specs
            .iter()
            .map(|spec| spec.accumulator().value())
            .collect()
    }

    pub fn group(&self, key: &GroupKey) -> Option<&GroupState> {
        self.groups.get(key)
    }

    pub fn contains(&self, key: &GroupKey) -> bool {
        self.groups.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
