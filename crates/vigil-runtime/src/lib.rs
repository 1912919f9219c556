//! # Vigil Runtime
//!
//! Incremental evaluation engine for Vigil statements. Statements arrive as
//! typed [`vigil_core::StatementDef`] trees, are validated and compiled once,
//! then re-evaluated per event, emitting new and old rows to listeners.
//!
//! ## Modules
//!
//! | Module | Role |
//! |--------|------|
//! | [`enumeration`] | Set, ordering and take operations over value sequences |
//! | [`evaluator`] | Expression compiler and evaluator tree |
//! | [`aggregation`] | Add/remove accumulators and per-group state |
//! | [`window`] | Length, time and keep-all retention |
//! | [`join`] | Two-stream windowed join state |
//! | [`shard`] | Lock-sharded maps for partitions and table rows |
//! | [`table`] | Named tables with plain and aggregation columns |
//! | [`merge`] | `on ... merge` clauses against a table |
//! | [`statement`] | Compiled statements and their state |
//! | [`dispatch`] | Result batches, listeners and subscriptions |
//! | [`engine`] | The engine facade |
//! | [`config`] | Engine configuration and logging setup |
//!
//! ## Example
//!
//! ```
//! use vigil_core::{Event, EventTypeDef, Expr, SelectDef, StreamSpec, Type, WindowSpec};
//! use vigil_runtime::Engine;
//!
//! let engine = Engine::default();
//! engine
//!     .register_event_type(
//!         EventTypeDef::new("SupportBean")
//!             .field("theString", Type::Str)
//!             .field("intPrimitive", Type::Int),
//!     )
//!     .unwrap();
//!
//! let def = SelectDef::from_stream(StreamSpec::new("SupportBean").window(WindowSpec::Length(2)))
//!     .select(Expr::sum(Expr::ident("intPrimitive")), "total");
//! engine.compile_statement("totals", def.into()).unwrap();
//!
//! for value in [1i64, 2, 3] {
//!     engine
//!         .submit_event(Event::new("SupportBean").with_field("intPrimitive", value))
//!         .unwrap();
//! }
//! let report = engine
//!     .submit_event(Event::new("SupportBean").with_field("intPrimitive", 10i64))
//!     .unwrap();
//! let batch = report.batch("totals").unwrap();
//! assert_eq!(batch.old_rows[0].get_int("total"), Some(5));
//! assert_eq!(batch.new_rows[0].get_int("total"), Some(13));
//! ```

pub mod aggregation;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod enumeration;
pub mod error;
pub mod evaluator;
pub mod join;
pub mod merge;
pub mod shard;
pub mod statement;
pub mod table;
pub mod window;

pub use aggregation::{Accumulator, AggregationTable, AggregatorSpec};
pub use config::{init_logging, ConfigError, DuplicateKeyPolicy, EngineConfig, LoggingConfig};
pub use dispatch::{
    ChannelListener, JsonLinesListener, Listener, ListenerId, ListenerRegistry, ResultBatch,
};
pub use engine::{Engine, StatementHandle, SubmitReport};
pub use error::{EngineError, EngineResult, MergeConflict};
pub use table::NamedTable;
pub use window::RetentionWindow;
