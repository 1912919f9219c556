//! # Vigil Core
//!
//! Data model and construction contract for the Vigil continuous query engine.
//!
//! ## Modules
//!
//! - [`value`]: Runtime values, with `Null` standing for an absent value
//! - [`event`]: Immutable structured events shared through `Arc`
//! - [`key`]: Hashable value tuples for group, partition and primary keys
//! - [`types`]: Static types resolved when a statement is compiled
//! - [`schema`]: Event type schemas, inheritance and the schema registry
//! - [`ast`]: Typed expression and statement trees handed to the engine
//! - [`error`]: Validation errors raised at registration time
//!
//! ## Quick Start
//!
//! ```
//! use vigil_core::{Event, EventTypeDef, SchemaRegistry, Type, Value};
//!
//! let mut schemas = SchemaRegistry::new();
//! schemas
//!     .register(EventTypeDef::new("SupportBean").field("theString", Type::Str))
//!     .unwrap();
//!
//! let event = Event::new("SupportBean").with_field("theString", "E1");
//! assert_eq!(event.get("theString"), Some(&Value::from("E1")));
//! ```
//!
//! ## See Also
//!
//! - [`vigil_runtime`](../vigil_runtime): Compiling and running statements

pub mod ast;
pub mod error;
pub mod event;
pub mod key;
pub mod schema;
pub mod types;
pub mod value;

pub use ast::*;
pub use error::{ValidationError, ValidationResult};
pub use event::{Event, FxIndexMap, SharedEvent};
pub use key::GroupKey;
pub use schema::{EventType, EventTypeDef, FieldDef, SchemaRegistry};
pub use types::Type;
pub use value::Value;
