//! Event type schemas and the registry that owns them
//!
//! An [`EventType`] is immutable once registered. A type may declare one or
//! more supertypes; registration copies the supertype fields ahead of the
//! type's own fields, so every subtype is a structural superset of each of
//! its supertypes. Conflicting redeclarations are rejected.
//!
//! | Operation                | Behavior                                            |
//! |--------------------------|-----------------------------------------------------|
//! | `register`               | idempotent for an identical definition              |
//! | `remove`                 | refused while another type inherits from it         |
//! | `inherits(sub, sup)`     | same name, or `sup` among `sub`'s ancestors         |
//! | `is_assignable(sub, sup)`| `inherits`, or `sub` is a structural superset       |

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ValidationError, ValidationResult};
use crate::types::Type;

/// A named, typed field of an event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: Type,
}

/// A registered event schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventType {
    name: String,
    fields: Vec<FieldDef>,
    supertypes: Vec<String>,
}

impl EventType {
    /// Builds a schema without registering it. Used for derived types such
    /// as statement output rows and table rows.
    pub fn anonymous(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
            supertypes: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_type(&self, name: &str) -> Option<&Type> {
        self.field(name).map(|f| &f.ty)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn supertypes(&self) -> &[String] {
        &self.supertypes
    }

    /// Whether `self` carries every field of `other` with a compatible type.
    pub fn is_superset_of(&self, other: &EventType) -> bool {
        other.fields.iter().all(|f| {
            self.field_type(&f.name)
                .map(|ty| f.ty.accepts(ty))
                .unwrap_or(false)
        })
    }
}

/// Declaration handed to [`SchemaRegistry::register`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTypeDef {
    pub name: String,
    pub fields: Vec<(String, Type)>,
    #[serde(default)]
    pub supertypes: Vec<String>,
}

impl EventTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn field(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.fields.push((name.into(), ty));
        self
    }

    pub fn inherits(mut self, supertype: impl Into<String>) -> Self {
        self.supertypes.push(supertype.into());
        self
    }
}

/// Registry of event types by name
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    types: FxHashMap<String, Arc<EventType>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, def: EventTypeDef) -> ValidationResult<Arc<EventType>> {
        let conflict = |reason: String| ValidationError::EventTypeConflict {
            name: def.name.clone(),
            reason,
        };

        let mut fields: Vec<FieldDef> = Vec::new();
        for sup in &def.supertypes {
            let parent = self
                .types
                .get(sup)
                .ok_or_else(|| ValidationError::UnknownEventType(sup.clone()))?;
            for f in &parent.fields {
                match fields.iter().find(|existing| existing.name == f.name) {
                    Some(existing) if existing.ty != f.ty => {
                        return Err(conflict(format!(
                            "field '{}' is inherited as both {} and {}",
                            f.name, existing.ty, f.ty
                        )))
                    }
                    Some(_) => {}
                    None => fields.push(f.clone()),
                }
            }
        }

        for (name, ty) in &def.fields {
            if let Some(event_type) = ty.event_type_name() {
                if event_type != def.name && !self.types.contains_key(event_type) {
                    return Err(ValidationError::UnknownEventType(event_type.to_string()));
                }
            }
            match fields.iter().find(|existing| &existing.name == name) {
                Some(existing) if &existing.ty != ty => {
                    return Err(conflict(format!(
                        "field '{}' is declared as {} but inherited as {}",
                        name, ty, existing.ty
                    )))
                }
                Some(_) => {}
                None => fields.push(FieldDef {
                    name: name.clone(),
                    ty: ty.clone(),
                }),
            }
        }

        let candidate = EventType {
            name: def.name.clone(),
            fields,
            supertypes: def.supertypes.clone(),
        };

        if let Some(existing) = self.types.get(&def.name) {
            if **existing == candidate {
                return Ok(existing.clone());
            }
            return Err(conflict("a different schema is already registered".into()));
        }

        let registered = Arc::new(candidate);
        self.types.insert(def.name, registered.clone());
        Ok(registered)
    }

    pub fn remove(&mut self, name: &str) -> ValidationResult<Arc<EventType>> {
        if let Some(child) = self
            .types
            .values()
            .find(|t| t.supertypes.iter().any(|s| s == name))
        {
            return Err(ValidationError::EventTypeConflict {
                name: name.to_string(),
                reason: format!("event type '{}' inherits from it", child.name),
            });
        }
        self.types
            .remove(name)
            .ok_or_else(|| ValidationError::UnknownEventType(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<EventType>> {
        self.types.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> ValidationResult<Arc<EventType>> {
        self.get(name)
            .ok_or_else(|| ValidationError::UnknownEventType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Whether events of type `sub` may be used where `sup` is expected:
    /// declared inheritance, or `sub` carries every field of `sup`.
    pub fn is_assignable(&self, sub: &str, sup: &str) -> bool {
        if self.inherits(sub, sup) {
            return true;
        }
        match (self.types.get(sub), self.types.get(sup)) {
            (Some(sub), Some(sup)) => sub.is_superset_of(sup),
            _ => false,
        }
    }

    /// Whether `sub` is `sup` or declares it as an ancestor.
    pub fn inherits(&self, sub: &str, sup: &str) -> bool {
        if sub == sup {
            return true;
        }
        let mut seen = FxHashSet::default();
        let mut pending = vec![sub];
        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(t) = self.types.get(current) {
                for parent in &t.supertypes {
                    if parent == sup {
                        return true;
                    }
                    pending.push(parent.as_str());
                }
            }
        }
        false
    }

    /// Whether any registered field references `name` as a nested event type.
    pub fn is_referenced(&self, name: &str) -> bool {
        self.types.values().any(|t| {
            t.name != name
                && t.fields
                    .iter()
                    .any(|f| f.ty.event_type_name() == Some(name))
        })
    }
}
