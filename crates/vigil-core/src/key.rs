//! Hashable value tuples for group keys, partition keys and table primary keys

use smallvec::SmallVec;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::value::Value;

/// A tuple of key values.
///
/// `Value` holds floats and records, so it is neither `Eq` nor `Hash`.
/// `GroupKey` hashes each part structurally (floats by bit pattern, with
/// `-0.0` folded into `0.0`) and compares parts with `PartialEq`, which is
/// enough for map keys as long as NaN never appears in a key (a NaN key
/// simply never matches itself).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupKey(SmallVec<[Value; 2]>);

impl GroupKey {
    /// The key of an ungrouped aggregation or an unkeyed table row.
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    pub fn single(value: Value) -> Self {
        let mut parts = SmallVec::new();
        parts.push(value);
        Self(parts)
    }

    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.0.len());
        for part in &self.0 {
            hash_value(part, state);
        }
    }
}

impl FromIterator<Value> for GroupKey {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<Vec<Value>> for GroupKey {
    fn from(v: Vec<Value>) -> Self {
        Self(SmallVec::from_vec(v))
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    std::mem::discriminant(value).hash(state);
    match value {
        Value::Null => {}
        Value::Bool(b) => b.hash(state),
        Value::Int(n) => n.hash(state),
        // -0.0 == 0.0, so both must hash alike.
        Value::Float(f) => (if *f == 0.0 { 0.0f64 } else { *f }).to_bits().hash(state),
        Value::Str(s) => s.hash(state),
        Value::Timestamp(ts) => ts.hash(state),
        Value::Array(items) => {
            state.write_usize(items.len());
            for item in items {
                hash_value(item, state);
            }
        }
        // Map and record equality ignore field order, so only the length
        // goes into the hash.
        Value::Map(m) => state.write_usize(m.len()),
        Value::Event(e) => state.write_usize(e.data.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    #[test]
    fn test_equal_keys_share_an_entry() {
        let mut map: FxHashMap<GroupKey, i32> = FxHashMap::default();
        let a: GroupKey = vec![Value::from("G1"), Value::Int(1)].into();
        let b: GroupKey = vec![Value::from("G1"), Value::Int(1)].into();
        map.insert(a, 1);
        *map.entry(b).or_insert(0) += 1;
        assert_eq!(map.len(), 1);
        assert_eq!(map.values().next(), Some(&2));
    }

    #[test]
    fn test_part_order_matters() {
        let a: GroupKey = vec![Value::from("x"), Value::from("y")].into();
        let b: GroupKey = vec![Value::from("y"), Value::from("x")].into();
        assert_ne!(a, b);
    }

    #[test]
    fn test_empty_key() {
        assert!(GroupKey::empty().is_empty());
        assert_eq!(GroupKey::empty(), GroupKey::default());
        assert_eq!(GroupKey::single(Value::Int(3)).len(), 1);
    }

    #[test]
    fn test_signed_zero_keys_collide() {
        let mut map: FxHashMap<GroupKey, i32> = FxHashMap::default();
        map.insert(GroupKey::single(Value::Float(0.0)), 1);
        assert_eq!(map.get(&GroupKey::single(Value::Float(-0.0))), Some(&1));
    }

    #[test]
    fn test_display() {
        let k: GroupKey = vec![Value::from("a"), Value::Null].into();
        assert_eq!(k.to_string(), "(\"a\", null)");
    }
}
