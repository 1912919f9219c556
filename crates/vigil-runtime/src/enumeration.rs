//! Set, ordering and slicing operations over ordered sequences.
//!
//! Every function is pure: inputs are borrowed and never mutated, and results
//! are freshly allocated. An absent input (`None`) yields an absent result,
//! which is different from an empty input yielding an empty result.
//!
//! Set operations compare elements by value ([`Value::loose_eq`]): records
//! are equal when their fields are equal, whatever their identity. The `*_by`
//! variants compare a derived key instead.

use std::cmp::Ordering;
use vigil_core::Value;

/// Elements of `a` with no equal element in `b`, in `a`'s order.
/// Duplicates in `a` are tested independently.
pub fn except(a: Option<&[Value]>, b: Option<&[Value]>) -> Option<Vec<Value>> {
    except_by(a, b, |v| v.clone())
}

pub fn except_by<K>(a: Option<&[Value]>, b: Option<&[Value]>, key: K) -> Option<Vec<Value>>
where
    K: Fn(&Value) -> Value,
{
    let (a, b) = (a?, b?);
    let b_keys: Vec<Value> = b.iter().map(&key).collect();
    Some(
        a.iter()
            .filter(|item| {
                let k = key(*item);
                !b_keys.iter().any(|bk| bk.loose_eq(&k))
            })
            .cloned()
            .collect(),
    )
}

/// Elements of `a` with an equal element in `b`, in `a`'s order. Every
/// qualifying element is kept, duplicates included.
pub fn intersect(a: Option<&[Value]>, b: Option<&[Value]>) -> Option<Vec<Value>> {
    intersect_by(a, b, |v| v.clone())
}

pub fn intersect_by<K>(a: Option<&[Value]>, b: Option<&[Value]>, key: K) -> Option<Vec<Value>>
where
    K: Fn(&Value) -> Value,
{
    let (a, b) = (a?, b?);
    let b_keys: Vec<Value> = b.iter().map(&key).collect();
    Some(
        a.iter()
            .filter(|item| {
                let k = key(*item);
                b_keys.iter().any(|bk| bk.loose_eq(&k))
            })
            .cloned()
            .collect(),
    )
}

/// `a` followed by `b`, without removing duplicates.
pub fn union(a: Option<&[Value]>, b: Option<&[Value]>) -> Option<Vec<Value>> {
    let (a, b) = (a?, b?);
    let mut out = Vec::with_capacity(a.len() + b.len());
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    Some(out)
}

/// Stable sort of `items` by the parallel `keys`.
///
/// Descending order reverses the comparison, so ties keep their input order
/// in both directions. Keys without a natural order compare as equal.
pub fn order_by(items: &[Value], keys: &[Value], descending: bool) -> Vec<Value> {
    debug_assert_eq!(items.len(), keys.len());
    let mut indices: Vec<usize> = (0..items.len()).collect();
    indices.sort_by(|&i, &j| {
        let ord = keys[i].compare(&keys[j]).unwrap_or(Ordering::Equal);
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
    indices.into_iter().map(|i| items[i].clone()).collect()
}

/// Natural-order sort of scalar elements.
pub fn order_by_natural(items: &[Value], descending: bool) -> Vec<Value> {
    order_by(items, items, descending)
}

/// First `n` elements; `n <= 0` gives an empty sequence.
pub fn take(items: &[Value], n: i64) -> Vec<Value> {
    let n = usize::try_from(n).unwrap_or(0).min(items.len());
    items[..n].to_vec()
}

/// Last `n` elements in their original order.
pub fn take_last(items: &[Value], n: i64) -> Vec<Value> {
    let n = usize::try_from(n).unwrap_or(0).min(items.len());
    items[items.len() - n..].to_vec()
}

/// Sum of numeric values, skipping nulls. All-int input sums to an int,
/// anything with a float to a float, and no numeric input to null.
pub fn sum_values<'a, I>(values: I) -> Value
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut int_total: i64 = 0;
    let mut float_total = 0.0;
    let mut seen_float = false;
    let mut seen_any = false;
    for v in values {
        match v {
            Value::Int(n) => {
                seen_any = true;
                match int_total.checked_add(*n) {
                    Some(t) => int_total = t,
                    None => return Value::Null,
                }
            }
            Value::Float(x) => {
                seen_any = true;
                seen_float = true;
                float_total += x;
            }
            _ => {}
        }
    }
    if !seen_any {
        Value::Null
    } else if seen_float {
        Value::Float(float_total + int_total as f64)
    } else {
        Value::Int(int_total)
    }
}
