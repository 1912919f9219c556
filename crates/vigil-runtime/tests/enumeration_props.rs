//! Property-based tests for the enumeration operations.
//!
//! Covers: except/intersect partitioning, union concatenation, absent-input
//! propagation, ordering stability and take bounds.

use proptest::prelude::*;
use vigil_core::Value;
use vigil_runtime::enumeration::{except, intersect, order_by, take, take_last, union};

/// Small ints so that duplicates and overlaps are common.
fn arb_values() -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec((0i64..6).prop_map(Value::Int), 0..20)
}

proptest! {
    /// Every element of `a` lands in exactly one of except/intersect, and
    /// merging them back in input order rebuilds `a`.
    #[test]
    fn except_and_intersect_partition(a in arb_values(), b in arb_values()) {
        let kept = except(Some(&a[..]), Some(&b[..])).unwrap();
        let shared = intersect(Some(&a[..]), Some(&b[..])).unwrap();
        prop_assert_eq!(kept.len() + shared.len(), a.len());

        let (mut k, mut s) = (kept.iter(), shared.iter());
        for item in &a {
            if b.contains(item) {
                prop_assert_eq!(s.next(), Some(item));
            } else {
                prop_assert_eq!(k.next(), Some(item));
            }
        }
    }

    #[test]
    fn self_difference_is_empty(a in arb_values()) {
        prop_assert!(except(Some(&a[..]), Some(&a[..])).unwrap().is_empty());
        prop_assert_eq!(intersect(Some(&a[..]), Some(&a[..])).unwrap(), a);
    }

    #[test]
    fn union_concatenates(a in arb_values(), b in arb_values()) {
        let joined = union(Some(&a[..]), Some(&b[..])).unwrap();
        prop_assert_eq!(joined.len(), a.len() + b.len());
        prop_assert_eq!(&joined[..a.len()], &a[..]);
        prop_assert_eq!(&joined[a.len()..], &b[..]);
    }

    #[test]
    fn absent_input_gives_absent_result(a in arb_values()) {
        prop_assert!(except(Some(&a[..]), None).is_none());
        prop_assert!(except(None, Some(&a[..])).is_none());
        prop_assert!(intersect(None, Some(&a[..])).is_none());
        prop_assert!(union(Some(&a[..]), None).is_none());
    }

    /// Ties keep their input order whichever direction is sorted.
    #[test]
    fn order_by_is_stable(keys in prop::collection::vec(0i64..4, 0..30), descending in any::<bool>()) {
        let items: Vec<Value> = (0..keys.len() as i64).map(Value::Int).collect();
        let key_values: Vec<Value> = keys.iter().copied().map(Value::Int).collect();
        let sorted = order_by(&items, &key_values, descending);
        prop_assert_eq!(sorted.len(), items.len());

        let positions: Vec<usize> = sorted
            .iter()
            .map(|v| v.as_int().unwrap() as usize)
            .collect();
        for pair in positions.windows(2) {
            let (ka, kb) = (keys[pair[0]], keys[pair[1]]);
            if ka == kb {
                prop_assert!(pair[0] < pair[1]);
            } else if descending {
                prop_assert!(ka > kb);
            } else {
                prop_assert!(ka < kb);
            }
        }
    }

    #[test]
    fn take_bounds(a in arb_values(), n in -3i64..30) {
        let first = take(&a, n);
        let last = take_last(&a, n);
        let expected = n.clamp(0, a.len() as i64) as usize;
        prop_assert_eq!(first.len(), expected);
        prop_assert_eq!(last.len(), expected);
        prop_assert_eq!(&first[..], &a[..expected]);
        prop_assert_eq!(&last[..], &a[a.len() - expected..]);
    }
}
