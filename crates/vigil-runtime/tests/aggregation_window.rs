//! Aggregations over retention windows, joins and partitions

use chrono::{DateTime, Duration, TimeZone, Utc};
use vigil_core::{
    AggFunc, Event, EventTypeDef, Expr, SelectDef, SharedEvent, StreamSpec, Type, Value,
    WindowSpec,
};
use vigil_runtime::{Engine, EngineError, ResultBatch};

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
        .register_event_type(
            EventTypeDef::new("Order")
                .field("orderId", Type::Str)
                .field("customer", Type::Str),
        )
        .unwrap();
    engine
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap()
}

fn bean(id: &str, value: i64) -> Event {
    Event::new("SupportBean")
        .with_field("theString", id)
        .with_field("intPrimitive", value)
}

fn bean_at(id: &str, value: i64, secs: i64) -> Event {
    bean(id, value).with_timestamp(t0() + Duration::seconds(secs))
}

fn ints(rows: &[SharedEvent], field: &str) -> Vec<Option<i64>> {
    rows.iter().map(|r| r.get_int(field)).collect()
}

fn only_batch<'a>(report: &'a vigil_runtime::SubmitReport, statement: &str) -> &'a ResultBatch {
    report
        .batch(statement)
        .unwrap_or_else(|| panic!("no batch for {}", statement))
}

// =============================================================================
// Sliding windows
// =============================================================================

#[test]
fn test_length_window_sum_tracks_retained_events() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean").window(WindowSpec::Length(2)))
        .select(Expr::sum(Expr::ident("intPrimitive")), "total")
        .select(Expr::count_star(), "n");
    engine.compile_statement("s", def.into()).unwrap();

    let r = engine.submit_event(bean("e1", 1)).unwrap();
    let b = only_batch(&r, "s");
    assert!(b.old_rows.is_empty());
    assert_eq!(ints(&b.new_rows, "total"), vec![Some(1)]);

    let r = engine.submit_event(bean("e2", 2)).unwrap();
    let b = only_batch(&r, "s");
    assert_eq!(ints(&b.old_rows, "total"), vec![Some(1)]);
    assert_eq!(ints(&b.new_rows, "total"), vec![Some(3)]);

    // e3 pushes e1 out: the sum is over {e2, e3}.
    let r = engine.submit_event(bean("e3", 4)).unwrap();
    let b = only_batch(&r, "s");
    assert_eq!(ints(&b.old_rows, "total"), vec![Some(3)]);
    assert_eq!(ints(&b.new_rows, "total"), vec![Some(6)]);
    assert_eq!(ints(&b.new_rows, "n"), vec![Some(2)]);
}

#[test]
fn test_plain_length_window_reports_evictions() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean").window(WindowSpec::Length(2)))
        .select(Expr::ident("theString"), "id");
    engine.compile_statement("s", def.into()).unwrap();

    engine.submit_event(bean("e1", 1)).unwrap();
    engine.submit_event(bean("e2", 2)).unwrap();
    let r = engine.submit_event(bean("e3", 3)).unwrap();
    let b = only_batch(&r, "s");
    assert_eq!(b.new_rows[0].get_str("id"), Some("e3"));
    assert_eq!(b.old_rows[0].get_str("id"), Some("e1"));
}

#[test]
fn test_emptied_group_reports_empty_values() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean").window(WindowSpec::last_event()))
        .select(Expr::ident("theString"), "key")
        .select(Expr::count_star(), "n")
        .select(Expr::sum(Expr::ident("intPrimitive")), "total")
        .group_by(Expr::ident("theString"));
    engine.compile_statement("s", def.into()).unwrap();

    engine.submit_event(bean("A", 5)).unwrap();
    let r = engine.submit_event(bean("B", 7)).unwrap();
    let b = only_batch(&r, "s");

    let keys: Vec<_> = b.new_rows.iter().filter_map(|r| r.get_str("key")).collect();
    assert_eq!(keys, vec!["A", "B"]);
    assert_eq!(ints(&b.new_rows, "n"), vec![Some(0), Some(1)]);
    assert_eq!(b.new_rows[0].get("total"), Some(&Value::Null));
    assert_eq!(ints(&b.old_rows, "n"), vec![Some(1)]);

    // A comes back as a first appearance: no old row for it.
    let r = engine.submit_event(bean("A", 1)).unwrap();
    let b = only_batch(&r, "s");
    let old_keys: Vec<_> = b.old_rows.iter().filter_map(|r| r.get_str("key")).collect();
    assert_eq!(old_keys, vec!["B"]);
}

#[test]
fn test_where_clause_controls_aggregation_input() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean"))
        .select(Expr::sum(Expr::ident("intPrimitive")), "total")
        .where_clause(Expr::ident("intPrimitive").gt(Expr::lit(0i64)));
    engine.compile_statement("s", def.into()).unwrap();

    engine.submit_event(bean("a", 10)).unwrap();
    let r = engine.submit_event(bean("b", -5)).unwrap();
    assert!(r.batches.is_empty());
    let r = engine.submit_event(bean("c", 1)).unwrap();
    assert_eq!(ints(&only_batch(&r, "s").new_rows, "total"), vec![Some(11)]);
}

#[test]
fn test_avg_and_window_aggregate() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean").window(WindowSpec::Length(3)))
        .select(Expr::avg(Expr::ident("intPrimitive")), "mean")
        .select(Expr::window_star(), "retained");
    engine.compile_statement("s", def.into()).unwrap();

    let mut last = None;
    for (i, v) in [2i64, 4, 6, 8].into_iter().enumerate() {
        last = Some(engine.submit_event(bean(&format!("e{}", i), v)).unwrap());
    }
    let report = last.unwrap();
    let row = &only_batch(&report, "s").new_rows[0];
    assert_eq!(row.get_float("mean"), Some(6.0));
    let ids: Vec<_> = row
        .get("retained")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .filter_map(|v| v.as_event().and_then(|e| e.get_str("theString")).map(String::from))
        .collect();
    assert_eq!(ids, vec!["e1", "e2", "e3"]);
}

// =============================================================================
// Time windows
// =============================================================================

#[test]
fn test_time_window_expires_on_watermark() {
    let engine = engine();
    let window = WindowSpec::Time(std::time::Duration::from_secs(10));
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean").window(window))
        .select(Expr::sum(Expr::ident("intPrimitive")), "total");
    engine.compile_statement("s", def.into()).unwrap();

    engine.submit_event(bean_at("a", 1, 0)).unwrap();
    let r = engine.submit_event(bean_at("b", 2, 5)).unwrap();
    assert_eq!(ints(&only_batch(&r, "s").new_rows, "total"), vec![Some(3)]);

    let r = engine.advance_watermark(t0() + Duration::seconds(12)).unwrap();
    let b = only_batch(&r, "s");
    assert_eq!(ints(&b.old_rows, "total"), vec![Some(3)]);
    assert_eq!(ints(&b.new_rows, "total"), vec![Some(2)]);

    // Nothing left to expire until b ages out.
    let r = engine.advance_watermark(t0() + Duration::seconds(13)).unwrap();
    assert!(r.batches.is_empty());

    // An event far in the future expires b by itself.
    let r = engine.submit_event(bean_at("c", 4, 60)).unwrap();
    assert_eq!(ints(&only_batch(&r, "s").new_rows, "total"), vec![Some(4)]);
}

// =============================================================================
// Joins
// =============================================================================

#[test]
fn test_two_stream_join() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean").alias("b"))
        .join(StreamSpec::new("Order").alias("o").window(WindowSpec::last_event()))
        .select(Expr::ident("b").member("intPrimitive"), "value")
        .select(Expr::ident("orderId"), "orderId")
        .where_clause(
            Expr::ident("b")
                .member("theString")
                .equals(Expr::ident("o").member("customer")),
        );
    engine.compile_statement("j", def.into()).unwrap();

    engine.submit_event(bean("alice", 1)).unwrap();
    engine.submit_event(bean("bob", 2)).unwrap();

    let order = |id: &str, customer: &str| {
        Event::new("Order")
            .with_field("orderId", id)
            .with_field("customer", customer)
    };
    let r = engine.submit_event(order("o1", "alice")).unwrap();
    let b = only_batch(&r, "j");
    assert_eq!(ints(&b.new_rows, "value"), vec![Some(1)]);
    assert_eq!(b.new_rows[0].get_str("orderId"), Some("o1"));

    // The next order replaces o1 on its last-event window.
    let r = engine.submit_event(order("o2", "bob")).unwrap();
    let b = only_batch(&r, "j");
    assert_eq!(b.old_rows[0].get_str("orderId"), Some("o1"));
    assert_eq!(b.new_rows[0].get_str("orderId"), Some("o2"));
    assert_eq!(ints(&b.new_rows, "value"), vec![Some(2)]);

    // A new bean pairs with the retained order.
    let r = engine.submit_event(bean("bob", 3)).unwrap();
    assert_eq!(ints(&only_batch(&r, "j").new_rows, "value"), vec![Some(3)]);
}

#[test]
fn test_join_wildcard_nests_stream_events() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean").alias("b"))
        .join(StreamSpec::new("Order").alias("o"))
        .select_all();
    let handle = engine.compile_statement("j", def.into()).unwrap();
    assert_eq!(handle.output_type().field_type("o"), Some(&Type::Named("Order".into())));

    engine.submit_event(bean("x", 1)).unwrap();
    let r = engine
        .submit_event(Event::new("Order").with_field("orderId", "o1").with_field("customer", "x"))
        .unwrap();
    let row = &only_batch(&r, "j").new_rows[0];
    assert_eq!(
        row.get("b").and_then(Value::as_event).and_then(|e| e.get_int("intPrimitive")),
        Some(1)
    );
}

#[test]
fn test_join_requires_distinct_names() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean"))
        .join(StreamSpec::new("SupportBean"))
        .select_all();
    assert!(matches!(
        engine.compile_statement("j", def.into()),
        Err(EngineError::Validation(_))
    ));
}

// =============================================================================
// Partitions
// =============================================================================

#[test]
fn test_partitioned_windows_are_isolated() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean").window(WindowSpec::Length(2)))
        .select(Expr::ident("theString"), "key")
        .select(Expr::sum(Expr::ident("intPrimitive")), "total")
        .partition_by("theString");
    engine.compile_statement("p", def.into()).unwrap();

    engine.submit_event(bean("A", 1)).unwrap();
    engine.submit_event(bean("A", 2)).unwrap();
    // B has its own window, so A's events are not evicted.
    let r = engine.submit_event(bean("B", 100)).unwrap();
    let b = only_batch(&r, "p");
    assert!(b.old_rows.is_empty());
    assert_eq!(ints(&b.new_rows, "total"), vec![Some(100)]);

    let r = engine.submit_event(bean("A", 4)).unwrap();
    let b = only_batch(&r, "p");
    assert_eq!(ints(&b.old_rows, "total"), vec![Some(3)]);
    assert_eq!(ints(&b.new_rows, "total"), vec![Some(6)]);
}

#[test]
fn test_partition_field_must_exist() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("SupportBean"))
        .select(Expr::count_star(), "n")
        .partition_by("nope");
    let err = engine.compile_statement("p", def.into()).unwrap_err();
    assert!(err.to_string().contains("'nope'"));
}

#[test]
fn test_count_of_expression_skips_nulls() {
    let engine = engine();
    engine
        .register_event_type(EventTypeDef::new("Sparse").field("v", Type::Int))
        .unwrap();
    let def = SelectDef::from_stream(StreamSpec::new("Sparse"))
        .select(Expr::count(Expr::ident("v")), "present")
        .select(Expr::aggregate(AggFunc::Count, Expr::lit(1i64)), "all");
    engine.compile_statement("s", def.into()).unwrap();

    engine.submit_event(Event::new("Sparse").with_field("v", 1i64)).unwrap();
    let r = engine.submit_event(Event::new("Sparse")).unwrap();
    let b = only_batch(&r, "s");
    assert_eq!(ints(&b.new_rows, "present"), vec![Some(1)]);
    assert_eq!(ints(&b.new_rows, "all"), vec![Some(2)]);
}
