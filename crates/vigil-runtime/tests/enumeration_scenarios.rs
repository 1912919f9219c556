//! Enumeration methods evaluated through compiled statements

use vigil_core::{EnumMethod, Event, EventTypeDef, Expr, SelectDef, StreamSpec, Type, Value};
use vigil_runtime::{Engine, EngineError};

// =============================================================================
// Helpers
// =============================================================================

fn engine() -> Engine {
    let engine = Engine::default();
    engine
        .register_event_type(
            EventTypeDef::new("Item")
                .field("id", Type::Str)
                .field("p00", Type::Int),
        )
        .unwrap();
    engine
        .register_event_type(
            EventTypeDef::new("Container")
                .field("contained", Type::events("Item"))
                .field("other", Type::events("Item")),
        )
        .unwrap();
    engine
}

fn items(entries: &[(&str, i64)]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|(id, p00)| Value::from(Event::new("Item").with_field("id", *id).with_field("p00", *p00)))
            .collect(),
    )
}

fn container(contained: Value, other: Value) -> Event {
    Event::new("Container")
        .with_field("contained", contained)
        .with_field("other", other)
}

/// Compile `select <expr> as result from Container` and return the result
/// value for `event`.
fn evaluate(expr: Expr, event: Event) -> Value {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("Container")).select(expr, "result");
    engine.compile_statement("s", def.into()).unwrap();
    let report = engine.submit_event(event).unwrap();
    let batch = report.batch("s").expect("statement produced no rows");
    batch.new_rows[0].get("result").cloned().unwrap_or_default()
}

fn ids(value: &Value) -> Vec<String> {
    value
        .as_array()
        .expect("expected a collection")
        .iter()
        .filter_map(|v| v.as_event().and_then(|e| e.get_str("id")).map(String::from))
        .collect()
}

fn contained() -> Expr {
    Expr::ident("contained")
}

fn other() -> Expr {
    Expr::ident("other")
}

// =============================================================================
// Set operations
// =============================================================================

#[test]
fn test_except_and_intersect_partition_the_input() {
    let a = items(&[("E1", 1), ("E4", 4), ("E1", 1), ("E1", 1)]);
    let b = items(&[("E2", 2), ("E4", 4)]);

    let except = evaluate(
        contained().call(EnumMethod::Except, vec![other()]),
        container(a.clone(), b.clone()),
    );
    let intersect = evaluate(
        contained().call(EnumMethod::Intersect, vec![other()]),
        container(a, b),
    );

    assert_eq!(ids(&except), vec!["E1", "E1", "E1"]);
    assert_eq!(ids(&intersect), vec!["E4"]);
}

#[test]
fn test_set_operations_compare_by_value_not_identity() {
    // Same field values in distinct event instances.
    let a = items(&[("E1", 1), ("E2", 2)]);
    let b = items(&[("E1", 1)]);
    let result = evaluate(contained().call(EnumMethod::Except, vec![other()]), container(a, b));
    assert_eq!(ids(&result), vec!["E2"]);

    // Same id with a different p00 is a different element.
    let a = items(&[("E1", 1)]);
    let b = items(&[("E1", 9)]);
    let result = evaluate(contained().call(EnumMethod::Intersect, vec![other()]), container(a, b));
    assert!(ids(&result).is_empty());
}

#[test]
fn test_union_keeps_duplicates_and_order() {
    let a = items(&[("E1", 1), ("E2", 2)]);
    let b = items(&[("E3", 3), ("E4", 4)]);
    let result = evaluate(contained().call(EnumMethod::Union, vec![other()]), container(a, b));
    assert_eq!(ids(&result), vec!["E1", "E2", "E3", "E4"]);

    let a = items(&[("E1", 1)]);
    let b = items(&[("E1", 1)]);
    let result = evaluate(contained().call(EnumMethod::Union, vec![other()]), container(a, b));
    assert_eq!(ids(&result).len(), 2);
}

#[test]
fn test_absent_input_propagates_absent() {
    for method in [EnumMethod::Except, EnumMethod::Intersect, EnumMethod::Union] {
        let absent_operand = evaluate(
            contained().call(method, vec![other()]),
            container(items(&[("E1", 1)]), Value::Null),
        );
        assert_eq!(absent_operand, Value::Null, "{:?} with absent operand", method);

        let absent_target = evaluate(
            contained().call(method, vec![other()]),
            container(Value::Null, items(&[("E1", 1)])),
        );
        assert_eq!(absent_target, Value::Null, "{:?} with absent target", method);
    }
}

#[test]
fn test_empty_input_gives_empty_result() {
    let result = evaluate(
        contained().call(EnumMethod::Intersect, vec![other()]),
        container(items(&[]), items(&[("E1", 1)])),
    );
    assert_eq!(result, Value::Array(vec![]));

    let result = evaluate(
        contained().call(EnumMethod::Except, vec![other()]),
        container(items(&[("E1", 1)]), items(&[])),
    );
    assert_eq!(ids(&result), vec!["E1"]);
}

// =============================================================================
// Ordering, lambdas and reductions
// =============================================================================

#[test]
fn test_order_by_is_stable_in_both_directions() {
    let a = items(&[("E1", 2), ("E2", 1), ("E3", 2), ("E4", 1)]);
    let by_p00 = || Expr::lambda(["x"], Expr::ident("x").member("p00"));

    let asc = evaluate(
        contained().call(EnumMethod::OrderBy, vec![by_p00()]),
        container(a.clone(), Value::Null),
    );
    assert_eq!(ids(&asc), vec!["E2", "E4", "E1", "E3"]);

    let desc = evaluate(
        contained().call(EnumMethod::OrderByDesc, vec![by_p00()]),
        container(a, Value::Null),
    );
    assert_eq!(ids(&desc), vec!["E1", "E3", "E2", "E4"]);
}

#[test]
fn test_nested_lambda_reads_outer_binding() {
    // contained.where(x => other.anyOf(y => y.id = x.id))
    let expr = contained().call(
        EnumMethod::Where,
        vec![Expr::lambda(
            ["x"],
            other().call(
                EnumMethod::AnyOf,
                vec![Expr::lambda(
                    ["y"],
                    Expr::ident("y")
                        .member("id")
                        .equals(Expr::ident("x").member("id")),
                )],
            ),
        )],
    );
    let a = items(&[("E1", 1), ("E2", 2), ("E3", 3)]);
    let b = items(&[("E3", 30), ("E1", 10)]);
    assert_eq!(ids(&evaluate(expr, container(a, b))), vec!["E1", "E3"]);
}

#[test]
fn test_lambda_index_parameter() {
    // contained.where((x, i) => i >= 1).select(x => x.p00).sumOf()
    let expr = contained()
        .call(
            EnumMethod::Where,
            vec![Expr::lambda(["x", "i"], Expr::ident("i").ge(Expr::lit(1i64)))],
        )
        .call(
            EnumMethod::Select,
            vec![Expr::lambda(["x"], Expr::ident("x").member("p00"))],
        )
        .call(EnumMethod::SumOf, vec![]);
    let a = items(&[("E1", 100), ("E2", 2), ("E3", 3)]);
    assert_eq!(evaluate(expr, container(a, Value::Null)), Value::Int(5));
}

#[test]
fn test_reductions_on_empty_input() {
    let count_of = contained().call(EnumMethod::CountOf, vec![]);
    let sum_of = contained().call(
        EnumMethod::SumOf,
        vec![Expr::lambda(["x"], Expr::ident("x").member("p00"))],
    );
    let any_of = contained().call(
        EnumMethod::AnyOf,
        vec![Expr::lambda(["x"], Expr::ident("x").member("p00").gt(Expr::lit(0i64)))],
    );
    let all_of = contained().call(
        EnumMethod::AllOf,
        vec![Expr::lambda(["x"], Expr::ident("x").member("p00").gt(Expr::lit(0i64)))],
    );
    let first_of = contained().call(EnumMethod::FirstOf, vec![]);

    let empty = || container(items(&[]), Value::Null);
    assert_eq!(evaluate(count_of, empty()), Value::Int(0));
    assert_eq!(evaluate(sum_of, empty()), Value::Null);
    assert_eq!(evaluate(any_of, empty()), Value::Bool(false));
    assert_eq!(evaluate(all_of, empty()), Value::Bool(true));
    assert_eq!(evaluate(first_of, empty()), Value::Null);
}

#[test]
fn test_take_and_take_last() {
    let a = || items(&[("E1", 1), ("E2", 2), ("E3", 3)]);
    let take = |n: i64| contained().call(EnumMethod::Take, vec![Expr::lit(n)]);
    let take_last = |n: i64| contained().call(EnumMethod::TakeLast, vec![Expr::lit(n)]);

    assert_eq!(ids(&evaluate(take(2), container(a(), Value::Null))), vec!["E1", "E2"]);
    assert_eq!(ids(&evaluate(take_last(2), container(a(), Value::Null))), vec!["E2", "E3"]);
    assert!(ids(&evaluate(take(-1), container(a(), Value::Null))).is_empty());
    assert_eq!(ids(&evaluate(take(10), container(a(), Value::Null))).len(), 3);
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_union_with_boolean_fails_validation() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("Container"))
        .select(contained().call(EnumMethod::Union, vec![Expr::lit(true)]), "result");
    let err = engine.compile_statement("s", def.into()).unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(
        err.to_string(),
        "Failed to validate expression 'contained.union(true)': enumeration method 'union' \
         requires an expression yielding an event-collection as input parameter"
    );
    assert!(engine.statement_names().is_empty());
}

#[test]
fn test_set_operand_of_unrelated_event_type_fails() {
    let engine = engine();
    engine
        .register_event_type(EventTypeDef::new("Other").field("name", Type::Str))
        .unwrap();
    engine
        .register_event_type(EventTypeDef::new("Mixed").field("a", Type::events("Item")).field("b", Type::events("Other")))
        .unwrap();
    let def = SelectDef::from_stream(StreamSpec::new("Mixed")).select(
        Expr::ident("a").call(EnumMethod::Except, vec![Expr::ident("b")]),
        "result",
    );
    let err = engine.compile_statement("s", def.into()).unwrap_err();
    assert!(err
        .to_string()
        .ends_with("expects event type 'Item' but receives event type 'Other'"));
}
