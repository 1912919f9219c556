//! Benchmarks for statement evaluation
//!
//! Run with: cargo bench -p vigil-runtime
//!
//! Benchmark groups:
//! - select: stateless filter and windowed grouped aggregation
//! - merge: table upsert per event
//! - enumeration: set operations over event collections

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use vigil_core::{
    EnumMethod, Event, EventTypeDef, Expr, MergeAction, MergeClause, MergeDef, MergeMatch,
    SelectDef, StreamSpec, TableDef, Type, Value, WindowSpec,
};
use vigil_runtime::enumeration;
use vigil_runtime::Engine;

fn engine() -> Engine {
    let engine = Engine::default();
    engine
        .register_event_type(
            EventTypeDef::new("Trade")
                .field("symbol", Type::Str)
                .field("price", Type::Int),
        )
        .expect("register Trade");
    engine
}

/// Generate test events for benchmarking
fn generate_events(count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            Event::new("Trade")
                .with_field("symbol", format!("S{}", i % 50))
                .with_field("price", (i * 17 % 1000) as i64)
        })
        .collect()
}

fn bench_select(c: &mut Criterion) {
    let mut group = c.benchmark_group("select");
    let events = generate_events(10_000);
    group.throughput(Throughput::Elements(events.len() as u64));

    group.bench_function("filter", |b| {
        let engine = engine();
        let def = SelectDef::from_stream(StreamSpec::new("Trade"))
            .select(Expr::ident("symbol"), "symbol")
            .where_clause(Expr::ident("price").gt(Expr::lit(500i64)));
        engine.compile_statement("filter", def.into()).expect("compile");
        b.iter(|| {
            for event in &events {
                black_box(engine.submit_event(event.clone()).expect("submit"));
            }
        })
    });

    for window in [10usize, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("grouped_sum", window), &window, |b, &window| {
            let engine = engine();
            let def = SelectDef::from_stream(StreamSpec::new("Trade").window(WindowSpec::Length(window)))
                .select(Expr::ident("symbol"), "symbol")
                .select(Expr::sum(Expr::ident("price")), "total")
                .group_by(Expr::ident("symbol"));
            engine.compile_statement("sums", def.into()).expect("compile");
            b.iter(|| {
                for event in &events {
                    black_box(engine.submit_event(event.clone()).expect("submit"));
                }
            })
        });
    }

    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    let events = generate_events(10_000);
    group.throughput(Throughput::Elements(events.len() as u64));

    group.bench_function("upsert", |b| {
        let engine = engine();
        engine
            .create_table(
                &TableDef::new("last_price")
                    .key("symbol", Type::Str)
                    .column("price", Type::Int),
            )
            .expect("create table");
        let def = MergeDef::new(
            "last_price",
            StreamSpec::new("Trade"),
            MergeMatch::Key(vec![Expr::ident("symbol")]),
        )
        .clause(MergeClause::matched().then(MergeAction::Update(vec![(
            "price".into(),
            Expr::ident("price"),
        )])))
        .clause(MergeClause::not_matched().then(MergeAction::Insert(vec![
            ("symbol".into(), Expr::ident("symbol")),
            ("price".into(), Expr::ident("price")),
        ])));
        engine.compile_statement("upsert", def.into()).expect("compile");
        b.iter(|| {
            for event in &events {
                black_box(engine.submit_event(event.clone()).expect("submit"));
            }
        })
    });

    group.finish();
}

fn bench_enumeration(c: &mut Criterion) {
    let mut group = c.benchmark_group("enumeration");

    for size in [10usize, 100, 1000] {
        let a: Vec<Value> = generate_events(size).into_iter().map(Value::from).collect();
        let b: Vec<Value> = generate_events(size / 2).into_iter().map(Value::from).collect();

        group.bench_with_input(BenchmarkId::new("except", size), &size, |bench, _| {
            bench.iter(|| enumeration::except(black_box(Some(&a[..])), black_box(Some(&b[..]))))
        });
        group.bench_with_input(BenchmarkId::new("intersect", size), &size, |bench, _| {
            bench.iter(|| enumeration::intersect(black_box(Some(&a[..])), black_box(Some(&b[..]))))
        });
    }

    group.bench_function("statement_except", |bench| {
        let engine = engine();
        engine
            .register_event_type(
                EventTypeDef::new("Basket")
                    .field("held", Type::events("Trade"))
                    .field("sold", Type::events("Trade")),
            )
            .expect("register Basket");
        let def = SelectDef::from_stream(StreamSpec::new("Basket")).select(
            Expr::ident("held").call(EnumMethod::Except, vec![Expr::ident("sold")]),
            "remaining",
        );
        engine.compile_statement("remaining", def.into()).expect("compile");
        let held: Vec<Event> = generate_events(100);
        let sold: Vec<Event> = generate_events(30);
        let basket = Event::new("Basket")
            .with_field("held", held)
            .with_field("sold", sold);
        bench.iter(|| black_box(engine.submit_event(basket.clone()).expect("submit")))
    });

    group.finish();
}

criterion_group!(benches, bench_select, bench_merge, bench_enumeration);
criterion_main!(benches);
