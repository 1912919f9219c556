//! Concurrent submission against shared statements

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use rustc_hash::FxHashMap;
use vigil_core::{Event, EventTypeDef, Expr, SelectDef, StreamSpec, Type};
use vigil_runtime::{Engine, ResultBatch};

const THREADS: usize = 8;
const EVENTS_PER_THREAD: usize = 500;
const KEYS: usize = 13;

fn engine() -> Arc<Engine> {
    let engine = Engine::default();
    engine
        .register_event_type(
            EventTypeDef::new("Tick")
                .field("symbol", Type::Str)
                .field("price", Type::Int),
        )
        .unwrap();
    Arc::new(engine)
}

fn symbol(thread: usize, i: usize) -> String {
    format!("S{}", (thread * 31 + i * 7) % KEYS)
}

fn tick(symbol: String, price: i64) -> Event {
    Event::new("Tick")
        .with_field("symbol", symbol)
        .with_field("price", price)
}

#[test]
fn test_partitioned_counts_under_contention() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("Tick"))
        .select(Expr::ident("symbol"), "symbol")
        .select(Expr::count_star(), "n")
        .partition_by("symbol");
    engine.compile_statement("counts", def.into()).unwrap();

    let new_rows = Arc::new(AtomicUsize::new(0));
    let highest: Arc<Mutex<FxHashMap<String, i64>>> = Arc::default();
    {
        let new_rows = Arc::clone(&new_rows);
        let highest = Arc::clone(&highest);
        engine
            .add_listener("counts", move |batch: &ResultBatch| -> anyhow::Result<()> {
                new_rows.fetch_add(batch.new_rows.len(), Ordering::SeqCst);
                let mut highest = highest.lock().unwrap();
                for row in &batch.new_rows {
                    let symbol = row.get_str("symbol").unwrap_or_default().to_string();
                    let n = row.get_int("n").unwrap_or_default();
                    let entry = highest.entry(symbol).or_insert(0);
                    *entry = (*entry).max(n);
                }
                Ok(())
            })
            .unwrap();
    }

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..EVENTS_PER_THREAD {
                    engine.submit_event(tick(symbol(t, i), i as i64)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(new_rows.load(Ordering::SeqCst), THREADS * EVENTS_PER_THREAD);

    let mut expected: FxHashMap<String, i64> = FxHashMap::default();
    for t in 0..THREADS {
        for i in 0..EVENTS_PER_THREAD {
            *expected.entry(symbol(t, i)).or_insert(0) += 1;
        }
    }
    assert_eq!(*highest.lock().unwrap(), expected);
}

#[test]
fn test_unpartitioned_sum_is_consistent() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("Tick"))
        .select(Expr::sum(Expr::ident("price")), "total")
        .select(Expr::count_star(), "n");
    engine.compile_statement("totals", def.into()).unwrap();

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..EVENTS_PER_THREAD {
                    engine.submit_event(tick(symbol(t, i), 1)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let report = engine.submit_event(tick("last".into(), 1)).unwrap();
    let row = &report.batch("totals").unwrap().new_rows[0];
    let total = (THREADS * EVENTS_PER_THREAD + 1) as i64;
    assert_eq!(row.get_int("n"), Some(total));
    assert_eq!(row.get_int("total"), Some(total));
}

#[test]
fn test_destroy_while_submitting() {
    let engine = engine();
    let def = SelectDef::from_stream(StreamSpec::new("Tick"))
        .select(Expr::ident("symbol"), "symbol")
        .select(Expr::count_star(), "n")
        .partition_by("symbol");
    engine.compile_statement("counts", def.into()).unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    {
        let delivered = Arc::clone(&delivered);
        engine
            .add_listener("counts", move |batch: &ResultBatch| -> anyhow::Result<()> {
                delivered.fetch_add(batch.len(), Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..EVENTS_PER_THREAD {
                    engine.submit_event(tick(symbol(t, i), i as i64)).unwrap();
                }
            })
        })
        .collect();

    while delivered.load(Ordering::SeqCst) == 0 {
        thread::yield_now();
    }
    engine.destroy_statement("counts").unwrap();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(engine.statement_names().is_empty());
    let report = engine.submit_event(tick("S1".into(), 1)).unwrap();
    assert!(report.batches.is_empty());
    assert!(engine.destroy_statement("counts").is_err());
}
