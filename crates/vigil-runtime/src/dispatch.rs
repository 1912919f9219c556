//! Result dispatch
//!
//! Every statement that produced rows while processing an event gets one
//! [`ResultBatch`] at the end of the tick. Batches are handed to the
//! listeners registered on that statement, in registration order.
//!
//! A failing listener never stops delivery: an `Err` is logged as a warning,
//! a panic is caught and logged as an error, and the next listener runs.
//!
//! Besides callbacks, [`ListenerRegistry::subscribe`] returns the receiving
//! end of an unbounded tokio channel that gets a clone of every batch, and
//! [`JsonLinesListener`] writes batches to any `Write` as JSON lines.

use std::io::Write;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};
use vigil_core::SharedEvent;

/// New and old rows of one statement for one processed event
#[derive(Debug, Clone, Serialize)]
pub struct ResultBatch {
    pub statement: Arc<str>,
    pub new_rows: Vec<SharedEvent>,
    pub old_rows: Vec<SharedEvent>,
}

impl ResultBatch {
    pub fn new(statement: Arc<str>) -> Self {
        Self {
            statement,
            new_rows: Vec::new(),
            old_rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.new_rows.is_empty() && self.old_rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.new_rows.len() + self.old_rows.len()
    }
}

/// Receives result batches of a statement
pub trait Listener: Send + Sync {
    fn on_update(&self, batch: &ResultBatch) -> anyhow::Result<()>;
}

impl<F> Listener for F
where
    F: Fn(&ResultBatch) -> anyhow::Result<()> + Send + Sync,
{
    fn on_update(&self, batch: &ResultBatch) -> anyhow::Result<()> {
        self(batch)
    }
}

/// Forwards batches into an unbounded channel
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<ResultBatch>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResultBatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Listener for ChannelListener {
    fn on_update(&self, batch: &ResultBatch) -> anyhow::Result<()> {
        self.tx
            .send(batch.clone())
            .map_err(|_| anyhow::anyhow!("subscriber for '{}' is gone", batch.statement))
    }
}

/// Writes each batch as one JSON line
pub struct JsonLinesListener<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesListener<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

impl<W: Write + Send> Listener for JsonLinesListener<W> {
    fn on_update(&self, batch: &ResultBatch) -> anyhow::Result<()> {
        let json = serde_json::to_string(batch)?;
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        writeln!(out, "{}", json)?;
        out.flush()?;
        Ok(())
    }
}

/// Handle returned on registration, used to deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    statement: Arc<str>,
    listener: Arc<dyn Listener>,
}

#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Registration>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, statement: &str, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.push(Registration {
            id,
            statement: Arc::from(statement),
            listener,
        });
        id
    }

    pub fn subscribe(&self, statement: &str) -> mpsc::UnboundedReceiver<ResultBatch> {
        let (listener, rx) = ChannelListener::new();
        self.add(statement, Arc::new(listener));
        rx
    }

    /// Returns false when `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        listeners.len() != before
    }

    /// Drop every listener of `statement`.
    pub fn remove_statement(&self, statement: &str) -> usize {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|r| &*r.statement != statement);
        before - listeners.len()
    }

    pub fn count(&self, statement: &str) -> usize {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.iter().filter(|r| &*r.statement == statement).count()
    }

    /// Deliver `batch` to the listeners of its statement. Returns how many
    /// listeners accepted it.
    pub fn deliver(&self, batch: &ResultBatch) -> usize {
        if batch.is_empty() {
            return 0;
        }
        // Snapshot so listeners may (de)register without deadlocking.
        let targets: Vec<Arc<dyn Listener>> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners
                .iter()
                .filter(|r| r.statement == batch.statement)
                .map(|r| Arc::clone(&r.listener))
                .collect()
        };

        let mut delivered = 0;
        for listener in targets {
            match catch_unwind(AssertUnwindSafe(|| listener.on_update(batch))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(statement = %batch.statement, error = %e, "listener failed");
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!(statement = %batch.statement, panic = %message, "listener panicked");
                }
            }
        }
        delivered
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("ListenerRegistry")
            .field("listeners", &listeners.len())
            .finish()
    }
}
