//! Logging setup and the in-memory activity log.
//!
//! Every tracing event goes to stderr and into a fixed-capacity ring buffer
//! an embedding UI can read to show recent lifecycle activity (installs,
//! Dock edits, reconcile passes).

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "docktile=info";

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: u64,
    pub timestamp_ms: i64,
    pub level: String,
    /// tracing target, e.g. `docktile_lib::bundle`
    pub source: String,
    pub message: String,
    /// `key=value` pairs recorded alongside the message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<String>,
}

// ---------------------------------------------------------------------------
// Ring buffer
// ---------------------------------------------------------------------------

pub const LOG_RING_CAPACITY: usize = 1000;

/// Fixed-capacity circular buffer for log entries.
pub struct LogRingBuffer {
    entries: Vec<Option<LogEntry>>,
    capacity: usize,
    /// Write position (wraps around)
    write_pos: usize,
    /// Number of entries currently stored (≤ capacity)
    count: usize,
    /// Monotonically increasing ID for the next entry
    next_id: u64,
}

impl LogRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || None);
        Self {
            entries,
            capacity,
            write_pos: 0,
            count: 0,
            next_id: 1,
        }
    }

    /// Push a new entry. Returns the assigned entry ID.
    pub fn push(&mut self, level: &str, source: &str, message: String, fields: Option<String>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        self.entries[self.write_pos] = Some(LogEntry {
            id,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            level: level.to_string(),
            source: source.to_string(),
            message,
            fields,
        });
        self.write_pos = (self.write_pos + 1) % self.capacity;
        if self.count < self.capacity {
            self.count += 1;
        }
        id
    }

    /// The most recent `limit` entries, oldest first. `0` means all.
    pub fn get_entries(&self, limit: usize) -> Vec<LogEntry> {
        let take = if limit == 0 { self.count } else { limit.min(self.count) };
        // write_pos points at the oldest entry once the buffer is full
        let start = if self.count < self.capacity { 0 } else { self.write_pos };
        (self.count - take..self.count)
            .filter_map(|i| self.entries[(start + i) % self.capacity].clone())
            .collect()
    }

    /// Remove all entries. IDs stay monotonic.
    pub fn clear(&mut self) {
        self.entries.iter_mut().for_each(|slot| *slot = None);
        self.write_pos = 0;
        self.count = 0;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

// ---------------------------------------------------------------------------
// tracing layer
// ---------------------------------------------------------------------------

/// Copies every event it sees into a shared [`LogRingBuffer`].
pub struct ActivityLayer {
    buffer: Arc<Mutex<LogRingBuffer>>,
}

impl ActivityLayer {
    pub fn new(buffer: Arc<Mutex<LogRingBuffer>>) -> Self {
        Self { buffer }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={value}", field.name()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.push(format!("{}={value:?}", field.name()));
        }
    }
}

impl<S: Subscriber> tracing_subscriber::Layer<S> for ActivityLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let level = match *meta.level() {
            Level::ERROR => "error",
            Level::WARN => "warn",
            Level::INFO => "info",
            Level::DEBUG => "debug",
            Level::TRACE => "trace",
        };
        let fields = (!visitor.fields.is_empty()).then(|| visitor.fields.join(" "));
        self.buffer
            .lock()
            .push(level, meta.target(), visitor.message, fields);
    }
}

/// Install the global subscriber: `RUST_LOG` (default `docktile=info`),
/// stderr output, and the activity ring buffer. Safe to call more than once;
/// later calls just get a buffer nobody writes to.
pub fn init_logging(verbose: bool) -> Arc<Mutex<LogRingBuffer>> {
    let buffer = Arc::new(Mutex::new(LogRingBuffer::new(LOG_RING_CAPACITY)));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("docktile=debug")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    });

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(ActivityLayer::new(buffer.clone()))
        .try_init();
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
    buffer
}
