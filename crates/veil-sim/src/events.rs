use serde::Serialize;
use std::io::Write;

use veil_destination::{now_ms, DestinationStats};

/// Emit a JSONL event to stdout (flushed immediately for piped output).
pub fn emit<T: Serialize>(event: &T) {
    if let Ok(json) = serde_json::to_string(event) {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{json}");
        let _ = lock.flush();
    }
}

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub name: String,
    pub ident: String,
    pub public: bool,
    pub timestamp_ms: u64,
}

impl EventStarted {
    pub fn new(name: &str, ident: &str, public: bool) -> Self {
        Self {
            event: "started",
            name: name.to_string(),
            ident: ident.to_string(),
            public,
            timestamp_ms: now_ms(),
        }
    }
}

/// A `DestinationEvent`, flattened for output.
#[derive(Serialize)]
pub struct EventDestination {
    pub event: &'static str,
    pub name: String,
    pub detail: String,
    pub timestamp_ms: u64,
}

impl EventDestination {
    pub fn new(name: &str, detail: String) -> Self {
        Self {
            event: "destination",
            name: name.to_string(),
            detail,
            timestamp_ms: now_ms(),
        }
    }
}

#[derive(Serialize)]
pub struct EventStep {
    pub event: &'static str,
    pub step: &'static str,
    pub ok: bool,
    pub elapsed_ms: u64,
    pub detail: String,
}

impl EventStep {
    pub fn new(step: &'static str, ok: bool, elapsed_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            event: "step",
            step,
            ok,
            elapsed_ms,
            detail: detail.into(),
        }
    }
}

#[derive(Serialize)]
pub struct EventSummary<'a> {
    pub event: &'static str,
    pub name: String,
    pub stats: &'a DestinationStats,
}

impl<'a> EventSummary<'a> {
    pub fn new(name: &str, stats: &'a DestinationStats) -> Self {
        Self {
            event: "summary",
            name: name.to_string(),
            stats,
        }
    }
}
