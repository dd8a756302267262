use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::core::store::Priority;
use crate::text_enum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Time,
    File,
    Webhook,
    Telegram,
    Internal,
}

text_enum! {
    SignalType {
        Time => "time",
        File => "file",
        Webhook => "webhook",
        Telegram => "telegram",
        Internal => "internal",
    }
}

/// Envelope for one event entering the runtime. Lives only in memory.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub id: String,
    pub signal_type: SignalType,
    pub priority: Priority,
    pub source: String,
    pub data: serde_json::Value,
    pub timestamp: i64,
}

impl Signal {
    /// String field from the payload, e.g. `intent_id` or `action`.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }
}

/// One FIFO bucket per priority class; pops always drain the most urgent
/// non-empty bucket first.
#[derive(Debug, Default)]
pub struct SignalQueue {
    buckets: [VecDeque<Signal>; 5],
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, signal: Signal) {
        self.buckets[signal.priority.rank()].push_back(signal);
    }

    pub fn pop(&mut self) -> Option<Signal> {
        self.buckets.iter_mut().find_map(|bucket| bucket.pop_front())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }
}
