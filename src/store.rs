//! Last known value of every register of a device

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::decode::Value;
use crate::register::RegisterDescriptor;

/// Shared value store of one device
pub type SharedStore = Arc<RwLock<ValueStore>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Value from the most recent pass
    Fresh,
    /// Last read failed; value is from an earlier pass
    Stale,
    /// Never decoded, or the last decode/derivation failed
    Unavailable,
}

#[derive(Debug, Clone)]
struct Entry {
    value: Option<Value>,
    status: Status,
    unit: Option<String>,
    last_updated: Option<Instant>,
    timestamp: Option<DateTime<Utc>>,
}

/// Point-in-time view of one register
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub name: String,
    pub value: Option<Value>,
    pub status: Status,
    pub unit: Option<String>,
    #[serde(skip)]
    pub last_updated: Option<Instant>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Register update broadcast to consumers after each pass
#[derive(Debug, Clone, Serialize)]
pub struct RegisterUpdate {
    pub device_id: String,
    pub register_name: String,
    pub value: Option<Value>,
    pub status: Status,
    pub unit: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl RegisterUpdate {
    pub fn new(device_id: &str, snapshot: Snapshot) -> Self {
        Self {
            device_id: device_id.to_string(),
            register_name: snapshot.name,
            value: snapshot.value,
            status: snapshot.status,
            unit: snapshot.unit,
            timestamp: snapshot.timestamp,
        }
    }
}

#[derive(Debug, Default)]
pub struct ValueStore {
    entries: HashMap<String, Entry>,
}

impl ValueStore {
    /// Every register starts out `Unavailable`.
    pub fn new(registers: &[RegisterDescriptor]) -> Self {
        let entries = registers
            .iter()
            .map(|r| {
                let entry = Entry {
                    value: None,
                    status: Status::Unavailable,
                    unit: r.unit.clone(),
                    last_updated: None,
                    timestamp: None,
                };
                (r.name.clone(), entry)
            })
            .collect();
        Self { entries }
    }

    pub fn shared(registers: &[RegisterDescriptor]) -> SharedStore {
        Arc::new(RwLock::new(Self::new(registers)))
    }

    pub fn get(&self, name: &str) -> Option<Snapshot> {
        self.entries.get(name).map(|entry| snapshot(name, entry))
    }

    /// All registers, sorted by name.
    pub fn snapshots(&self) -> Vec<Snapshot> {
        let mut all: Vec<Snapshot> = self
            .entries
            .iter()
            .map(|(name, entry)| snapshot(name, entry))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Current value regardless of freshness.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.entries.get(name).and_then(|e| e.value.as_ref())
    }

    pub fn status(&self, name: &str) -> Option<Status> {
        self.entries.get(name).map(|e| e.status)
    }

    /// Store a newly decoded value. Returns `true` if anything changed.
    pub fn set_fresh(&mut self, name: &str, value: Value) -> bool {
        self.set(name, value, Status::Fresh)
    }

    /// Store a value computed from stale inputs.
    pub fn set_stale(&mut self, name: &str, value: Value) -> bool {
        self.set(name, value, Status::Stale)
    }

    fn set(&mut self, name: &str, value: Value, status: Status) -> bool {
        let Some(entry) = self.entries.get_mut(name) else {
            return false;
        };
        let changed = entry.status != status || entry.value.as_ref() != Some(&value);
        entry.value = Some(value);
        entry.status = status;
        entry.last_updated = Some(Instant::now());
        entry.timestamp = Some(Utc::now());
        changed
    }

    /// Keep the last value but flag it stale. Never-decoded registers stay
    /// `Unavailable`.
    pub fn mark_stale(&mut self, name: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.status == Status::Fresh => {
                entry.status = Status::Stale;
                true
            }
            _ => false,
        }
    }

    pub fn mark_unavailable(&mut self, name: &str) -> bool {
        match self.entries.get_mut(name) {
            Some(entry) if entry.status != Status::Unavailable || entry.value.is_some() => {
                entry.status = Status::Unavailable;
                entry.value = None;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry at once; used when the owning device is removed.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn snapshot(name: &str, entry: &Entry) -> Snapshot {
    Snapshot {
        name: name.to_string(),
        value: entry.value.clone(),
        status: entry.status,
        unit: entry.unit.clone(),
        last_updated: entry.last_updated,
        timestamp: entry.timestamp,
    }
}
