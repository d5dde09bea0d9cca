//! In-memory doubles shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use time::{OffsetDateTime, UtcOffset};

use crate::clock::LocalZone;
use crate::conditions::{Conditions, ConditionsSource};
use crate::gate::CommandGate;
use crate::kv::{Key, KvError, KvStore};
use crate::report::ErrorReporter;
use crate::valve::Actuator;

// ---------------------------------------------------------------------------
// KV
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct MemoryKv {
    map: Arc<Mutex<HashMap<String, String>>>,
    fail_writes: Arc<AtomicBool>,
    fail_keys: Arc<Mutex<HashSet<String>>>,
    fail_write_keys: Arc<Mutex<HashSet<String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: Key, value: &str) {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    pub fn value(&self, key: Key) -> Option<String> {
        self.map.lock().unwrap().get(&key.to_string()).cloned()
    }

    /// Every write fails while set.
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    /// Every read or write touching `key` fails.
    pub fn fail_key(&self, key: Key) {
        self.fail_keys.lock().unwrap().insert(key.to_string());
    }

    /// Writes to `key` fail; reads still work.
    pub fn fail_key_writes(&self, key: Key) {
        self.fail_write_keys.lock().unwrap().insert(key.to_string());
    }

    fn check(&self, key: &str, write: bool) -> Result<(), KvError> {
        let write_blocked = write
            && (self.fail_writes.load(Ordering::SeqCst)
                || self.fail_write_keys.lock().unwrap().contains(key));
        if write_blocked || self.fail_keys.lock().unwrap().contains(key) {
            return Err(KvError::Exhausted {
                op: if write { "set" } else { "get" },
                key: key.to_string(),
                attempts: 1,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

impl KvStore for MemoryKv {
    async fn get(&self, key: &Key) -> Result<Option<String>, KvError> {
        let key = key.to_string();
        self.check(&key, false)?;
        Ok(self.map.lock().unwrap().get(&key).cloned())
    }

    async fn set(&self, key: &Key, value: &str) -> Result<(), KvError> {
        let key = key.to_string();
        self.check(&key, true)?;
        self.map.lock().unwrap().insert(key, value.to_string());
        Ok(())
    }

    async fn set_all(&self, entries: &[(Key, String)]) -> Result<(), KvError> {
        for (k, _) in entries {
            self.check(&k.to_string(), true)?;
        }
        let mut map = self.map.lock().unwrap();
        for (k, v) in entries {
            map.insert(k.to_string(), v.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveOp {
    Open(u32),
    Close(u32),
    CloseAll,
}

pub struct RecordingValves {
    num_valves: u32,
    ops: Mutex<Vec<ValveOp>>,
    fail_open: Mutex<HashSet<u32>>,
    fail_close: Mutex<HashSet<u32>>,
    fail_close_all: AtomicBool,
    observed_gate: Mutex<Option<CommandGate>>,
    holders_at_close: Mutex<Vec<Option<&'static str>>>,
}

impl RecordingValves {
    pub fn new(num_valves: u32) -> Self {
        Self {
            num_valves,
            ops: Mutex::new(Vec::new()),
            fail_open: Mutex::new(HashSet::new()),
            fail_close: Mutex::new(HashSet::new()),
            fail_close_all: AtomicBool::new(false),
            observed_gate: Mutex::new(None),
            holders_at_close: Mutex::new(Vec::new()),
        }
    }

    pub fn ops(&self) -> Vec<ValveOp> {
        self.ops.lock().unwrap().clone()
    }

    /// Ops other than the start-of-pass sweep.
    pub fn zone_ops(&self) -> Vec<ValveOp> {
        self.ops()
            .into_iter()
            .filter(|op| *op != ValveOp::CloseAll)
            .collect()
    }

    pub fn clear(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn fail_open(&self, n: u32) {
        self.fail_open.lock().unwrap().insert(n);
    }

    pub fn fail_close(&self, n: u32) {
        self.fail_close.lock().unwrap().insert(n);
    }

    pub fn heal_close(&self, n: u32) {
        self.fail_close.lock().unwrap().remove(&n);
    }

    /// Record the holder of `gate` at every `close` call.
    pub fn observe_gate(&self, gate: CommandGate) {
        *self.observed_gate.lock().unwrap() = Some(gate);
    }

    pub fn holders_at_close(&self) -> Vec<Option<&'static str>> {
        self.holders_at_close.lock().unwrap().clone()
    }

    pub fn fail_close_all(&self) {
        self.fail_close_all.store(true, Ordering::SeqCst);
    }
}

impl Actuator for RecordingValves {
    fn open(&self, n: u32) -> Result<()> {
        if self.fail_open.lock().unwrap().contains(&n) {
            bail!("relay {n} stuck");
        }
        self.ops.lock().unwrap().push(ValveOp::Open(n));
        Ok(())
    }

    fn close(&self, n: u32) -> Result<()> {
        if let Some(gate) = self.observed_gate.lock().unwrap().as_ref() {
            self.holders_at_close.lock().unwrap().push(gate.holder());
        }
        if self.fail_close.lock().unwrap().contains(&n) {
            bail!("relay {n} stuck");
        }
        self.ops.lock().unwrap().push(ValveOp::Close(n));
        Ok(())
    }

    fn close_all(&self) -> Result<()> {
        if self.fail_close_all.load(Ordering::SeqCst) {
            bail!("controller offline");
        }
        self.ops.lock().unwrap().push(ValveOp::CloseAll);
        Ok(())
    }

    fn num_valves(&self) -> u32 {
        self.num_valves
    }
}

// ---------------------------------------------------------------------------
// Conditions
// ---------------------------------------------------------------------------

pub struct CannedConditions {
    pub yesterday: Conditions,
    pub forecast: Conditions,
    pub fail: AtomicBool,
}

impl CannedConditions {
    pub fn new(yesterday: Conditions, forecast: Conditions) -> Self {
        Self {
            yesterday,
            forecast,
            fail: AtomicBool::new(false),
        }
    }
}

impl ConditionsSource for CannedConditions {
    fn yesterday(&self, _location: &str) -> Result<Conditions> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("weather service unavailable");
        }
        Ok(self.yesterday)
    }

    fn forecast(&self, _location: &str) -> Result<Conditions> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("weather service unavailable");
        }
        Ok(self.forecast)
    }
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct RecordingReporter {
    errors: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

impl ErrorReporter for RecordingReporter {
    async fn report(&self, err: anyhow::Error) -> anyhow::Error {
        self.errors.lock().unwrap().push(format!("{err:#}"));
        err
    }
}

// ---------------------------------------------------------------------------
// Time zone
// ---------------------------------------------------------------------------

/// A zone whose offset the test can change between wake-ups.
pub struct ShiftingZone {
    offset: Mutex<UtcOffset>,
}

impl ShiftingZone {
    pub fn new(offset: UtcOffset) -> Self {
        Self {
            offset: Mutex::new(offset),
        }
    }

    pub fn set(&self, offset: UtcOffset) {
        *self.offset.lock().unwrap() = offset;
    }
}

impl LocalZone for ShiftingZone {
    fn offset_at(&self, _utc: OffsetDateTime) -> UtcOffset {
        *self.offset.lock().unwrap()
    }
}
