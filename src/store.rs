use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::model::now_millis;

/// Full contents of one collection, keyed by slot id. Tombstoned slots are
/// present with a `null` value, distinguishable from absence.
pub type Snapshot = BTreeMap<String, Value>;

/// Narrow interface to the remote document store. The store is an external
/// collaborator; this crate only assumes append-with-generated-id, per-slot
/// writes, recursive field merges and full-snapshot change notification.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Append a record under a generated id and return that id.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Set one slot's value. Writing `null` tombstones the slot.
    async fn write(&self, path: &str, key: &str, value: Value) -> Result<()>;

    /// Recursively merge `patch` into one slot. Object fields merge per key,
    /// `null` deletes a key, anything else replaces. Fails with `not_found`
    /// when the slot is absent or tombstoned.
    async fn merge(&self, path: &str, key: &str, patch: Value) -> Result<()>;

    /// Read the collection's full current contents once.
    async fn read(&self, path: &str) -> Result<Snapshot>;

    /// Watch the collection; every mutation publishes the full new snapshot.
    fn watch(&self, path: &str) -> broadcast::Receiver<Snapshot>;
}

const WATCH_CAPACITY: usize = 100;

struct Slot {
    records: Snapshot,
    tx: broadcast::Sender<Snapshot>,
}

impl Slot {
    fn new() -> Self {
        let (tx, _rx) = broadcast::channel(WATCH_CAPACITY);
        Self {
            records: BTreeMap::new(),
            tx,
        }
    }

    fn publish(&self) {
        // no receivers is fine
        let _ = self.tx.send(self.records.clone());
    }
}

/// In-memory multi-writer store with the same observable semantics the
/// gateway expects from the managed service: generated ids order by creation
/// time, every mutation re-emits the full snapshot, deletes tombstone.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Slot>>,
    push_state: Mutex<PushState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let id = next_push_id(&mut self.push_state.lock(), now_millis());
        let mut guard = self.collections.lock();
        let slot = guard.entry(path.to_string()).or_insert_with(Slot::new);
        slot.records.insert(id.clone(), value);
        slot.publish();
        Ok(id)
    }

    async fn write(&self, path: &str, key: &str, value: Value) -> Result<()> {
        let mut guard = self.collections.lock();
        let slot = guard.entry(path.to_string()).or_insert_with(Slot::new);
        slot.records.insert(key.to_string(), value);
        slot.publish();
        Ok(())
    }

    async fn merge(&self, path: &str, key: &str, patch: Value) -> Result<()> {
        let mut guard = self.collections.lock();
        let slot = guard.entry(path.to_string()).or_insert_with(Slot::new);
        match slot.records.get_mut(key) {
            Some(record) if !record.is_null() => deep_merge(record, &patch),
            _ => bail!("not_found"),
        }
        slot.publish();
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Snapshot> {
        let guard = self.collections.lock();
        Ok(guard
            .get(path)
            .map(|slot| slot.records.clone())
            .unwrap_or_default())
    }

    fn watch(&self, path: &str) -> broadcast::Receiver<Snapshot> {
        let mut guard = self.collections.lock();
        let slot = guard.entry(path.to_string()).or_insert_with(Slot::new);
        slot.tx.subscribe()
    }
}

/// Recursive field-level merge. Objects merge per key, `null` deletes the
/// named key, every other value replaces the previous one.
pub fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(existing), Value::Object(fields)) => {
            for (key, value) in fields {
                if value.is_null() {
                    existing.remove(key);
                } else if !existing.contains_key(key) {
                    existing.insert(key.clone(), without_nulls(value));
                } else if let Some(current) = existing.get_mut(key) {
                    if current.is_object() && value.is_object() {
                        deep_merge(current, value);
                    } else {
                        *current = without_nulls(value);
                    }
                }
            }
        }
        (target, patch) => *target = without_nulls(patch),
    }
}

// A null in a patch means "ensure absent"; it must never be stored verbatim.
fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// Generated ids carry a millisecond prefix so later pushes compare greater,
// mirroring the managed store's id scheme. Pushes inside the same
// millisecond increment the previous random suffix to stay ordered.
const PUSH_ALPHABET: &[u8; 64] =
    b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

#[derive(Default)]
struct PushState {
    last_ms: i64,
    suffix: [usize; 12],
}

fn next_push_id(state: &mut PushState, now_ms: i64) -> String {
    if now_ms != state.last_ms {
        state.last_ms = now_ms;
        let mut rng = rand::thread_rng();
        for slot in state.suffix.iter_mut() {
            *slot = rng.gen_range(0..64);
        }
    } else {
        for slot in state.suffix.iter_mut().rev() {
            if *slot < 63 {
                *slot += 1;
                break;
            }
            *slot = 0;
        }
    }
    let mut prefix = [0u8; 8];
    let mut ts = now_ms;
    for byte in prefix.iter_mut().rev() {
        *byte = PUSH_ALPHABET[(ts & 0x3f) as usize];
        ts >>= 6;
    }
    let mut id = String::with_capacity(20);
    id.extend(prefix.iter().map(|&b| b as char));
    for &slot in state.suffix.iter() {
        id.push(PUSH_ALPHABET[slot] as char);
    }
    id
}
