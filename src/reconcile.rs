use std::collections::HashMap;

use crate::model::Message;
use crate::store::Snapshot;

/// Merge a raw snapshot into the authoritative ordered message list.
///
/// Tombstoned slots and records missing required fields are skipped rather
/// than failing the whole view. Records are deduplicated by message id: a
/// copy stored under a slot key equal to its id is server-confirmed and wins
/// over an optimistic echo parked under a provisional key. The result is
/// sorted ascending by normalized timestamp with the id as secondary key, so
/// equal timestamps order the same on every client.
pub fn reconcile(snapshot: &Snapshot) -> Vec<Message> {
    let mut by_id: HashMap<String, (Message, bool)> = HashMap::new();
    for (key, value) in snapshot {
        if is_tombstone(value) {
            continue;
        }
        let mut message: Message = match serde_json::from_value(value.clone()) {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(slot = %key, error = %e, "skipping malformed record");
                continue;
            }
        };
        let confirmed = message.id.is_empty() || message.id == *key;
        if message.id.is_empty() {
            message.id = key.clone();
        }
        let keep_existing = by_id
            .get(&message.id)
            .map_or(false, |(_, existing_confirmed)| {
                *existing_confirmed && !confirmed
            });
        if !keep_existing {
            by_id.insert(message.id.clone(), (message, confirmed));
        }
    }
    let mut messages: Vec<Message> = by_id.into_values().map(|(m, _)| m).collect();
    messages.sort_by(|a, b| {
        a.timestamp
            .millis()
            .cmp(&b.timestamp.millis())
            .then_with(|| a.id.cmp(&b.id))
    });
    messages
}

// A deletion clears the slot; both the null and the empty-object spelling
// mean "gone" to consumers.
fn is_tombstone(value: &serde_json::Value) -> bool {
    value.is_null() || value.as_object().map_or(false, |o| o.is_empty())
}
