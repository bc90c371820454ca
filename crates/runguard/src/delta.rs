//! Delta encoding for streamed run-state events.
//!
//! A streaming transport re-sends the same named state (`"type"`) over and
//! over; most of the time nothing changed. [`DeltaEncoder`] remembers the
//! last serialized value per event type and suppresses exact repeats.
//!
//! The table is bounded. Insertion order defines eviction order and updating
//! an existing key does not move it. An evicted key is indistinguishable
//! from one never seen: its next event is always emitted in full.

use crate::error::GovernResult;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Configuration for a [`DeltaEncoder`].
#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct DeltaConfig {
    /// Maximum number of tracked event types. Default: 1000.
    pub max_entries: usize,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self { max_entries: 1000 }
    }
}

/// Bounded, insertion-ordered table of `type -> last serialized event`.
#[derive(Debug)]
pub struct DeltaEncoder {
    slots: IndexMap<String, String>,
    max_entries: usize,
    /// Events emitted in full, for diagnostics.
    emitted: u64,
    /// Events suppressed as unchanged, for diagnostics.
    suppressed: u64,
}

impl Default for DeltaEncoder {
    fn default() -> Self {
        Self::new(DeltaConfig::default())
    }
}

impl DeltaEncoder {
    pub fn new(config: DeltaConfig) -> Self {
        Self {
            slots: IndexMap::new(),
            max_entries: config.max_entries.max(1),
            emitted: 0,
            suppressed: 0,
        }
    }

    /// Serialize `event` and return it, or `None` if it is unchanged since
    /// the last event of the same `type`.
    pub fn encode<E: Serialize>(&mut self, event: &E) -> GovernResult<Option<String>> {
        let value = serde_json::to_value(event)?;
        self.encode_value(&value)
    }

    /// Like [`encode`](Self::encode) for an already-built JSON event.
    ///
    /// Events without a string `type` are never tracked and always emitted.
    pub fn encode_value(&mut self, event: &Value) -> GovernResult<Option<String>> {
        let serialized = serde_json::to_string(event)?;

        let Some(key) = event.get("type").and_then(Value::as_str) else {
            self.emitted += 1;
            return Ok(Some(serialized));
        };

        if let Some(last) = self.slots.get_mut(key) {
            if *last == serialized {
                self.suppressed += 1;
                trace!(key, "Delta suppressed unchanged event");
                return Ok(None);
            }
            last.clone_from(&serialized);
            self.emitted += 1;
            return Ok(Some(serialized));
        }

        if self.slots.len() >= self.max_entries
            && let Some((evicted, _)) = self.slots.shift_remove_index(0)
        {
            trace!(%evicted, "Delta table full; evicted oldest key");
        }
        self.slots.insert(key.to_string(), serialized.clone());
        self.emitted += 1;
        Ok(Some(serialized))
    }

    /// Forget everything, e.g. when the transport reconnects. Counters
    /// restart from zero.
    pub fn reset(&mut self) {
        self.slots.clear();
        self.emitted = 0;
        self.suppressed = 0;
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Tracked keys, oldest first.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encoder(max_entries: usize) -> DeltaEncoder {
        DeltaEncoder::new(DeltaConfig { max_entries })
    }

    #[test]
    fn first_event_emitted_in_full() {
        let mut enc = DeltaEncoder::default();
        let out = enc.encode_value(&json!({"type": "status", "v": 1})).unwrap();
        assert_eq!(out.as_deref(), Some(r#"{"type":"status","v":1}"#));
    }

    #[test]
    fn unchanged_event_suppressed() {
        let mut enc = DeltaEncoder::default();
        enc.encode_value(&json!({"type": "status", "v": 1})).unwrap();
        assert!(enc.encode_value(&json!({"type": "status", "v": 1})).unwrap().is_none());
        assert_eq!(enc.suppressed(), 1);
    }

    #[test]
    fn changed_event_emitted() {
        let mut enc = DeltaEncoder::default();
        enc.encode_value(&json!({"type": "status", "v": 1})).unwrap();
        let out = enc.encode_value(&json!({"type": "status", "v": 2})).unwrap();
        assert!(out.unwrap().contains("\"v\":2"));
    }

    #[test]
    fn capacity_evicts_oldest_and_evicted_key_is_new_again() {
        let mut enc = encoder(2);
        enc.encode_value(&json!({"type": "A"})).unwrap();
        enc.encode_value(&json!({"type": "B"})).unwrap();
        enc.encode_value(&json!({"type": "C"})).unwrap();
        assert_eq!(enc.keys().collect::<Vec<_>>(), vec!["B", "C"]);

        // A was evicted, so an identical A is emitted in full.
        let out = enc.encode_value(&json!({"type": "A"})).unwrap();
        assert_eq!(out.as_deref(), Some(r#"{"type":"A"}"#));
        assert_eq!(enc.len(), 2);
    }

    #[test]
    fn updates_do_not_change_eviction_order() {
        let mut enc = encoder(2);
        enc.encode_value(&json!({"type": "A", "v": 1})).unwrap();
        enc.encode_value(&json!({"type": "B", "v": 1})).unwrap();
        // Updating A keeps it the oldest.
        assert!(enc.encode_value(&json!({"type": "A", "v": 2})).unwrap().is_some());
        enc.encode_value(&json!({"type": "C", "v": 1})).unwrap();

        assert_eq!(enc.keys().collect::<Vec<_>>(), vec!["B", "C"]);
    }

    #[test]
    fn untyped_events_always_emitted_and_untracked() {
        let mut enc = DeltaEncoder::default();
        let event = json!({"payload": 1});
        assert!(enc.encode_value(&event).unwrap().is_some());
        assert!(enc.encode_value(&event).unwrap().is_some());
        assert!(enc.is_empty());
    }

    #[test]
    fn encode_serializes_structs() {
        #[derive(Serialize)]
        struct StepEvent {
            #[serde(rename = "type")]
            kind: &'static str,
            step: u32,
        }

        let mut enc = DeltaEncoder::default();
        let event = StepEvent {
            kind: "step",
            step: 3,
        };
        assert!(enc.encode(&event).unwrap().is_some());
        assert!(enc.encode(&event).unwrap().is_none());
    }

    #[test]
    fn reset_forgets_everything() {
        let mut enc = DeltaEncoder::default();
        let event = json!({"type": "status"});
        enc.encode_value(&event).unwrap();
        enc.encode_value(&event).unwrap();
        assert_eq!((enc.emitted(), enc.suppressed()), (1, 1));

        enc.reset();
        assert!(enc.is_empty());
        assert_eq!((enc.emitted(), enc.suppressed()), (0, 0));
        assert!(enc.encode_value(&event).unwrap().is_some());
        assert_eq!((enc.emitted(), enc.suppressed()), (1, 0));
    }
}
