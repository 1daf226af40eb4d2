//! Session-local widget values that survive across script runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use crate::core::client_state::{WidgetStates, WidgetValue};
use crate::sync::lock_unpoisoned;

/// Widget values keyed by widget id.
///
/// Written by the script thread while a run registers widgets, and by the loop thread when
/// a rerun request or a cache clear arrives. Every access takes the internal lock.
#[derive(Debug, Default)]
pub struct WidgetStateStore {
    values: Mutex<BTreeMap<String, WidgetValue>>,
}

impl WidgetStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_states(states: &WidgetStates) -> Self {
        let store = Self::new();
        store.apply(states);
        store
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<WidgetValue> {
        lock_unpoisoned(&self.values).get(id).cloned()
    }

    pub fn set(&self, id: impl Into<String>, value: WidgetValue) {
        lock_unpoisoned(&self.values).insert(id.into(), value);
    }

    /// Current value of widget `id`, inserting `default` the first time it is seen.
    pub fn register(&self, id: &str, default: WidgetValue) -> WidgetValue {
        lock_unpoisoned(&self.values)
            .entry(id.to_string())
            .or_insert(default)
            .clone()
    }

    /// Overwrites stored values with the ones reported by the browser.
    pub fn apply(&self, states: &WidgetStates) {
        let mut values = lock_unpoisoned(&self.values);
        for (id, value) in states.iter() {
            values.insert(id.clone(), value.clone());
        }
    }

    /// Called right before a run starts.
    pub fn on_script_will_rerun(&self, states: Option<&WidgetStates>) {
        if let Some(states) = states {
            self.apply(states);
        }
    }

    /// Called after a run completes: forgets widgets the run did not create and resets
    /// triggers so a button press fires exactly one run.
    pub fn on_script_finished(&self, seen_widget_ids: &HashSet<String>) {
        let mut values = lock_unpoisoned(&self.values);
        values.retain(|id, _| seen_widget_ids.contains(id));
        for value in values.values_mut() {
            if value.is_trigger() {
                *value = WidgetValue::Trigger(false);
            }
        }
    }

    #[must_use]
    pub fn as_widget_states(&self) -> WidgetStates {
        lock_unpoisoned(&self.values)
            .iter()
            .map(|(id, value)| (id.clone(), value.clone()))
            .collect()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.values).clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.values).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.values).is_empty()
    }
}
