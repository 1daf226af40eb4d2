//! Client-side state carried by rerun requests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Value of one interactive widget as reported by the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WidgetValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringArray(Vec<String>),
    /// Momentary value (button press). Reset to `false` after every run.
    Trigger(bool),
}

impl WidgetValue {
    #[must_use]
    pub fn is_trigger(&self) -> bool {
        matches!(self, Self::Trigger(_))
    }

    #[must_use]
    pub fn is_fired_trigger(&self) -> bool {
        matches!(self, Self::Trigger(true))
    }
}

/// Widget values keyed by widget id.
///
/// Backed by a `BTreeMap` so serialization (and therefore message hashing) is
/// independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WidgetStates {
    values: BTreeMap<String, WidgetValue>,
}

impl WidgetStates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<String>, value: WidgetValue) -> Option<WidgetValue> {
        self.values.insert(id.into(), value)
    }

    #[must_use]
    pub fn with(mut self, id: impl Into<String>, value: WidgetValue) -> Self {
        self.insert(id, value);
        self
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&WidgetValue> {
        self.values.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &WidgetValue)> {
        self.values.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, WidgetValue)> for WidgetStates {
    fn from_iter<I: IntoIterator<Item = (String, WidgetValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Merges the widget states of two rerun requests that are being coalesced into one.
///
/// Values come from `new_states`, except that a trigger which fired in `old_states` is kept
/// when the newer request reports the same widget as an unfired trigger. Without this a
/// button press followed quickly by another interaction would be lost.
#[must_use]
pub fn coalesce_widget_states(
    old_states: Option<WidgetStates>,
    new_states: Option<WidgetStates>,
) -> Option<WidgetStates> {
    let (old_states, mut new_states) = match (old_states, new_states) {
        (None, None) => return None,
        (None, Some(new_states)) => return Some(new_states),
        (Some(old_states), None) => return Some(old_states),
        (Some(old_states), Some(new_states)) => (old_states, new_states),
    };

    for (id, old_value) in old_states.values {
        if !old_value.is_fired_trigger() {
            continue;
        }

        let new_is_trigger = new_states
            .values
            .get(&id)
            .is_some_and(WidgetValue::is_trigger);
        if new_is_trigger {
            new_states.values.insert(id, old_value);
        }
    }

    Some(new_states)
}

/// The browser-side state a rerun is performed against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientState {
    pub query_string: String,
    pub widget_states: WidgetStates,
}

impl ClientState {
    #[must_use]
    pub fn new(query_string: impl Into<String>, widget_states: WidgetStates) -> Self {
        Self {
            query_string: query_string.into(),
            widget_states,
        }
    }

    /// Copy of this state with every fired trigger reset, safe to replay in a later rerun.
    #[must_use]
    pub fn without_fired_triggers(&self) -> Self {
        let widget_states = self
            .widget_states
            .iter()
            .map(|(id, value)| {
                let value = if value.is_fired_trigger() {
                    WidgetValue::Trigger(false)
                } else {
                    value.clone()
                };
                (id.clone(), value)
            })
            .collect();
        Self {
            query_string: self.query_string.clone(),
            widget_states,
        }
    }
}
