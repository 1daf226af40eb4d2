//! UI mutation payloads produced by a script run.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::client_state::WidgetValue;

/// An exception rendered in place of the element that raised it, or at session level for
/// compile errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{type_name}: {message}")]
pub struct ExceptionInfo {
    pub type_name: String,
    pub message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
    #[serde(default)]
    pub is_warning: bool,
}

impl ExceptionInfo {
    #[must_use]
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            stack_trace: Vec::new(),
            is_warning: false,
        }
    }

    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "element", rename_all = "snake_case")]
pub enum Element {
    Empty,
    Text {
        body: String,
    },
    Markdown {
        body: String,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Exception(ExceptionInfo),
    Widget {
        id: String,
        kind: String,
        value: Option<WidgetValue>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Vertical,
    Horizontal,
    Expandable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub kind: BlockKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A single unit of UI mutation at one delta path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "delta", rename_all = "snake_case")]
pub enum Delta {
    NewElement { element: Element },
    AddBlock { block: Block },
    AddRows { rows: Vec<Vec<String>> },
}

impl Delta {
    #[must_use]
    pub fn new_element(element: Element) -> Self {
        Self::NewElement { element }
    }

    #[must_use]
    pub fn text(body: impl Into<String>) -> Self {
        Self::new_element(Element::Text { body: body.into() })
    }

    #[must_use]
    pub fn exception(info: ExceptionInfo) -> Self {
        Self::new_element(Element::Exception(info))
    }

    /// Folds `self` (queued earlier at some delta path) and `new` (targeting the same
    /// path) into one delta.
    ///
    /// Returns `Err(new)` when the two cannot be composed and both must be sent.
    pub fn compose(&self, new: Delta) -> Result<Delta, Delta> {
        // Later deltas address children of a block by path, so a queued block is never
        // replaced.
        if matches!(self, Delta::AddBlock { .. }) {
            return Err(new);
        }

        match new {
            Delta::NewElement { .. } | Delta::AddBlock { .. } => Ok(new),
            Delta::AddRows { rows } => match self {
                Delta::NewElement {
                    element:
                        Element::Table {
                            columns,
                            rows: existing,
                        },
                } => {
                    let mut combined = existing.clone();
                    combined.extend(rows);
                    Ok(Delta::NewElement {
                        element: Element::Table {
                            columns: columns.clone(),
                            rows: combined,
                        },
                    })
                }
                _ => Err(Delta::AddRows { rows }),
            },
        }
    }
}
