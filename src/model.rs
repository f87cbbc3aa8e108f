use serde::{Deserialize, Serialize};

use crate::domain::Predicate;
use crate::mapping::ExportMapping;

/// Lifecycle stage of a binding. `ToRemove` is terminal-pending-deletion:
/// such a binding is never re-rendered, only deleted once the remote
/// confirms removal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncState {
    New,
    Todo,
    ToRemove,
    Done,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::New => "new",
            SyncState::Todo => "todo",
            SyncState::ToRemove => "toremove",
            SyncState::Done => "done",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "new" => Some(SyncState::New),
            "todo" => Some(SyncState::Todo),
            "toremove" => Some(SyncState::ToRemove),
            "done" => Some(SyncState::Done),
            _ => None,
        }
    }
}

/// Classification of the last sync attempt, independent of [`SyncState`].
/// An `Error` outcome parks the binding until an operator clears it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Warning,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Warning => "warning",
            Outcome::Error => "error",
        }
    }

    pub fn parse_outcome(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(Outcome::Ok),
            "warning" => Some(Outcome::Warning),
            "error" => Some(Outcome::Error),
            _ => None,
        }
    }
}

/// One configured destination on the channel platform, with its own
/// inclusion rule and export mapping. At most one account per host.
#[derive(Debug, Clone)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub api_key: String,
    pub domain: Predicate,
    pub mapping: ExportMapping,
    /// Dependency fingerprint of the mapping; bindings are flagged for
    /// recheck only when this changes.
    pub depends: String,
}

/// Catalog product as consumed by the connector. The catalog feed owns every
/// field; the connector only ever clears `needs_recheck`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub sku: Option<String>,
    pub active: bool,
    /// Grouping key shared by sibling variants; set iff the product has
    /// siblings on the platform.
    pub family_key: Option<String>,
    pub family_display_name: Option<String>,
    pub category_trail: Option<String>,
    pub needs_recheck: bool,
}

/// Category names arrive as `A/B/C` paths; the platform wants `A>B>C`.
pub fn category_trail(complete_name: &str) -> String {
    complete_name.replace('/', ">")
}
