//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business
//! logic lives in the membership/sync layers.

use serde_json::Value;

use crate::model::{Outcome, SyncState};

/// Binding slice used by the synchronizer: the binding row joined with the
/// product fields needed to build parent entries and remove orphans.
#[derive(Debug, Clone)]
pub struct BindingForSync {
    pub id: i64,
    pub account_id: i64,
    pub product_id: i64,
    pub state: SyncState,
    pub outcome: Outcome,
    pub needs_recheck: bool,
    pub data: Option<Value>,
    pub product_name: String,
    pub family_key: Option<String>,
    pub family_display_name: Option<String>,
}

impl BindingForSync {
    /// `account/product` label used in diagnostics.
    pub fn display_name(&self, account_name: &str) -> String {
        format!("{}/{}", account_name, self.product_name)
    }
}

/// Minimal binding slice used by the membership evaluator.
#[derive(Debug, Clone, Copy)]
pub struct BindingBrief {
    pub id: i64,
    pub state: SyncState,
}
