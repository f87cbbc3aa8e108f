use serde::Deserialize;

/// Response of the bulk create-or-update call.
///
/// `rejected_count` may not match the number of error messages when items
/// lack a MerchantProductNo (those are rejected without a message); the
/// synchronizer treats a mismatch as log-worthy, never fatal.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct BulkResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub content: Option<BulkContent>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct BulkContent {
    #[serde(default)]
    pub accepted_count: i64,
    #[serde(default)]
    pub rejected_count: i64,
    #[serde(default)]
    pub product_messages: Vec<ProductMessage>,
}

/// Per-item result. Correlated back to bindings by `name`; the platform
/// does not echo the external key here.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ProductMessage {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct DeleteResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}
