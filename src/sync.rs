//! The synchronizer: turns pending bindings into bulk remote calls and folds
//! the per-item results back into binding state.
//!
//! Export and delete both partition their input into three disjoint subsets
//! (done, warning, exception) that together cover it exactly. A transient
//! remote failure aborts the whole call instead, leaving every outcome
//! untouched so the caller can rerun the job.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::db::{self, BindingForSync, Pool};
use crate::mapping::{MERCHANT_KEY, NAME_KEY, PARENT_KEY};
use crate::model::Account;
use crate::remote::model::BulkResponse;
use crate::remote::ChannelApi;

/// The bulk endpoint accepts at most 10000 entries per call, and every
/// variant item may bring one synthesized parent entry with it. In the worst
/// case each item contributes a distinct parent, so batches stop at half the
/// ceiling.
pub const EXPORT_BATCH_SIZE: usize = 5000;

/// Disjoint classification of one export/delete run over its input set.
#[derive(Debug, Default)]
pub struct Partition {
    pub done: Vec<BindingForSync>,
    pub warning: Vec<BindingForSync>,
    pub exception: Vec<BindingForSync>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.done.len() + self.warning.len() + self.exception.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ids(bindings: &[BindingForSync]) -> Vec<i64> {
        bindings.iter().map(|b| b.id).collect()
    }
}

/// Export pending bindings to the channel. Returns the partition after
/// applying terminal transitions: done/warning land in `state=done`,
/// exceptions keep their state and get `outcome=error`.
pub async fn export(
    pool: &Pool,
    api: &dyn ChannelApi,
    account: &Account,
    bindings: Vec<BindingForSync>,
) -> Result<Partition> {
    let total = bindings.len();
    let mut partition = Partition::default();
    let mut messages: Vec<(i64, String)> = Vec::new();

    for batch in into_batches(bindings, EXPORT_BATCH_SIZE) {
        let payload = batch_payload(&batch);
        match api.create_or_update(account, &payload).await {
            Ok(response) => {
                let classified = classify_response(batch, &response);
                partition.done.extend(classified.done);
                partition.warning.extend(classified.warning);
                partition.exception.extend(classified.exception);
                messages.extend(classified.messages);
            }
            Err(err) if err.is_transient() => {
                // Not swallowed: the whole job is retried later, and no
                // binding outcome may be recorded for this attempt.
                return Err(err).context("transient failure during export; job will be retried");
            }
            Err(err) => {
                warn!(account = %account.name, %err, "bulk export rejected, batch parked");
                partition.exception.extend(batch);
            }
        }
    }

    for (id, message) in &messages {
        db::set_binding_message(pool, *id, message).await?;
    }
    db::mark_done(pool, &Partition::ids(&partition.done), false).await?;
    db::mark_done(pool, &Partition::ids(&partition.warning), true).await?;
    db::mark_exception(pool, &Partition::ids(&partition.exception)).await?;

    info!(
        account = %account.name,
        total,
        done = partition.done.len(),
        warning = partition.warning.len(),
        exception = partition.exception.len(),
        "export finished"
    );
    Ok(partition)
}

/// Delete bindings from the channel, one call per binding (the delete
/// endpoint is single-item). A missing external key or a "not found" reply
/// counts as already-removed. Confirmed removals are deleted from the store;
/// orphaned parent entries are cleaned up best-effort.
pub async fn delete(
    pool: &Pool,
    api: &dyn ChannelApi,
    account: &Account,
    bindings: Vec<BindingForSync>,
) -> Result<Partition> {
    let total = bindings.len();
    let mut partition = Partition::default();
    let mut messages: Vec<(i64, String)> = Vec::new();

    for binding in bindings {
        let key = binding
            .data
            .as_ref()
            .and_then(|d| d.get(MERCHANT_KEY))
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        let Some(key) = key else {
            // Never exported under a key: nothing to remove remotely.
            partition.done.push(binding);
            continue;
        };

        match api.delete(account, &key).await {
            Ok(response) if response.success => partition.done.push(binding),
            Ok(response) => {
                let message = response
                    .message
                    .unwrap_or_else(|| "deletion failed without a message".to_string());
                warn!(
                    binding = %binding.display_name(&account.name),
                    %message,
                    "deletion failed"
                );
                messages.push((binding.id, message));
                partition.exception.push(binding);
            }
            Err(err) if err.is_not_found() => partition.done.push(binding),
            Err(err) if !err.is_transient() => {
                warn!(binding = %binding.display_name(&account.name), %err, "deletion rejected");
                messages.push((binding.id, err.to_string()));
                partition.exception.push(binding);
            }
            Err(err) => {
                return Err(err).context("transient failure during delete; job will be retried");
            }
        }
    }

    remove_orphaned_parents(pool, api, account, &partition.done).await?;

    for (id, message) in &messages {
        db::set_binding_message(pool, *id, message).await?;
    }
    db::delete_bindings(pool, &Partition::ids(&partition.done), true).await?;
    db::mark_exception(pool, &Partition::ids(&partition.exception)).await?;

    info!(
        account = %account.name,
        total,
        removed = partition.done.len(),
        exception = partition.exception.len(),
        "removal finished"
    );
    Ok(partition)
}

/// After removing the last bound variant of a family, the synthesized parent
/// entry is orphaned on the platform. Removal is best-effort only: failures
/// are logged and never escalate.
async fn remove_orphaned_parents(
    pool: &Pool,
    api: &dyn ChannelApi,
    account: &Account,
    removed: &[BindingForSync],
) -> Result<()> {
    let removed_ids: HashSet<i64> = removed.iter().map(|b| b.id).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    for binding in removed {
        let Some(family_key) = binding.family_key.as_deref() else {
            continue;
        };
        if !seen.insert(family_key) {
            continue;
        }
        let survivors = db::family_binding_ids(pool, account.id, family_key)
            .await?
            .into_iter()
            .filter(|id| !removed_ids.contains(id))
            .count();
        if survivors > 0 {
            continue;
        }
        if let Err(err) = api.delete(account, family_key).await {
            warn!(%family_key, %err, "failed to remove orphaned parent entry");
        }
    }
    Ok(())
}

fn into_batches(mut bindings: Vec<BindingForSync>, size: usize) -> Vec<Vec<BindingForSync>> {
    let mut batches = Vec::new();
    while bindings.len() > size {
        let tail = bindings.split_off(size);
        batches.push(std::mem::replace(&mut bindings, tail));
    }
    if !bindings.is_empty() {
        batches.push(bindings);
    }
    batches
}

/// Parent entries synthesized for one batch: one per distinct grouping key,
/// named after the product family.
fn parent_entries(batch: &[BindingForSync]) -> Vec<Value> {
    let mut processed: HashSet<&str> = HashSet::new();
    let mut parents = Vec::new();
    for binding in batch {
        let parent_no = binding
            .data
            .as_ref()
            .and_then(|d| d.get(PARENT_KEY))
            .and_then(Value::as_str);
        let Some(parent_no) = parent_no else { continue };
        if !processed.insert(parent_no) {
            continue;
        }
        let name = binding
            .family_display_name
            .as_deref()
            .unwrap_or(binding.product_name.as_str());
        let mut parent = serde_json::Map::new();
        parent.insert(NAME_KEY.to_string(), Value::String(name.to_string()));
        parent.insert(MERCHANT_KEY.to_string(), Value::String(parent_no.to_string()));
        parents.push(Value::Object(parent));
    }
    parents
}

fn batch_payload(batch: &[BindingForSync]) -> Vec<Value> {
    let mut payload = parent_entries(batch);
    payload.extend(batch.iter().map(|b| {
        b.data
            .clone()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()))
    }));
    payload
}

fn rendered_name(binding: &BindingForSync) -> Option<&str> {
    binding
        .data
        .as_ref()
        .and_then(|d| d.get(NAME_KEY))
        .and_then(Value::as_str)
}

/// Correlate a per-item result back to its binding.
///
/// The platform reports results by the rendered `Name` field, not by the
/// external key, so two products rendering the same name are ambiguous. The
/// first match wins and the collision is logged; switching the protocol to
/// key-based matching only needs to change this function.
fn match_result<'a>(batch: &'a [BindingForSync], name: &str) -> Option<&'a BindingForSync> {
    let mut matches = batch.iter().filter(|b| rendered_name(b) == Some(name));
    let first = matches.next();
    if matches.next().is_some() {
        warn!(%name, "multiple bindings render the same name; result matching is ambiguous");
    }
    first
}

struct Classified {
    done: Vec<BindingForSync>,
    warning: Vec<BindingForSync>,
    exception: Vec<BindingForSync>,
    messages: Vec<(i64, String)>,
}

/// Fold one bulk response into a batch partition. Bindings without an
/// error/warning result are done; messages aimed at synthesized parents
/// match no binding and are skipped.
fn classify_response(batch: Vec<BindingForSync>, response: &BulkResponse) -> Classified {
    if !response.success {
        return Classified {
            done: Vec::new(),
            warning: Vec::new(),
            exception: batch,
            messages: Vec::new(),
        };
    }

    // true = error, false = warning only
    let mut flagged: HashMap<i64, bool> = HashMap::new();
    let mut messages: Vec<(i64, String)> = Vec::new();
    let empty = crate::remote::model::BulkContent::default();
    let content = response.content.as_ref().unwrap_or(&empty);

    for item in &content.product_messages {
        if item.warnings.is_empty() && item.errors.is_empty() {
            continue;
        }
        let Some(name) = item.name.as_deref() else {
            continue;
        };
        let Some(binding) = match_result(&batch, name) else {
            continue;
        };
        let mut log = vec![format!("Date: {}", Utc::now())];
        log.extend(item.warnings.iter().cloned());
        log.extend(item.errors.iter().cloned());
        messages.push((binding.id, log.join("\n\n")));

        let entry = flagged.entry(binding.id).or_insert(false);
        *entry = *entry || !item.errors.is_empty();
    }

    let error_count = flagged.values().filter(|is_error| **is_error).count() as i64;
    if error_count != content.rejected_count {
        warn!(
            error_count,
            rejected_count = content.rejected_count,
            "response rejected-count does not match classified errors"
        );
    }

    let mut classified = Classified {
        done: Vec::new(),
        warning: Vec::new(),
        exception: Vec::new(),
        messages,
    };
    for binding in batch {
        match flagged.get(&binding.id) {
            Some(true) => classified.exception.push(binding),
            Some(false) => classified.warning.push(binding),
            None => classified.done.push(binding),
        }
    }
    classified
}
