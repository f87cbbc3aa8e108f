//! The reconciliation scheduler: one pass drains the per-account work
//! queues under a row limit.
//!
//! Each pass is run-to-completion and single-threaded; overlapping passes
//! are the invoker's problem (the main loop never starts one before the
//! previous finished). A transient remote failure aborts the pass with an
//! error so the invoker reruns the whole job later.

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::db::{self, AccountSpec, BindingForSync, Pool};
use crate::mapping;
use crate::membership;
use crate::model::{Account, SyncState};
use crate::remote::ChannelApi;
use crate::sync;

#[derive(Debug, Default, Clone, Copy)]
pub struct PassSummary {
    pub products_checked: usize,
    pub rerendered: usize,
    pub exported: usize,
    pub export_errors: usize,
    pub removed: usize,
    pub removal_errors: usize,
}

/// Upsert the configured account roster. A changed inclusion predicate
/// triggers a full membership scan; a changed mapping fingerprint flags the
/// account's bindings for recheck (done inside the upsert).
pub async fn apply_roster(pool: &Pool, specs: &[AccountSpec]) -> Result<()> {
    let mut domain_changed = false;
    let mut mapping_changed = false;
    for spec in specs {
        let applied = db::upsert_account(pool, spec).await?;
        info!(
            account = %spec.name,
            domain_changed = applied.domain_changed,
            mapping_changed = applied.mapping_changed,
            "account applied"
        );
        domain_changed |= applied.domain_changed;
        mapping_changed |= applied.mapping_changed;
    }
    if !domain_changed && !mapping_changed {
        return Ok(());
    }

    let accounts = db::list_accounts(pool).await?;
    let products = db::list_products(pool).await?;
    if domain_changed {
        membership::evaluate_all(pool, &accounts, &products).await?;
    }
    // Dry-run each mapping over the catalog: missing or duplicated external
    // keys would be rejected by the platform item by item, so tell the
    // operator now.
    for account in &accounts {
        for finding in mapping::check_configuration(&account.mapping, &products) {
            warn!(account = %account.name, %finding, "mapping configuration check");
        }
    }
    Ok(())
}

/// One scheduling pass: membership for flagged products, then per account
/// the recheck, export and removal queues, every query bounded by `limit`
/// rows. Accounts are processed independently and sequentially.
#[instrument(skip_all)]
pub async fn run_pass(pool: &Pool, api: &dyn ChannelApi, limit: i64) -> Result<PassSummary> {
    let accounts = db::list_accounts(pool).await?;
    let mut summary = PassSummary::default();

    let products = db::products_needing_check(pool, limit).await?;
    summary.products_checked = products.len();
    if !products.is_empty() {
        membership::evaluate_all(pool, &accounts, &products).await?;
    }

    for account in &accounts {
        let stale = db::recheck_queue(pool, account.id, limit).await?;
        summary.rerendered += recompute(pool, account, &stale).await?;

        let pending = db::export_queue(pool, account.id, limit).await?;
        if !pending.is_empty() {
            let partition = sync::export(pool, api, account, pending).await?;
            summary.exported += partition.done.len() + partition.warning.len();
            summary.export_errors += partition.exception.len();
        }

        let removals = db::removal_queue(pool, account.id, limit).await?;
        if !removals.is_empty() {
            let partition = sync::delete(pool, api, account, removals).await?;
            summary.removed += partition.done.len();
            summary.removal_errors += partition.exception.len();
        }
    }

    info!(
        products_checked = summary.products_checked,
        rerendered = summary.rerendered,
        exported = summary.exported,
        export_errors = summary.export_errors,
        removed = summary.removed,
        removal_errors = summary.removal_errors,
        "pass finished"
    );
    Ok(summary)
}

/// Re-render stale bindings against the account's mapping and detect data
/// changes. Returns how many snapshots actually changed.
///
/// Idempotent: an unchanged render only acknowledges the recheck flag, so
/// states and outcomes set by earlier passes survive unrelated triggers.
#[instrument(skip_all, fields(account = %account.name))]
pub async fn recompute(pool: &Pool, account: &Account, bindings: &[BindingForSync]) -> Result<usize> {
    let mut changed = 0;
    for binding in bindings {
        // Terminal-pending-deletion: never re-rendered.
        if binding.state == SyncState::ToRemove {
            continue;
        }
        let product = db::get_product(pool, binding.product_id).await?;
        let rendered = serde_json::Value::Object(account.mapping.render(&product));
        if binding.data.as_ref() == Some(&rendered) {
            db::clear_binding_recheck(pool, binding.id).await?;
        } else {
            db::store_binding_data(pool, binding.id, &rendered).await?;
            changed += 1;
        }
    }
    Ok(changed)
}

/// Maintenance entry point: recompute the data of every binding, then
/// re-evaluate the domain over the full catalog. Used by `--check-all`.
pub async fn check_all(pool: &Pool) -> Result<()> {
    let accounts = db::list_accounts(pool).await?;
    for account in &accounts {
        let bindings = db::all_bindings_for_account(pool, account.id).await?;
        recompute(pool, account, &bindings).await?;
    }
    let products = db::list_products(pool).await?;
    membership::evaluate_all(pool, &accounts, &products).await?;
    Ok(())
}
