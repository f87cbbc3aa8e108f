use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

use super::model::{BindingBrief, BindingForSync};
use crate::domain::Predicate;
use crate::mapping::ExportMapping;
use crate::model::{category_trail, Account, Outcome, Product, SyncState};

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, ensure the parent directory exists.
/// Leaves in-memory URLs and non-sqlite schemes untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }
    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, _query) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if let Some(parent) = std::path::Path::new(path_part).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }
    url.to_string()
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Accounts

/// Operator-supplied account definition, upserted from the config roster.
#[derive(Debug, Clone)]
pub struct AccountSpec {
    pub name: String,
    pub host: String,
    pub api_key: String,
    pub domain: Predicate,
    pub mapping: ExportMapping,
}

/// Result of applying an [`AccountSpec`]: which cached evaluation state the
/// edit invalidated.
#[derive(Debug, Clone, Copy)]
pub struct AppliedAccount {
    pub id: i64,
    /// The inclusion predicate changed; a full membership scan is due.
    pub domain_changed: bool,
    /// The mapping fingerprint changed; bindings were flagged for recheck.
    pub mapping_changed: bool,
}

#[instrument(skip_all, fields(host = %spec.host))]
pub async fn upsert_account(pool: &Pool, spec: &AccountSpec) -> Result<AppliedAccount> {
    let domain_json = serde_json::to_string(&spec.domain)?;
    let mapping_json = serde_json::to_string(&spec.mapping)?;
    let depends = spec.mapping.fingerprint();

    let mut tx = pool.begin().await?;
    let existing = sqlx::query("SELECT id, domain, depends FROM accounts WHERE host = ?")
        .bind(&spec.host)
        .fetch_optional(&mut *tx)
        .await?;

    let applied = match existing {
        None => {
            let id: i64 = sqlx::query(
                "INSERT INTO accounts (name, host, api_key, domain, mapping, depends) \
                 VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(&spec.name)
            .bind(&spec.host)
            .bind(&spec.api_key)
            .bind(&domain_json)
            .bind(&mapping_json)
            .bind(&depends)
            .fetch_one(&mut *tx)
            .await?
            .get("id");
            AppliedAccount {
                id,
                domain_changed: true,
                mapping_changed: false,
            }
        }
        Some(row) => {
            let id: i64 = row.get("id");
            let old_domain: String = row.get("domain");
            let old_depends: String = row.get("depends");
            sqlx::query(
                "UPDATE accounts SET name = ?, api_key = ?, domain = ?, mapping = ?, depends = ? \
                 WHERE id = ?",
            )
            .bind(&spec.name)
            .bind(&spec.api_key)
            .bind(&domain_json)
            .bind(&mapping_json)
            .bind(&depends)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            let mapping_changed = old_depends != depends;
            if mapping_changed {
                sqlx::query("UPDATE bindings SET needs_recheck = 1 WHERE account_id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            AppliedAccount {
                id,
                domain_changed: old_domain != domain_json,
                mapping_changed,
            }
        }
    };
    tx.commit().await?;
    Ok(applied)
}

pub async fn list_accounts(pool: &Pool) -> Result<Vec<Account>> {
    let rows = sqlx::query("SELECT id, name, host, api_key, domain, mapping, depends FROM accounts ORDER BY id")
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(account_from_row).collect()
}

fn account_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Account> {
    let id: i64 = row.get("id");
    let domain_json: String = row.get("domain");
    let mapping_json: String = row.get("mapping");
    let domain: Predicate = serde_json::from_str(&domain_json)
        .with_context(|| format!("account {id} has an unreadable domain"))?;
    let mapping: ExportMapping = serde_json::from_str(&mapping_json)
        .with_context(|| format!("account {id} has an unreadable mapping"))?;
    Ok(Account {
        id,
        name: row.get("name"),
        host: row.get("host"),
        api_key: row.get("api_key"),
        domain,
        mapping,
        depends: row.get("depends"),
    })
}

// ---------------------------------------------------------------------------
// Products

/// Catalog feed row. `category` is the raw `A/B/C` path; the trail is
/// derived on write.
#[derive(Debug, Clone, Default)]
pub struct NewProduct {
    pub name: String,
    pub sku: Option<String>,
    pub active: bool,
    pub family_key: Option<String>,
    pub family_display_name: Option<String>,
    pub category: Option<String>,
}

#[instrument(skip_all, fields(name = %product.name))]
pub async fn insert_product(pool: &Pool, product: &NewProduct) -> Result<i64> {
    let trail = product.category.as_deref().map(category_trail);
    let rec = sqlx::query(
        "INSERT INTO products (name, sku, active, family_key, family_display_name, category_trail, needs_recheck) \
         VALUES (?, ?, ?, ?, ?, ?, 1) RETURNING id",
    )
    .bind(&product.name)
    .bind(&product.sku)
    .bind(product.active)
    .bind(&product.family_key)
    .bind(&product.family_display_name)
    .bind(&trail)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

/// Any catalog write may move the product in or out of an account's domain
/// or change its rendered data, so every update raises `needs_recheck`.
#[instrument(skip_all)]
pub async fn update_product(pool: &Pool, id: i64, product: &NewProduct) -> Result<()> {
    let trail = product.category.as_deref().map(category_trail);
    sqlx::query(
        "UPDATE products SET name = ?, sku = ?, active = ?, family_key = ?, \
         family_display_name = ?, category_trail = ?, needs_recheck = 1 WHERE id = ?",
    )
    .bind(&product.name)
    .bind(&product.sku)
    .bind(product.active)
    .bind(&product.family_key)
    .bind(&product.family_display_name)
    .bind(&trail)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_product_active(pool: &Pool, id: i64, active: bool) -> Result<()> {
    sqlx::query("UPDATE products SET active = ?, needs_recheck = 1 WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_product(pool: &Pool, id: i64) -> Result<Product> {
    let row = sqlx::query(
        "SELECT id, name, sku, active, family_key, family_display_name, category_trail, needs_recheck \
         FROM products WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        bail!("product {} not found", id);
    };
    Ok(product_from_row(row))
}

#[instrument(skip_all)]
pub async fn products_needing_check(pool: &Pool, limit: i64) -> Result<Vec<Product>> {
    let rows = sqlx::query(
        "SELECT id, name, sku, active, family_key, family_display_name, category_trail, needs_recheck \
         FROM products WHERE needs_recheck = 1 ORDER BY id LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(product_from_row).collect())
}

pub async fn list_products(pool: &Pool) -> Result<Vec<Product>> {
    let rows = sqlx::query(
        "SELECT id, name, sku, active, family_key, family_display_name, category_trail, needs_recheck \
         FROM products ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(product_from_row).collect())
}

#[instrument(skip_all)]
pub async fn clear_product_checks(pool: &Pool, ids: &[i64]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for id in ids {
        sqlx::query("UPDATE products SET needs_recheck = 0 WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

fn product_from_row(row: sqlx::sqlite::SqliteRow) -> Product {
    Product {
        id: row.get("id"),
        name: row.get("name"),
        sku: row.get("sku"),
        active: row.get("active"),
        family_key: row.get("family_key"),
        family_display_name: row.get("family_display_name"),
        category_trail: row.get("category_trail"),
        needs_recheck: row.get("needs_recheck"),
    }
}

// ---------------------------------------------------------------------------
// Bindings

pub async fn get_binding_brief(
    pool: &Pool,
    account_id: i64,
    product_id: i64,
) -> Result<Option<BindingBrief>> {
    let row = sqlx::query("SELECT id, state FROM bindings WHERE account_id = ? AND product_id = ?")
        .bind(account_id)
        .bind(product_id)
        .fetch_optional(pool)
        .await?;
    row.map(|row| {
        let id: i64 = row.get("id");
        let state_str: String = row.get("state");
        let state = SyncState::parse_state(&state_str)
            .ok_or_else(|| anyhow!("binding {} has unknown state {}", id, state_str))?;
        Ok(BindingBrief { id, state })
    })
    .transpose()
}

#[instrument(skip_all)]
pub async fn create_binding(pool: &Pool, account_id: i64, product_id: i64) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO bindings (account_id, product_id, state, outcome, needs_recheck) \
         VALUES (?, ?, 'new', 'ok', 1) RETURNING id",
    )
    .bind(account_id)
    .bind(product_id)
    .fetch_one(pool)
    .await
    .context("binding already exists for this account/product pair")?;
    Ok(rec.get::<i64, _>("id"))
}

/// The product left the account's domain: park the binding for removal and
/// reset any previous outcome.
#[instrument(skip_all)]
pub async fn mark_binding_toremove(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE bindings SET state = 'toremove', outcome = 'ok' WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// A membership change cancels a pending removal: pull the binding back to
/// `todo` and re-render before the next export.
#[instrument(skip_all)]
pub async fn reopen_binding(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE bindings SET state = 'todo', needs_recheck = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn flag_binding_recheck(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE bindings SET needs_recheck = 1 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Rendered data changed: store the new snapshot and queue the binding for
/// export, clearing any previous outcome.
#[instrument(skip_all)]
pub async fn store_binding_data(pool: &Pool, id: i64, data: &Value) -> Result<()> {
    sqlx::query(
        "UPDATE bindings SET data = ?, state = 'todo', outcome = 'ok', needs_recheck = 0 \
         WHERE id = ?",
    )
    .bind(serde_json::to_string(data)?)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Rendered data is unchanged: only acknowledge the recheck. State and
/// outcome stay untouched so an `error` left for the operator survives an
/// unrelated recheck trigger.
#[instrument(skip_all)]
pub async fn clear_binding_recheck(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE bindings SET needs_recheck = 0 WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_done(pool: &Pool, ids: &[i64], with_warning: bool) -> Result<()> {
    let outcome = if with_warning {
        Outcome::Warning
    } else {
        Outcome::Ok
    };
    let mut tx = pool.begin().await?;
    for id in ids {
        sqlx::query("UPDATE bindings SET state = 'done', outcome = ? WHERE id = ?")
            .bind(outcome.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// The remote rejected these bindings: record the error outcome but leave
/// the state as-is, so they stay eligible once the operator clears the
/// error.
#[instrument(skip_all)]
pub async fn mark_exception(pool: &Pool, ids: &[i64]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for id in ids {
        sqlx::query("UPDATE bindings SET outcome = 'error' WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_binding_message(pool: &Pool, id: i64, message: &str) -> Result<()> {
    sqlx::query("UPDATE bindings SET message = ? WHERE id = ?")
        .bind(message)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Operator acknowledgement: clear an error outcome so the scheduler picks
/// the binding up again.
#[instrument(skip_all)]
pub async fn acknowledge_error(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("UPDATE bindings SET outcome = 'ok' WHERE id = ? AND outcome = 'error'")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Bindings are only ever deleted by the reconciliation flow, after the
/// remote confirmed removal. A manual delete would be undone by the next
/// membership scan anyway, so it is rejected outright.
#[instrument(skip_all)]
pub async fn delete_bindings(pool: &Pool, ids: &[i64], synchronized: bool) -> Result<()> {
    if !synchronized {
        bail!(
            "bindings cannot be removed manually; take the product out of the \
             account's domain and let the scheduler remove it"
        );
    }
    let mut tx = pool.begin().await?;
    for id in ids {
        sqlx::query("DELETE FROM bindings WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Export queue: bindings ready to be pushed. Pending rechecks go through
/// the render pass first; error outcomes wait for the operator.
#[instrument(skip_all)]
pub async fn export_queue(pool: &Pool, account_id: i64, limit: i64) -> Result<Vec<BindingForSync>> {
    bindings_where(
        pool,
        account_id,
        "b.state IN ('new', 'todo') AND b.needs_recheck = 0 AND b.outcome != 'error'",
        limit,
    )
    .await
}

/// Removal queue: bindings parked for deletion, error outcomes excluded.
#[instrument(skip_all)]
pub async fn removal_queue(pool: &Pool, account_id: i64, limit: i64) -> Result<Vec<BindingForSync>> {
    bindings_where(
        pool,
        account_id,
        "b.state = 'toremove' AND b.outcome != 'error'",
        limit,
    )
    .await
}

/// Recheck queue: bindings whose membership or data may be stale.
#[instrument(skip_all)]
pub async fn recheck_queue(pool: &Pool, account_id: i64, limit: i64) -> Result<Vec<BindingForSync>> {
    bindings_where(pool, account_id, "b.needs_recheck = 1", limit).await
}

pub async fn all_bindings_for_account(pool: &Pool, account_id: i64) -> Result<Vec<BindingForSync>> {
    bindings_where(pool, account_id, "1 = 1", i64::MAX).await
}

async fn bindings_where(
    pool: &Pool,
    account_id: i64,
    clause: &str,
    limit: i64,
) -> Result<Vec<BindingForSync>> {
    let query = format!(
        "SELECT b.id, b.account_id, b.product_id, b.state, b.outcome, b.needs_recheck, b.data, \
                p.name AS product_name, p.family_key, p.family_display_name \
         FROM bindings b JOIN products p ON p.id = b.product_id \
         WHERE b.account_id = ? AND {clause} ORDER BY b.id LIMIT ?"
    );
    let rows = sqlx::query(&query)
        .bind(account_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(binding_from_row).collect()
}

fn binding_from_row(row: sqlx::sqlite::SqliteRow) -> Result<BindingForSync> {
    let id: i64 = row.get("id");
    let state_str: String = row.get("state");
    let state = SyncState::parse_state(&state_str)
        .ok_or_else(|| anyhow!("binding {} has unknown state {}", id, state_str))?;
    let outcome_str: String = row.get("outcome");
    let outcome = Outcome::parse_outcome(&outcome_str)
        .ok_or_else(|| anyhow!("binding {} has unknown outcome {}", id, outcome_str))?;
    let data = row
        .try_get::<Option<String>, _>("data")
        .ok()
        .flatten()
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .with_context(|| format!("binding {id} has unreadable data"))?;
    Ok(BindingForSync {
        id,
        account_id: row.get("account_id"),
        product_id: row.get("product_id"),
        state,
        outcome,
        needs_recheck: row.get("needs_recheck"),
        data,
        product_name: row.get("product_name"),
        family_key: row.get("family_key"),
        family_display_name: row.get("family_display_name"),
    })
}

/// Binding ids of every sibling variant in a family that is still bound to
/// this account. The caller filters out the bindings it is about to delete
/// to decide whether the synthesized parent entry is orphaned.
pub async fn family_binding_ids(
    pool: &Pool,
    account_id: i64,
    family_key: &str,
) -> Result<Vec<i64>> {
    let rows = sqlx::query(
        "SELECT b.id FROM bindings b JOIN products p ON p.id = b.product_id \
         WHERE b.account_id = ? AND p.family_key = ?",
    )
    .bind(account_id)
    .bind(family_key)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|row| row.get("id")).collect())
}
