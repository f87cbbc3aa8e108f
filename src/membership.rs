//! Membership evaluation: which products belong on which account.
//!
//! The inclusion predicate is the sole authority on a binding's existence.
//! Products flag themselves (`needs_recheck`) whenever an attribute changes;
//! the scheduler feeds the flagged set through here against every account.

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::db::{self, Pool};
use crate::model::{Account, Product, SyncState};

/// Evaluate one account's domain over a set of candidate products, creating
/// and re-marking bindings as products move in or out. No remote calls.
///
/// A predicate evaluation failure is a configuration error: it propagates to
/// the operator instead of being retried.
#[instrument(skip_all, fields(account = %account.name))]
pub async fn evaluate(pool: &Pool, account: &Account, products: &[Product]) -> Result<()> {
    for product in products {
        let in_domain = account
            .domain
            .eval(product)
            .with_context(|| format!("domain of account {} is not correctly set", account.name))?
            && product.active;

        match db::get_binding_brief(pool, account.id, product.id).await? {
            None => {
                if in_domain {
                    let id = db::create_binding(pool, account.id, product.id).await?;
                    debug!(binding = id, product = %product.name, "product entered domain");
                }
            }
            Some(binding) if !in_domain => {
                db::mark_binding_toremove(pool, binding.id).await?;
                debug!(binding = binding.id, product = %product.name, "product left domain");
            }
            Some(binding) => {
                // Still in domain: a pending removal is cancelled, and the
                // product change may have touched rendered fields.
                if binding.state == SyncState::ToRemove {
                    db::reopen_binding(pool, binding.id).await?;
                } else {
                    db::flag_binding_recheck(pool, binding.id).await?;
                }
            }
        }
    }
    Ok(())
}

/// Evaluate the candidate set against every account, then acknowledge the
/// products' recheck flags. Flags are only cleared after ALL accounts have
/// seen the products.
pub async fn evaluate_all(pool: &Pool, accounts: &[Account], products: &[Product]) -> Result<()> {
    for account in accounts {
        evaluate(pool, account, products).await?;
    }
    let ids: Vec<i64> = products.iter().map(|p| p.id).collect();
    db::clear_product_checks(pool, &ids).await?;
    Ok(())
}
