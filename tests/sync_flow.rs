use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use channel_syncbot::db::{self, AccountSpec};
use channel_syncbot::domain::{Field, Op, Predicate};
use channel_syncbot::mapping::{ExportMapping, FieldMap, Source};
use channel_syncbot::model::Account;
use channel_syncbot::remote::model::{BulkContent, BulkResponse, DeleteResponse, ProductMessage};
use channel_syncbot::remote::{ChannelApi, RemoteError};
use channel_syncbot::{membership, scheduler, sync};

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn name_eq(value: &str) -> Predicate {
    Predicate::Cmp {
        field: Field::Name,
        op: Op::Eq,
        value: Some(value.to_string()),
    }
}

fn default_mapping() -> ExportMapping {
    ExportMapping {
        entries: vec![
            FieldMap {
                source: Source::Name,
                target: "Name".into(),
            },
            FieldMap {
                source: Source::Sku,
                target: "MerchantProductNo".into(),
            },
        ],
    }
}

async fn setup_account(pool: &sqlx::SqlitePool, domain: Predicate) -> Account {
    let spec = AccountSpec {
        name: "Test Backend".into(),
        host: "https://ce.example/api/".into(),
        api_key: "key".into(),
        domain,
        mapping: default_mapping(),
    };
    db::upsert_account(pool, &spec).await.unwrap();
    db::list_accounts(pool).await.unwrap().remove(0)
}

fn product(name: &str) -> db::NewProduct {
    db::NewProduct {
        name: name.into(),
        sku: Some(format!("{name}-sku")),
        active: true,
        ..Default::default()
    }
}

fn ok_bulk() -> BulkResponse {
    BulkResponse {
        success: true,
        content: Some(BulkContent::default()),
    }
}

fn ok_delete() -> DeleteResponse {
    DeleteResponse {
        success: true,
        message: None,
    }
}

#[derive(Clone, Default)]
struct RecordingChannel {
    bulk_responses: Arc<Mutex<VecDeque<Result<BulkResponse, RemoteError>>>>,
    delete_responses: Arc<Mutex<VecDeque<Result<DeleteResponse, RemoteError>>>>,
    bulk_calls: Arc<Mutex<Vec<Vec<Value>>>>,
    delete_calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingChannel {
    fn with_bulk_responses(responses: Vec<Result<BulkResponse, RemoteError>>) -> Self {
        Self {
            bulk_responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn with_delete_responses(responses: Vec<Result<DeleteResponse, RemoteError>>) -> Self {
        Self {
            delete_responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn bulk_calls(&self) -> Vec<Vec<Value>> {
        self.bulk_calls.lock().await.clone()
    }

    async fn delete_calls(&self) -> Vec<String> {
        self.delete_calls.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ChannelApi for RecordingChannel {
    async fn create_or_update(
        &self,
        _account: &Account,
        items: &[Value],
    ) -> Result<BulkResponse, RemoteError> {
        self.bulk_calls.lock().await.push(items.to_vec());
        self.bulk_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(ok_bulk()))
    }

    async fn delete(
        &self,
        _account: &Account,
        merchant_product_no: &str,
    ) -> Result<DeleteResponse, RemoteError> {
        self.delete_calls
            .lock()
            .await
            .push(merchant_product_no.to_string());
        self.delete_responses
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Ok(ok_delete()))
    }
}

async fn binding_row(pool: &sqlx::SqlitePool, account_id: i64, product_id: i64) -> (String, String) {
    sqlx::query_as::<_, (String, String)>(
        "SELECT state, outcome FROM bindings WHERE account_id = ? AND product_id = ?",
    )
    .bind(account_id)
    .bind(product_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

#[tokio::test]
async fn in_domain_product_gets_binding_and_goes_todo() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, name_eq("product")).await;

    let in_dom = db::insert_product(&pool, &product("product")).await.unwrap();
    let out_dom = db::insert_product(&pool, &product("notproduct")).await.unwrap();

    let products = db::products_needing_check(&pool, 100).await.unwrap();
    assert_eq!(products.len(), 2);
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();

    // Processed products have their flag acknowledged.
    assert!(db::products_needing_check(&pool, 100).await.unwrap().is_empty());

    assert!(db::get_binding_brief(&pool, account.id, out_dom)
        .await
        .unwrap()
        .is_none());
    let (state, outcome) = binding_row(&pool, account.id, in_dom).await;
    assert_eq!((state.as_str(), outcome.as_str()), ("new", "ok"));

    // First render stores the snapshot and queues the export.
    let stale = db::recheck_queue(&pool, account.id, 100).await.unwrap();
    let changed = scheduler::recompute(&pool, &account, &stale).await.unwrap();
    assert_eq!(changed, 1);
    let (state, _) = binding_row(&pool, account.id, in_dom).await;
    assert_eq!(state, "todo");
}

#[tokio::test]
async fn recompute_is_idempotent() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;
    let pid = db::insert_product(&pool, &product("stable")).await.unwrap();

    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();

    let stale = db::recheck_queue(&pool, account.id, 100).await.unwrap();
    assert_eq!(scheduler::recompute(&pool, &account, &stale).await.unwrap(), 1);

    let before: (String, String, Option<String>) = sqlx::query_as(
        "SELECT state, outcome, data FROM bindings WHERE product_id = ?",
    )
    .bind(pid)
    .fetch_one(&pool)
    .await
    .unwrap();

    // Re-flag without touching the product: the second run must change
    // nothing but the flag.
    let all = db::all_bindings_for_account(&pool, account.id).await.unwrap();
    db::flag_binding_recheck(&pool, all[0].id).await.unwrap();
    let stale = db::recheck_queue(&pool, account.id, 100).await.unwrap();
    assert_eq!(scheduler::recompute(&pool, &account, &stale).await.unwrap(), 0);

    let after: (String, String, Option<String>) = sqlx::query_as(
        "SELECT state, outcome, data FROM bindings WHERE product_id = ?",
    )
    .bind(pid)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(before, after);
    assert!(db::recheck_queue(&pool, account.id, 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn archived_product_moves_binding_to_removal() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;
    let pid = db::insert_product(&pool, &product("archived-soon")).await.unwrap();

    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();

    // Archiving is implicitly out-of-domain, whatever the predicate says.
    db::set_product_active(&pool, pid, false).await.unwrap();
    let products = db::products_needing_check(&pool, 100).await.unwrap();
    assert_eq!(products.len(), 1);
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();

    let (state, outcome) = binding_row(&pool, account.id, pid).await;
    assert_eq!((state.as_str(), outcome.as_str()), ("toremove", "ok"));
}

#[tokio::test]
async fn membership_change_cancels_pending_removal() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;
    let pid = db::insert_product(&pool, &product("flip-flop")).await.unwrap();

    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();

    db::set_product_active(&pool, pid, false).await.unwrap();
    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();
    let (state, _) = binding_row(&pool, account.id, pid).await;
    assert_eq!(state, "toremove");

    db::set_product_active(&pool, pid, true).await.unwrap();
    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();
    let (state, _) = binding_row(&pool, account.id, pid).await;
    assert_eq!(state, "todo");
}

#[tokio::test]
async fn per_item_error_is_folded_back_by_name() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;
    let bad = db::insert_product(&pool, &product("X")).await.unwrap();
    let good = db::insert_product(&pool, &product("Y")).await.unwrap();

    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();
    let stale = db::recheck_queue(&pool, account.id, 100).await.unwrap();
    scheduler::recompute(&pool, &account, &stale).await.unwrap();

    let channel = RecordingChannel::with_bulk_responses(vec![Ok(BulkResponse {
        success: true,
        content: Some(BulkContent {
            accepted_count: 1,
            rejected_count: 1,
            product_messages: vec![ProductMessage {
                name: Some("X".into()),
                warnings: vec![],
                errors: vec!["EAN is missing".into()],
            }],
        }),
    })]);

    let pending = db::export_queue(&pool, account.id, 100).await.unwrap();
    let partition = sync::export(&pool, &channel, &account, pending).await.unwrap();
    assert_eq!(partition.done.len(), 1);
    assert_eq!(partition.exception.len(), 1);

    let (state, outcome) = binding_row(&pool, account.id, bad).await;
    assert_eq!((state.as_str(), outcome.as_str()), ("todo", "error"));
    let (state, outcome) = binding_row(&pool, account.id, good).await;
    assert_eq!((state.as_str(), outcome.as_str()), ("done", "ok"));

    let message: Option<String> =
        sqlx::query_scalar("SELECT message FROM bindings WHERE product_id = ?")
            .bind(bad)
            .fetch_one(&pool)
            .await
            .unwrap();
    let message = message.unwrap();
    assert!(message.starts_with("Date: "));
    assert!(message.contains("EAN is missing"));

    // The errored binding stays out of the queue until the operator
    // acknowledges, then becomes eligible again.
    assert!(db::export_queue(&pool, account.id, 100).await.unwrap().is_empty());
    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM bindings WHERE product_id = ?")
        .bind(bad)
        .fetch_all(&pool)
        .await
        .unwrap();
    db::acknowledge_error(&pool, ids[0]).await.unwrap();
    assert_eq!(db::export_queue(&pool, account.id, 100).await.unwrap().len(), 1);
}

#[tokio::test]
async fn transient_failure_aborts_without_recording_outcomes() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;
    let pid = db::insert_product(&pool, &product("unlucky")).await.unwrap();

    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();
    let stale = db::recheck_queue(&pool, account.id, 100).await.unwrap();
    scheduler::recompute(&pool, &account, &stale).await.unwrap();

    let channel = RecordingChannel::with_bulk_responses(vec![Err(RemoteError::Transient(
        "status 502: bad gateway".into(),
    ))]);
    let pending = db::export_queue(&pool, account.id, 100).await.unwrap();
    let err = sync::export(&pool, &channel, &account, pending).await.unwrap_err();
    assert!(err.to_string().contains("retried"));

    let (state, outcome) = binding_row(&pool, account.id, pid).await;
    assert_eq!((state.as_str(), outcome.as_str()), ("todo", "ok"));
}

#[tokio::test]
async fn structured_rejection_parks_batch_as_exception() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;
    let pid = db::insert_product(&pool, &product("rejected")).await.unwrap();

    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();
    let stale = db::recheck_queue(&pool, account.id, 100).await.unwrap();
    scheduler::recompute(&pool, &account, &stale).await.unwrap();

    let channel = RecordingChannel::with_bulk_responses(vec![Err(RemoteError::Api {
        status: 400,
        body: "bad payload".into(),
    })]);
    let pending = db::export_queue(&pool, account.id, 100).await.unwrap();
    let partition = sync::export(&pool, &channel, &account, pending).await.unwrap();
    assert_eq!(partition.exception.len(), 1);

    let (state, outcome) = binding_row(&pool, account.id, pid).await;
    // State is untouched so the binding retries once the error is cleared.
    assert_eq!((state.as_str(), outcome.as_str()), ("todo", "error"));
}

#[tokio::test]
async fn delete_is_idempotent_for_missing_and_unknown_keys() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;

    // Exported under a key the platform no longer knows.
    let known = db::insert_product(&pool, &product("known")).await.unwrap();
    let known_b = db::create_binding(&pool, account.id, known).await.unwrap();
    db::store_binding_data(
        &pool,
        known_b,
        &json!({"Name": "known", "MerchantProductNo": "known-sku"}),
    )
    .await
    .unwrap();
    db::mark_binding_toremove(&pool, known_b).await.unwrap();

    // Never exported: no external key at all.
    let keyless = db::insert_product(&pool, &product("keyless")).await.unwrap();
    let keyless_b = db::create_binding(&pool, account.id, keyless).await.unwrap();
    db::store_binding_data(&pool, keyless_b, &json!({"Name": "keyless"}))
        .await
        .unwrap();
    db::mark_binding_toremove(&pool, keyless_b).await.unwrap();

    let channel = RecordingChannel::with_delete_responses(vec![Err(RemoteError::Api {
        status: 404,
        body: "The product could not be found.".into(),
    })]);

    let removals = db::removal_queue(&pool, account.id, 100).await.unwrap();
    assert_eq!(removals.len(), 2);
    let partition = sync::delete(&pool, &channel, &account, removals).await.unwrap();
    assert_eq!(partition.done.len(), 2);
    assert!(partition.exception.is_empty());

    // Only the keyed binding produced a remote call; both rows are gone.
    assert_eq!(channel.delete_calls().await, vec!["known-sku".to_string()]);
    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bindings")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn failed_delete_records_error_and_keeps_binding() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;
    let pid = db::insert_product(&pool, &product("stuck")).await.unwrap();
    let bid = db::create_binding(&pool, account.id, pid).await.unwrap();
    db::store_binding_data(
        &pool,
        bid,
        &json!({"Name": "stuck", "MerchantProductNo": "stuck-sku"}),
    )
    .await
    .unwrap();
    db::mark_binding_toremove(&pool, bid).await.unwrap();

    let channel = RecordingChannel::with_delete_responses(vec![Ok(DeleteResponse {
        success: false,
        message: Some("product is locked".into()),
    })]);
    let removals = db::removal_queue(&pool, account.id, 100).await.unwrap();
    let partition = sync::delete(&pool, &channel, &account, removals).await.unwrap();
    assert_eq!(partition.exception.len(), 1);

    let (state, outcome) = binding_row(&pool, account.id, pid).await;
    assert_eq!((state.as_str(), outcome.as_str()), ("toremove", "error"));
    let message: Option<String> =
        sqlx::query_scalar("SELECT message FROM bindings WHERE id = ?")
            .bind(bid)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(message.as_deref(), Some("product is locked"));

    // Errored removals wait for the operator before being retried.
    assert!(db::removal_queue(&pool, account.id, 100).await.unwrap().is_empty());
}

#[tokio::test]
async fn orphaned_parent_is_removed_with_last_sibling() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;

    let mut red = product("red");
    red.family_key = Some("P1".into());
    red.family_display_name = Some("Shoe family".into());
    let mut blue = product("blue");
    blue.family_key = Some("P1".into());
    blue.family_display_name = Some("Shoe family".into());

    let red_id = db::insert_product(&pool, &red).await.unwrap();
    let blue_id = db::insert_product(&pool, &blue).await.unwrap();
    let red_b = db::create_binding(&pool, account.id, red_id).await.unwrap();
    let blue_b = db::create_binding(&pool, account.id, blue_id).await.unwrap();
    db::store_binding_data(
        &pool,
        red_b,
        &json!({"Name": "red", "MerchantProductNo": "red-sku", "ParentMerchantProductNo": "P1"}),
    )
    .await
    .unwrap();
    db::store_binding_data(
        &pool,
        blue_b,
        &json!({"Name": "blue", "MerchantProductNo": "blue-sku", "ParentMerchantProductNo": "P1"}),
    )
    .await
    .unwrap();

    // First sibling leaves: the parent still has a bound variant.
    db::mark_binding_toremove(&pool, red_b).await.unwrap();
    let channel = RecordingChannel::default();
    let removals = db::removal_queue(&pool, account.id, 100).await.unwrap();
    sync::delete(&pool, &channel, &account, removals).await.unwrap();
    assert_eq!(channel.delete_calls().await, vec!["red-sku".to_string()]);

    // Last sibling leaves: the synthesized parent entry is now orphaned.
    db::mark_binding_toremove(&pool, blue_b).await.unwrap();
    let channel = RecordingChannel::default();
    let removals = db::removal_queue(&pool, account.id, 100).await.unwrap();
    sync::delete(&pool, &channel, &account, removals).await.unwrap();
    assert_eq!(
        channel.delete_calls().await,
        vec!["blue-sku".to_string(), "P1".to_string()]
    );
}

#[tokio::test]
async fn export_payload_carries_parent_entries_first() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;

    let mut red = product("red");
    red.family_key = Some("P1".into());
    red.family_display_name = Some("Shoe family".into());
    let mut blue = product("blue");
    blue.family_key = Some("P1".into());
    blue.family_display_name = Some("Shoe family".into());
    db::insert_product(&pool, &red).await.unwrap();
    db::insert_product(&pool, &blue).await.unwrap();

    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();
    let stale = db::recheck_queue(&pool, account.id, 100).await.unwrap();
    scheduler::recompute(&pool, &account, &stale).await.unwrap();

    let channel = RecordingChannel::default();
    let pending = db::export_queue(&pool, account.id, 100).await.unwrap();
    sync::export(&pool, &channel, &account, pending).await.unwrap();

    let calls = channel.bulk_calls().await;
    assert_eq!(calls.len(), 1);
    let payload = &calls[0];
    // One synthesized parent + two variants.
    assert_eq!(payload.len(), 3);
    assert_eq!(payload[0]["MerchantProductNo"], "P1");
    assert_eq!(payload[0]["Name"], "Shoe family");
    assert!(payload[1]["ParentMerchantProductNo"] == "P1");
}

#[tokio::test]
async fn mapping_edit_flags_bindings_and_rerenders() {
    let pool = setup_pool().await;
    let account = setup_account(&pool, Predicate::everything()).await;
    let pid = db::insert_product(
        &pool,
        &db::NewProduct {
            category: Some("All/Shoes".into()),
            ..product("mapped")
        },
    )
    .await
    .unwrap();

    let products = db::products_needing_check(&pool, 100).await.unwrap();
    membership::evaluate_all(&pool, &[account.clone()], &products)
        .await
        .unwrap();
    let stale = db::recheck_queue(&pool, account.id, 100).await.unwrap();
    scheduler::recompute(&pool, &account, &stale).await.unwrap();
    assert!(db::recheck_queue(&pool, account.id, 100).await.unwrap().is_empty());

    // Adding a mapped field changes the fingerprint, which flags the
    // binding; the next render picks up the new key.
    let mut spec = AccountSpec {
        name: account.name.clone(),
        host: account.host.clone(),
        api_key: account.api_key.clone(),
        domain: account.domain.clone(),
        mapping: account.mapping.clone(),
    };
    spec.mapping.entries.push(FieldMap {
        source: Source::CategoryTrail,
        target: "CategoryTrail".into(),
    });
    scheduler::apply_roster(&pool, &[spec]).await.unwrap();

    let account = db::list_accounts(&pool).await.unwrap().remove(0);
    let stale = db::recheck_queue(&pool, account.id, 100).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(scheduler::recompute(&pool, &account, &stale).await.unwrap(), 1);

    let data: Option<String> = sqlx::query_scalar("SELECT data FROM bindings WHERE product_id = ?")
        .bind(pid)
        .fetch_one(&pool)
        .await
        .unwrap();
    let data: Value = serde_json::from_str(&data.unwrap()).unwrap();
    assert_eq!(data["CategoryTrail"], "All>Shoes");
}

#[tokio::test]
async fn full_pass_exports_then_removes() {
    let pool = setup_pool().await;
    setup_account(&pool, Predicate::everything()).await;
    let pid = db::insert_product(&pool, &product("lifecycle")).await.unwrap();
    let account = db::list_accounts(&pool).await.unwrap().remove(0);

    let channel = RecordingChannel::default();
    let summary = scheduler::run_pass(&pool, &channel, 500).await.unwrap();
    assert_eq!(summary.products_checked, 1);
    assert_eq!(summary.rerendered, 1);
    assert_eq!(summary.exported, 1);
    let (state, outcome) = binding_row(&pool, account.id, pid).await;
    assert_eq!((state.as_str(), outcome.as_str()), ("done", "ok"));

    db::set_product_active(&pool, pid, false).await.unwrap();
    let summary = scheduler::run_pass(&pool, &channel, 500).await.unwrap();
    assert_eq!(summary.removed, 1);
    assert_eq!(channel.delete_calls().await, vec!["lifecycle-sku".to_string()]);
    assert!(db::get_binding_brief(&pool, account.id, pid).await.unwrap().is_none());

    // A pass over a quiet catalog does nothing.
    let summary = scheduler::run_pass(&pool, &channel, 500).await.unwrap();
    assert_eq!(summary.products_checked, 0);
    assert_eq!(summary.exported, 0);
    assert_eq!(summary.removed, 0);
}
