//! Integration tests for plansync
//!
//! Tests full mutation flows from the service through the queue consumer to
//! the primary store and search index.

use plansync::document::{reconstruct, reconstruct_from_index};
use plansync::index::SearchQuery;
use plansync::queue::{ConsumerState, MessageQueue, QueueError};
use plansync::validation::MAX_IDENTIFIER_LENGTH;
use plansync::{Conditional, Config, Error, Plansync};
use plandoc::{Body, QueueMessage};
use serde_json::{json, Value};
use tempfile::TempDir;

/// Helper to open a file-backed instance in a temp dir
async fn setup_test_db() -> (TempDir, Plansync) {
    let tmp = TempDir::new().expect("Failed to create temp dir");
    let db = open_at(&tmp).await;
    (tmp, db)
}

async fn open_at(tmp: &TempDir) -> Plansync {
    let mut config = Config::default();
    config.data_dir = tmp.path().to_path_buf();
    Plansync::open(config).await.expect("Failed to open plansync")
}

fn plan() -> Value {
    json!({
        "_org": "example.com",
        "objectId": "p1",
        "objectType": "plan",
        "planType": "inNetwork",
        "creationDate": "12-12-2017",
        "planCostShares": {
            "_org": "example.com",
            "objectId": "cs1",
            "objectType": "membercostshare",
            "deductible": 2000,
            "copay": 23
        },
        "linkedPlanServices": [{
            "_org": "example.com",
            "objectId": "ls1",
            "objectType": "planservice",
            "linkedService": {
                "_org": "example.com",
                "objectId": "s1",
                "objectType": "service",
                "name": "Yearly physical"
            },
            "planserviceCostShares": {
                "_org": "example.com",
                "objectId": "cs2",
                "objectType": "membercostshare",
                "deductible": 10,
                "copay": 0
            }
        }]
    })
}

/// Helper to create p1 and apply it
async fn create_p1(db: &Plansync) {
    db.service().create_plan(plan()).await.expect("create failed");
    let stats = db.drain().await.expect("drain failed");
    assert_eq!(stats.processed, 1);
}

/// Record keys in the primary store, ETag keys excluded
async fn record_keys(db: &Plansync) -> Vec<String> {
    let mut keys: Vec<String> = db
        .store()
        .scan("*")
        .await
        .unwrap()
        .into_iter()
        .filter(|k| !k.starts_with("etag"))
        .collect();
    keys.sort();
    keys
}

async fn fresh(db: &Plansync, id: &str, if_none_match: Option<&str>) -> (Body, String) {
    match db.service().get_plan(id, if_none_match).await.unwrap() {
        Conditional::Fresh { body, etag } => (body, etag),
        Conditional::NotModified => panic!("expected a fresh body for {}", id),
    }
}

// =============================================================================
// Create Tests
// =============================================================================

#[tokio::test]
async fn test_create_decomposes_p1() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;

    assert_eq!(
        record_keys(&db).await,
        vec![
            "membercostshare:cs1",
            "membercostshare:cs2",
            "p1",
            "planservice:ls1",
            "service:s1"
        ]
    );

    let docs = db.index().search(&SearchQuery::MatchAll).await.unwrap();
    assert_eq!(docs.len(), 5);
    assert!(docs.iter().all(|d| d.routing == "p1"));

    let ids = |bodies: Vec<Body>| -> Vec<String> {
        let mut ids: Vec<String> = bodies
            .iter()
            .map(|b| b["objectId"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        ids
    };
    assert_eq!(ids(db.service().children("p1").await.unwrap()), vec!["cs1", "ls1"]);
    assert_eq!(ids(db.service().children("ls1").await.unwrap()), vec!["cs2", "s1"]);
    assert!(db.service().children("s1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_create_roundtrip() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;

    let (body, _) = fresh(&db, "p1", None).await;
    assert_eq!(Value::Object(body), plan());

    let from_index = reconstruct_from_index(db.index().as_ref(), "p1").await.unwrap();
    assert_eq!(Value::Object(from_index), plan());
}

#[tokio::test]
async fn test_create_is_idempotent_on_the_queue() {
    let (_tmp, db) = setup_test_db().await;
    let message = QueueMessage::create(plan().as_object().cloned().unwrap());
    db.queue().publish(message.to_bytes().unwrap()).await.unwrap();
    db.queue().publish(message.to_bytes().unwrap()).await.unwrap();

    let stats = db.drain().await.unwrap();
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.failed, 0);
    assert_eq!(record_keys(&db).await.len(), 5);
    assert_eq!(db.index().search(&SearchQuery::MatchAll).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_create_rejects_invalid_plans() {
    let (_tmp, db) = setup_test_db().await;

    let mut missing = plan();
    missing.as_object_mut().unwrap().remove("planCostShares");
    let err = db.service().create_plan(missing).await.unwrap_err();
    assert_eq!(err.status(), 400);

    let mut duplicate = plan();
    duplicate["linkedPlanServices"][0]["linkedService"]["objectId"] = json!("cs1");
    assert!(matches!(
        db.service().create_plan(duplicate).await,
        Err(Error::DuplicateObjectId { .. })
    ));

    let mut bad_id = plan();
    bad_id["objectId"] = json!("etag:p1");
    assert_eq!(db.service().create_plan(bad_id).await.unwrap_err().status(), 400);

    assert_eq!(db.queue().unacked(), 0);
    assert!(db.drain().await.unwrap().processed == 0);
}

// =============================================================================
// Patch Tests
// =============================================================================

#[tokio::test]
async fn test_patch_deductible() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;

    let accepted = db
        .service()
        .patch_plan("p1", json!({"planCostShares": {"deductible": 500}}), None)
        .await
        .unwrap();
    assert_eq!(accepted.status(), 202);
    db.drain().await.unwrap();

    let (body, _) = fresh(&db, "p1", None).await;
    assert_eq!(body["planCostShares"]["deductible"], json!(500));
    assert_eq!(body["planCostShares"]["copay"], json!(23));
    assert_eq!(body["linkedPlanServices"], plan()["linkedPlanServices"]);

    let doc = db.index().get("cs1").await.unwrap().unwrap();
    assert_eq!(doc.source["deductible"], json!(500));
}

#[tokio::test]
async fn test_patch_appends_service() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;

    let patch = json!({
        "linkedPlanServices": [{
            "objectId": "ls2",
            "objectType": "planservice",
            "linkedService": {"objectId": "s2", "objectType": "service", "name": "Well baby"},
            "planserviceCostShares": {"objectId": "cs3", "objectType": "membercostshare", "copay": 175}
        }]
    });
    db.service().patch_plan("p1", patch, None).await.unwrap();
    db.drain().await.unwrap();

    let (body, _) = fresh(&db, "p1", None).await;
    let services = body["linkedPlanServices"].as_array().unwrap();
    assert_eq!(services.len(), 2);
    assert_eq!(services[1]["linkedService"]["name"], json!("Well baby"));
    assert_eq!(record_keys(&db).await.len(), 8);
}

#[tokio::test]
async fn test_patch_with_if_match() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;
    let (_, etag) = fresh(&db, "p1", None).await;

    let err = db
        .service()
        .patch_plan("p1", json!({"planCostShares": {"copay": 1}}), Some("\"nope\""))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed { .. }));
    assert_eq!(db.queue().unacked(), 0);
    assert_eq!(db.drain().await.unwrap().processed, 0);

    let header = format!("W/\"{}\"", etag);
    db.service()
        .patch_plan("p1", json!({"planCostShares": {"copay": 1}}), Some(header.as_str()))
        .await
        .unwrap();
    db.drain().await.unwrap();

    let err = db
        .service()
        .patch_plan("p1", json!({"planCostShares": {"copay": 2}}), Some(header.as_str()))
        .await
        .unwrap_err();
    assert_eq!(err.status(), 412);
}

// =============================================================================
// ETag Tests
// =============================================================================

#[tokio::test]
async fn test_conditional_get() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;

    let (_, etag) = fresh(&db, "p1", None).await;
    let quoted = format!("\"{}\"", etag);
    assert_eq!(
        db.service().get_plan("p1", Some(quoted.as_str())).await.unwrap(),
        Conditional::NotModified
    );
    assert_eq!(
        db.service().get_plan("p1", Some("*")).await.unwrap(),
        Conditional::NotModified
    );
}

#[tokio::test]
async fn test_if_none_match_skips_reconstruction() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;
    let (_, etag) = fresh(&db, "p1", None).await;

    // With a record gone the plan can no longer be assembled
    db.store().delete(&["service:s1".to_string()]).await.unwrap();
    let err = db.service().get_plan("p1", None).await.unwrap_err();
    assert!(matches!(err, Error::DanglingReference { .. }));

    let quoted = format!("\"{}\"", etag);
    assert_eq!(
        db.service().get_plan("p1", Some(quoted.as_str())).await.unwrap(),
        Conditional::NotModified
    );
}

#[tokio::test]
async fn test_update_invalidates_etags() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;
    let (_, old) = fresh(&db, "p1", None).await;

    db.service()
        .patch_plan("p1", json!({"planCostShares": {"deductible": 500}}), None)
        .await
        .unwrap();
    db.drain().await.unwrap();

    let (body, new) = fresh(&db, "p1", Some(old.as_str())).await;
    assert_ne!(old, new);
    assert_eq!(body["planCostShares"]["deductible"], json!(500));
}

#[tokio::test]
async fn test_list_invalidated_by_mutation() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;

    let Conditional::Fresh { body, etag } = db.service().list_plans(None).await.unwrap() else {
        panic!("expected plans");
    };
    assert_eq!(body.len(), 1);

    let mut second = plan();
    second["objectId"] = json!("p2");
    second["planCostShares"]["objectId"] = json!("cs10");
    second["linkedPlanServices"] = json!([]);
    db.service().create_plan(second).await.unwrap();
    db.drain().await.unwrap();

    let listed = db.service().list_plans(Some(etag.as_str())).await.unwrap();
    assert_eq!(listed.into_body().unwrap().len(), 2);
}

#[tokio::test]
async fn test_longest_identifiers_stored_on_disk() {
    let (_tmp, db) = setup_test_db().await;
    let long_id = "c".repeat(MAX_IDENTIFIER_LENGTH);
    let mut body = plan();
    body["objectId"] = json!("p".repeat(MAX_IDENTIFIER_LENGTH));
    body["planCostShares"]["objectId"] = json!(long_id);

    let accepted = db.service().create_plan(body.clone()).await.unwrap();
    let stats = db.drain().await.unwrap();
    assert_eq!((stats.processed, stats.failed), (1, 0));
    let (stored, _) = fresh(&db, &accepted.plan_id, None).await;
    assert_eq!(Value::Object(stored), body);

    let mut too_long = plan();
    too_long["objectId"] = json!("p2");
    too_long["planCostShares"]["objectId"] = json!(format!("{}c", long_id));
    let err = db.service().create_plan(too_long).await.unwrap_err();
    assert_eq!(err.status(), 400);
}

// =============================================================================
// Delete Tests
// =============================================================================

#[tokio::test]
async fn test_delete_leaves_nothing() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;
    fresh(&db, "p1", None).await;

    let accepted = db.service().delete_plan("p1").await.unwrap();
    assert_eq!(accepted.status(), 202);
    db.drain().await.unwrap();

    assert!(db.store().scan("*").await.unwrap().is_empty());
    assert!(db.index().search(&SearchQuery::MatchAll).await.unwrap().is_empty());
    assert!(matches!(
        db.service().get_plan("p1", None).await,
        Err(Error::PlanNotFound { .. })
    ));
    assert_eq!(db.service().delete_plan("p1").await.unwrap_err().status(), 404);
}

// =============================================================================
// Search and Persistence Tests
// =============================================================================

#[tokio::test]
async fn test_search_returns_owning_plan() {
    let (_tmp, db) = setup_test_db().await;
    create_p1(&db).await;

    let plans = db
        .service()
        .search(&SearchQuery::Text("physical".into()))
        .await
        .unwrap();
    assert_eq!(plans.len(), 1);
    assert_eq!(Value::Object(plans[0].clone()), plan());

    let plans = db
        .service()
        .search(&SearchQuery::Term {
            field: "objectType".into(),
            value: json!("membercostshare"),
        })
        .await
        .unwrap();
    assert_eq!(plans.len(), 1);
}

#[tokio::test]
async fn test_reopen_keeps_plans() {
    let tmp = TempDir::new().unwrap();
    {
        let db = open_at(&tmp).await;
        create_p1(&db).await;
    }

    let db = open_at(&tmp).await;
    let body = reconstruct(db.store().as_ref(), "p1").await.unwrap();
    assert_eq!(Value::Object(body), plan());
    assert_eq!(db.index().search(&SearchQuery::MatchAll).await.unwrap().len(), 5);
}

#[tokio::test]
async fn test_configured_tokens_guard_the_instance() {
    let mut config = Config::default();
    config.auth_tokens = vec!["s3cret".to_string()];
    let db = Plansync::in_memory(config).unwrap();

    assert!(db.auth().authenticate(None).await.is_err());
    let rejected = db.auth().authenticate(Some("Bearer wrong")).await.unwrap_err();
    assert_eq!(rejected.status(), 401);
    assert!(db.auth().authenticate(Some("Bearer s3cret")).await.is_ok());
}

// =============================================================================
// Consumer Tests
// =============================================================================

#[tokio::test]
async fn test_background_consumer() {
    let db = Plansync::in_memory(Config::default()).unwrap();
    let mut handle = db.start_consumer().unwrap();
    handle.wait_for(ConsumerState::Consuming).await.unwrap();

    db.service().create_plan(plan()).await.unwrap();
    db.queue().publish(b"{\"action\": \"update\", \"data\": {}}".to_vec()).await.unwrap();
    while handle.stats().acked < 2 {
        tokio::task::yield_now().await;
    }

    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.failed, 1);
    assert!(db.store().exists("p1").await.unwrap());
}

#[tokio::test]
async fn test_started_consumer_owns_the_queue() {
    let db = Plansync::in_memory(Config::default()).unwrap();
    let mut handle = db.start_consumer().unwrap();
    handle.wait_for(ConsumerState::Consuming).await.unwrap();

    assert!(matches!(db.start_consumer(), Err(QueueError::ConsumerActive(_))));
    assert!(matches!(
        db.drain().await,
        Err(Error::Queue(QueueError::ConsumerActive(_)))
    ));

    handle.stop().await.unwrap();
    db.service().create_plan(plan()).await.unwrap();
    assert_eq!(db.drain().await.unwrap().processed, 1);
}
