// Transaction manager integration tests.

mod common;

use common::{mock_client, MockFailure};
use serde_json::json;

use rusty_erp::cache::{CacheKey, StrategyKind};
use rusty_erp::transaction::TransactionState;
use rusty_erp::ClientError;

fn object(pairs: &[(&str, serde_json::Value)]) -> serde_json::Map<String, serde_json::Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn test_commit_invalidates_exactly_the_dirty_regions() {
    let (client, transport) = mock_client();
    let cache = client.setup_memory_cache(1000, None, StrategyKind::Ttl);
    client.setup_transaction_manager();

    // Seed entries that the commit must remove, plus a survivor.
    for key in [
        "res.partner:5",
        "res.partner:7",
        "res.partner:9",
        "query:res.partner:abcd1234",
        "res.users:1",
    ] {
        cache
            .set(&CacheKey::new(key).unwrap(), json!("cached"), None, None)
            .await;
    }

    transport.seed_record("res.partner", 5, json!({"name": "Old"}));
    transport.push_response("res.partner", "create", json!(101));

    client
        .transaction(|_tx| {
            let client = client.clone();
            async move {
                client
                    .create("res.partner", object(&[("name", json!("A"))]))
                    .await?;
                client
                    .write("res.partner", &[5], object(&[("name", json!("B"))]))
                    .await?;
                client.unlink("res.partner", &[7]).await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    // Exact per-record keys, the model-wide pattern, the query-result
    // pattern, and the model itself were all invalidated.
    for key in [
        "res.partner:101",
        "res.partner:5",
        "res.partner:7",
        "res.partner:9",
        "query:res.partner:abcd1234",
    ] {
        assert_eq!(
            cache.get(&CacheKey::new(key).unwrap(), None).await,
            None,
            "expected {} to be invalidated",
            key
        );
    }
    assert_eq!(
        cache.get(&CacheKey::new("res.users:1").unwrap(), None).await,
        Some(json!("cached"))
    );
}

#[tokio::test]
async fn test_no_cache_calls_while_transaction_is_open() {
    let (client, transport) = mock_client();
    let cache = client.setup_memory_cache(1000, None, StrategyKind::Ttl);
    client.setup_transaction_manager();

    cache
        .set(
            &CacheKey::new("res.partner:5").unwrap(),
            json!("cached"),
            None,
            None,
        )
        .await;
    transport.seed_record("res.partner", 5, json!({"name": "Old"}));

    let cache_probe = cache.clone();
    client
        .transaction(|_tx| {
            let client = client.clone();
            let cache = cache_probe.clone();
            async move {
                client
                    .write("res.partner", &[5], object(&[("name", json!("New"))]))
                    .await?;
                // Invalidation is deferred to commit.
                assert_eq!(
                    cache
                        .get(&CacheKey::new("res.partner:5").unwrap(), None)
                        .await,
                    Some(json!("cached"))
                );
                Ok(())
            }
        })
        .await
        .unwrap();

    assert_eq!(
        cache.get(&CacheKey::new("res.partner:5").unwrap(), None).await,
        None
    );
}

#[tokio::test]
async fn test_rollback_restores_pre_image() {
    let (client, transport) = mock_client();
    client.setup_transaction_manager();
    transport.seed_record("res.partner", 5, json!({"name": "Y"}));

    let manager = client.transaction_manager().unwrap();
    let handle = manager.begin().unwrap();

    client
        .write("res.partner", &[5], object(&[("name", json!("X"))]))
        .await
        .unwrap();

    let summary = manager.rollback(&handle).await;
    assert!(summary.failures.is_empty());
    assert_eq!(summary.compensated, 1);
    assert_eq!(handle.state(), TransactionState::RolledBack);

    // The compensating call restored the original name.
    let writes = transport.calls_for("res.partner", "write");
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[0].args, vec![json!([5]), json!({"name": "X"})]);
    assert_eq!(writes[1].args, vec![json!([5]), json!({"name": "Y"})]);
}

#[tokio::test]
async fn test_scope_rolls_back_on_error() {
    let (client, transport) = mock_client();
    client.setup_transaction_manager();
    transport.seed_record("res.partner", 5, json!({"name": "Y"}));

    let result: Result<(), ClientError> = client
        .transaction(|_tx| {
            let client = client.clone();
            async move {
                client
                    .write("res.partner", &[5], object(&[("name", json!("X"))]))
                    .await?;
                Err(ClientError::Validation("constraint violated".to_string()))
            }
        })
        .await;
    assert!(result.is_err());

    let writes = transport.calls_for("res.partner", "write");
    assert_eq!(writes.len(), 2);
    assert_eq!(writes[1].args, vec![json!([5]), json!({"name": "Y"})]);
}

#[tokio::test]
async fn test_compensation_order_is_reverse_of_log() {
    let (client, transport) = mock_client();
    client.setup_transaction_manager();
    transport.seed_record("res.partner", 5, json!({"name": "first"}));
    transport.seed_record("res.partner", 6, json!({"name": "second"}));
    transport.push_response("res.partner", "create", json!(200));

    let manager = client.transaction_manager().unwrap();
    let handle = manager.begin().unwrap();

    client
        .create("res.partner", object(&[("name", json!("new"))]))
        .await
        .unwrap();
    client
        .write("res.partner", &[5], object(&[("name", json!("a"))]))
        .await
        .unwrap();
    client
        .write("res.partner", &[6], object(&[("name", json!("b"))]))
        .await
        .unwrap();

    manager.rollback(&handle).await;

    // Reverse order: restore 6, restore 5, then unlink the create.
    let calls = transport.calls();
    let tail: Vec<(&str, &str)> = calls
        .iter()
        .rev()
        .take(3)
        .map(|c| (c.method.as_str(), c.model.as_str()))
        .collect();
    assert_eq!(
        tail,
        vec![
            ("unlink", "res.partner"),
            ("write", "res.partner"),
            ("write", "res.partner"),
        ]
    );

    let unlink = transport.calls_for("res.partner", "unlink");
    assert_eq!(unlink[0].args[0], json!([200]));
}

#[tokio::test]
async fn test_delete_compensation_recreates_fields() {
    let (client, transport) = mock_client();
    client.setup_transaction_manager();
    transport.seed_record("res.partner", 7, json!({"name": "Gone", "email": "g@x.com"}));

    let manager = client.transaction_manager().unwrap();
    let handle = manager.begin().unwrap();

    client.unlink("res.partner", &[7]).await.unwrap();
    let summary = manager.rollback(&handle).await;
    assert!(summary.failures.is_empty());

    // Re-created with the original field values; the id is not
    // guaranteed to match.
    let creates = transport.calls_for("res.partner", "create");
    assert_eq!(creates.len(), 1);
    assert_eq!(
        creates[0].args[0],
        json!([{"name": "Gone", "email": "g@x.com"}])
    );
}

#[tokio::test]
async fn test_compensation_failure_still_ends_rolled_back() {
    let (client, transport) = mock_client();
    client.setup_transaction_manager();
    transport.seed_record("res.partner", 5, json!({"name": "Y"}));

    let manager = client.transaction_manager().unwrap();
    let handle = manager.begin().unwrap();

    client
        .write("res.partner", &[5], object(&[("name", json!("X"))]))
        .await
        .unwrap();

    // The compensating write will fail.
    transport.push_failure(
        "res.partner",
        "write",
        MockFailure::Server("gone away".to_string()),
    );

    let summary = manager.rollback(&handle).await;
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(handle.state(), TransactionState::RolledBack);
}

#[tokio::test]
async fn test_savepoint_partial_rollback() {
    let (client, transport) = mock_client();
    client.setup_transaction_manager();
    transport.seed_record("res.partner", 1, json!({"name": "one"}));
    transport.seed_record("res.partner", 2, json!({"name": "two"}));

    let manager = client.transaction_manager().unwrap();
    let handle = manager.begin().unwrap();

    client
        .write("res.partner", &[1], object(&[("name", json!("ONE"))]))
        .await
        .unwrap();
    handle.savepoint("sp1").unwrap();
    client
        .write("res.partner", &[2], object(&[("name", json!("TWO"))]))
        .await
        .unwrap();

    let summary = handle.rollback_to_savepoint("sp1").await.unwrap();
    assert_eq!(summary.compensated, 1);
    assert_eq!(handle.operation_count(), 1);

    // Only the post-savepoint write was compensated.
    let writes = transport.calls_for("res.partner", "write");
    let last = writes.last().unwrap();
    assert_eq!(last.args, vec![json!([2]), json!({"name": "two"})]);

    manager.commit(&handle).await.unwrap();
    assert_eq!(handle.state(), TransactionState::Committed);
}

#[tokio::test]
async fn test_savepoint_not_found() {
    let (client, _transport) = mock_client();
    client.setup_transaction_manager();

    let manager = client.transaction_manager().unwrap();
    let handle = manager.begin().unwrap();
    let err = handle.release_savepoint("missing").unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transaction(rusty_erp::TransactionError::SavepointNotFound(_))
    ));
    manager.rollback(&handle).await;
}

#[tokio::test]
async fn test_nested_scope_merges_into_parent() {
    let (client, transport) = mock_client();
    let cache = client.setup_memory_cache(1000, None, StrategyKind::Ttl);
    client.setup_transaction_manager();
    transport.seed_record("res.partner", 1, json!({"name": "outer"}));
    transport.seed_record("res.users", 2, json!({"name": "inner"}));

    cache
        .set(
            &CacheKey::new("res.users:2").unwrap(),
            json!("cached"),
            None,
            None,
        )
        .await;

    client
        .transaction(|_outer| {
            let client = client.clone();
            async move {
                client
                    .write("res.partner", &[1], object(&[("name", json!("A"))]))
                    .await?;
                // Nested scope becomes a savepoint on the parent.
                client
                    .transaction(|_inner| {
                        let client = client.clone();
                        async move {
                            client
                                .write("res.users", &[2], object(&[("name", json!("B"))]))
                                .await?;
                            Ok(())
                        }
                    })
                    .await?;
                Ok(())
            }
        })
        .await
        .unwrap();

    // The inner scope's dirty set was flushed by the outer commit.
    assert_eq!(
        cache.get(&CacheKey::new("res.users:2").unwrap(), None).await,
        None
    );
}

#[tokio::test]
async fn test_double_commit_is_rejected() {
    let (client, _transport) = mock_client();
    client.setup_transaction_manager();

    let manager = client.transaction_manager().unwrap();
    let handle = manager.begin().unwrap();
    manager.commit(&handle).await.unwrap();

    let err = manager.commit(&handle).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transaction(rusty_erp::TransactionError::InvalidState { .. })
    ));
}
