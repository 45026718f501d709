// Query builder integration tests.

mod common;

use common::mock_client;
use serde_json::json;
use std::time::Duration;

use rusty_erp::cache::StrategyKind;
use rusty_erp::{field, ClientError};

fn partner_rows() -> serde_json::Value {
    json!([
        {"id": 1, "name": "ACME Holding", "is_company": true},
        {"id": 2, "name": "Acme Retail", "is_company": true},
    ])
}

#[tokio::test]
async fn test_basic_partner_search_uses_cache_on_second_call() {
    let (client, transport) = mock_client();
    client.setup_memory_cache(1000, None, StrategyKind::Ttl);

    let query = client
        .model("res.partner")
        .filter(field("is_company").eq(true) & field("name").ilike("%acme%"))
        .order_by(&["name"])
        .limit(10);

    // Expected cache key shape: query:res.partner:{8 hex chars}.
    let key = query.cache_key().unwrap();
    let parts: Vec<&str> = key.key.split(':').collect();
    assert_eq!(parts[0], "query");
    assert_eq!(parts[1], "res.partner");
    assert_eq!(parts[2].len(), 8);
    assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));

    transport.push_response("res.partner", "search_read", partner_rows());

    let first = query.all().await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(transport.call_count("res.partner", "search_read"), 1);

    // Second identical query is served from cache: no further RPC.
    let second = query.all().await.unwrap();
    assert_eq!(second.len(), 2);
    assert_eq!(transport.call_count("res.partner", "search_read"), 1);

    // The wire call carried the translated domain and kwargs.
    let call = &transport.calls_for("res.partner", "search_read")[0];
    assert_eq!(
        call.args[0],
        json!([["is_company", "=", true], ["name", "ilike", "%acme%"]])
    );
    assert_eq!(call.kwargs["limit"], json!(10));
    assert_eq!(call.kwargs["order"], json!("name"));
}

#[tokio::test]
async fn test_equal_fingerprints_share_a_cache_entry() {
    let (client, transport) = mock_client();
    client.setup_memory_cache(1000, None, StrategyKind::Ttl);
    transport.push_response("res.partner", "search_read", partner_rows());

    // Built independently but canonically equal.
    let q1 = client
        .model("res.partner")
        .filter(field("is_company").eq(true))
        .limit(5);
    let q2 = client
        .model("res.partner")
        .filter(field("is_company").eq(true))
        .limit(5);
    assert_eq!(q1.cache_key().unwrap().key, q2.cache_key().unwrap().key);

    q1.all().await.unwrap();
    q2.all().await.unwrap();
    assert_eq!(transport.call_count("res.partner", "search_read"), 1);

    // A different limit changes the fingerprint.
    let q3 = client
        .model("res.partner")
        .filter(field("is_company").eq(true))
        .limit(6);
    assert_ne!(q1.cache_key().unwrap().key, q3.cache_key().unwrap().key);
}

#[tokio::test]
async fn test_cache_disabled_query_always_fetches() {
    let (client, transport) = mock_client();
    client.setup_memory_cache(1000, None, StrategyKind::Ttl);
    transport.push_response("res.partner", "search_read", partner_rows());
    transport.push_response("res.partner", "search_read", partner_rows());

    let query = client.model("res.partner").cache(None, false);
    query.all().await.unwrap();
    query.all().await.unwrap();
    assert_eq!(transport.call_count("res.partner", "search_read"), 2);
}

#[tokio::test]
async fn test_order_by_clears_and_descends() {
    let (client, _transport) = mock_client();
    let base = client.model("res.partner");

    let ordered = base.order_by(&["country_id", "-name"]);
    let cleared = ordered.order_by(&[]);

    // Ordering is part of the fingerprint, so observe it there.
    assert_ne!(
        base.cache_key().unwrap().key,
        ordered.cache_key().unwrap().key
    );
    assert_eq!(
        base.cache_key().unwrap().key,
        cleared.cache_key().unwrap().key
    );
}

#[tokio::test]
async fn test_empty_in_list_returns_no_records() {
    let (client, transport) = mock_client();

    let query = client.model("res.partner").filter(field("id").in_(json!([])));
    let records = query.all().await.unwrap();
    assert!(records.is_empty());

    let call = &transport.calls_for("res.partner", "search_read")[0];
    assert_eq!(call.args[0], json!([["id", "in", []]]));
}

#[tokio::test]
async fn test_filter_by_lookups_and_exclude() {
    let (client, transport) = mock_client();

    client
        .model("res.partner")
        .filter_by(vec![
            ("name__icontains", json!("acme")),
            ("age__gte", json!(18)),
        ])
        .exclude(field("state").eq("done"))
        .all()
        .await
        .unwrap();

    let call = &transport.calls_for("res.partner", "search_read")[0];
    assert_eq!(
        call.args[0],
        json!([
            ["name", "ilike", "%acme%"],
            ["age", ">=", 18],
            "!",
            ["state", "=", "done"]
        ])
    );
}

#[tokio::test]
async fn test_first_and_get_semantics() {
    let (client, transport) = mock_client();

    // first() limits to one.
    transport.push_response(
        "res.partner",
        "search_read",
        json!([{"id": 1, "name": "Solo"}]),
    );
    let first = client.model("res.partner").first().await.unwrap().unwrap();
    assert_eq!(first.id(), 1);
    let call = &transport.calls_for("res.partner", "search_read")[0];
    assert_eq!(call.kwargs["limit"], json!(1));

    // get() with no match raises NotFound.
    let err = client.model("res.partner").get().await.unwrap_err();
    assert!(matches!(err, ClientError::NotFound(_)));

    // get() with two matches raises MultipleMatches.
    transport.push_response("res.partner", "search_read", partner_rows());
    let err = client.model("res.partner").get().await.unwrap_err();
    assert!(matches!(err, ClientError::MultipleMatches(_)));
}

#[tokio::test]
async fn test_count_and_exists() {
    let (client, transport) = mock_client();
    transport.push_response("res.partner", "search_count", json!(3));

    let count = client
        .model("res.partner")
        .filter(field("is_company").eq(true))
        .count()
        .await
        .unwrap();
    assert_eq!(count, 3);

    // exists() delegates to search_count (default mock count is 0).
    assert!(!client.model("res.partner").exists().await.unwrap());
}

#[tokio::test]
async fn test_values_and_values_list() {
    let (client, transport) = mock_client();
    transport.push_response(
        "res.partner",
        "search_read",
        json!([
            {"id": 1, "name": "A", "email": "a@x.com"},
            {"id": 2, "name": "B", "email": "b@x.com"},
        ]),
    );
    transport.push_response(
        "res.partner",
        "search_read",
        json!([
            {"id": 1, "name": "A"},
            {"id": 2, "name": "B"},
        ]),
    );

    let rows = client.model("res.partner").values(&["name", "email"]).await.unwrap();
    assert_eq!(rows[0]["email"], json!("a@x.com"));
    let call = &transport.calls_for("res.partner", "search_read")[0];
    assert_eq!(call.kwargs["fields"], json!(["name", "email"]));

    let names = client
        .model("res.partner")
        .values_list(&["name"], true)
        .await
        .unwrap();
    assert_eq!(names, vec![json!("A"), json!("B")]);

    let err = client
        .model("res.partner")
        .values_list(&[], false)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Validation(_)));
}

#[tokio::test]
async fn test_only_defer_and_context() {
    let (client, transport) = mock_client();

    client
        .model("res.partner")
        .only(&["name", "email", "phone"])
        .defer(&["phone"])
        .with_context("lang", json!("en_US"))
        .all()
        .await
        .unwrap();

    let call = &transport.calls_for("res.partner", "search_read")[0];
    assert_eq!(call.kwargs["fields"], json!(["name", "email"]));
    assert_eq!(call.kwargs["context"]["lang"], json!("en_US"));
}

#[tokio::test]
async fn test_identical_rerun_against_unchanged_server_is_equal() {
    let (client, transport) = mock_client();
    transport.push_response("res.partner", "search_read", partner_rows());
    transport.push_response("res.partner", "search_read", partner_rows());

    let query = client.model("res.partner").cache(None, false);
    let a = query.values(&[]).await.unwrap();
    let b = query.values(&[]).await.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_per_query_ttl_override() {
    let (client, transport) = mock_client();
    client.setup_memory_cache(1000, None, StrategyKind::Ttl);

    transport.push_response("res.partner", "search_read", partner_rows());
    transport.push_response("res.partner", "search_read", partner_rows());

    let query = client
        .model("res.partner")
        .cache(Some(Duration::from_millis(30)), true);
    query.all().await.unwrap();
    assert_eq!(transport.call_count("res.partner", "search_read"), 1);

    // After the short TTL the entry is gone and the query re-fetches.
    tokio::time::sleep(Duration::from_millis(60)).await;
    query.all().await.unwrap();
    assert_eq!(transport.call_count("res.partner", "search_read"), 2);
}
