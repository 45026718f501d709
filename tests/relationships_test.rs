// Lazy relationship and N+1 batching tests.

mod common;

use common::mock_client;
use serde_json::json;

use rusty_erp::models::{FieldDescriptor, FieldKind, ModelDescriptor};
use rusty_erp::RelationValue;

fn register_partner_schema(client: &rusty_erp::OdooClient) {
    client.registry().register(
        ModelDescriptor::new("res.partner")
            .field(FieldDescriptor::new("name", FieldKind::Char).required())
            .field(FieldDescriptor::new(
                "country_id",
                FieldKind::Many2One {
                    relation: "res.country".to_string(),
                },
            ))
            .field(FieldDescriptor::new(
                "child_ids",
                FieldKind::One2Many {
                    relation: "res.partner".to_string(),
                    inverse: Some("parent_id".to_string()),
                },
            )),
    );
    client.registry().register(
        ModelDescriptor::new("res.country")
            .field(FieldDescriptor::new("name", FieldKind::Char).required())
            .field(FieldDescriptor::new("code", FieldKind::Char)),
    );
}

fn partner_rows(count: usize) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = (1..=count)
        .map(|i| {
            json!({
                "id": i,
                "name": format!("Partner {}", i),
                // Three distinct countries across the whole set.
                "country_id": [(i % 3 + 1) as i64, format!("Country {}", i % 3 + 1)],
            })
        })
        .collect();
    json!(rows)
}

fn country_rows() -> serde_json::Value {
    json!([
        {"id": 1, "name": "Country 1", "display_name": "Country 1"},
        {"id": 2, "name": "Country 2", "display_name": "Country 2"},
        {"id": 3, "name": "Country 3", "display_name": "Country 3"},
    ])
}

#[tokio::test]
async fn test_n_plus_one_elimination() {
    let (client, transport) = mock_client();
    register_partner_schema(&client);

    transport.push_response("res.partner", "search_read", partner_rows(50));
    transport.push_response("res.country", "search_read", country_rows());

    let partners = client.model("res.partner").all().await.unwrap();
    assert_eq!(partners.len(), 50);

    // Await country_id on all 50 partners concurrently.
    let loads = partners
        .iter()
        .map(|partner| {
            let relationship = partner.relationship("country_id").unwrap();
            async move { relationship.load().await }
        })
        .collect::<Vec<_>>();
    let resolved = futures::future::join_all(loads).await;

    for (i, value) in resolved.iter().enumerate() {
        let value = value.as_ref().unwrap();
        let country = value.record().expect("country resolved");
        assert_eq!(country.id(), ((i + 1) % 3 + 1) as i64);
    }

    // 1 RPC for partners + 1 for countries. Not 51.
    assert_eq!(transport.call_count("res.partner", "search_read"), 1);
    assert_eq!(transport.call_count("res.country", "search_read"), 1);

    // The single batched fetch selected exactly the distinct ids.
    let call = &transport.calls_for("res.country", "search_read")[0];
    let domain = &call.args[0];
    assert_eq!(domain[0][0], json!("id"));
    assert_eq!(domain[0][1], json!("in"));
    let mut ids: Vec<i64> = domain[0][2]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(serde_json::Value::as_i64)
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_duplicate_lazy_loads_hit_the_memo() {
    let (client, transport) = mock_client();
    register_partner_schema(&client);

    transport.push_response("res.partner", "search_read", partner_rows(2));
    transport.push_response("res.country", "search_read", country_rows());

    let partners = client.model("res.partner").all().await.unwrap();

    let first = partners[0].relationship("country_id").unwrap();
    first.load().await.unwrap();
    assert_eq!(transport.call_count("res.country", "search_read"), 1);

    // A second relationship over the same target ids resolves from the
    // prefetch memo without another RPC.
    let again = partners[0].relationship("country_id").unwrap();
    again.load().await.unwrap();
    assert_eq!(transport.call_count("res.country", "search_read"), 1);
}

#[tokio::test]
async fn test_collection_relationship_preserves_id_order() {
    let (client, transport) = mock_client();
    register_partner_schema(&client);

    transport.push_response(
        "res.partner",
        "search_read",
        json!([{"id": 1, "name": "Root", "child_ids": [12, 10, 11]}]),
    );
    transport.push_response(
        "res.partner",
        "search_read",
        json!([
            {"id": 10, "name": "Child 10"},
            {"id": 11, "name": "Child 11"},
            {"id": 12, "name": "Child 12"},
        ]),
    );

    let root = client.model("res.partner").get().await.unwrap();
    let children = root.relationship("child_ids").unwrap();
    assert!(children.is_collection());

    let value = children.load().await.unwrap();
    let RelationValue::Many(records) = value else {
        panic!("expected a collection value");
    };
    // Input id order, not server order.
    let ids: Vec<i64> = records.iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec![12, 10, 11]);
}

#[tokio::test]
async fn test_null_relationship_loads_empty() {
    let (client, transport) = mock_client();
    register_partner_schema(&client);

    transport.push_response(
        "res.partner",
        "search_read",
        json!([{"id": 1, "name": "Orphan", "country_id": false}]),
    );

    let orphan = client.model("res.partner").get().await.unwrap();
    let relationship = orphan.relationship("country_id").unwrap();
    assert!(relationship.ids().is_empty());

    let value = relationship.load().await.unwrap();
    assert!(value.is_empty());
    // No RPC for an empty id set.
    assert_eq!(transport.call_count("res.country", "search_read"), 0);
}

#[tokio::test]
async fn test_failed_batch_load_propagates_to_all_awaiters() {
    let (client, transport) = mock_client();
    register_partner_schema(&client);

    transport.push_response("res.partner", "search_read", partner_rows(10));
    transport.push_failure(
        "res.country",
        "search_read",
        common::MockFailure::Connection("country service down".to_string()),
    );

    let partners = client.model("res.partner").all().await.unwrap();
    let loads = partners
        .iter()
        .map(|partner| {
            let relationship = partner.relationship("country_id").unwrap();
            async move { relationship.load().await }
        })
        .collect::<Vec<_>>();
    let resolved = futures::future::join_all(loads).await;

    assert!(resolved.iter().all(|r| r.is_err()));
    // The failure came from a single coalesced fetch.
    assert_eq!(transport.call_count("res.country", "search_read"), 1);
}

#[tokio::test]
async fn test_prefetch_related_avoids_followup_rpc() {
    let (client, transport) = mock_client();
    register_partner_schema(&client);

    transport.push_response("res.partner", "search_read", partner_rows(20));
    transport.push_response("res.country", "search_read", country_rows());

    let partners = client
        .model("res.partner")
        .prefetch_related(&["country_id"])
        .all()
        .await
        .unwrap();
    // The prefetch follow-up already ran.
    assert_eq!(transport.call_count("res.country", "search_read"), 1);

    // Later loads resolve from the memo: still one country RPC.
    for partner in &partners {
        partner
            .relationship("country_id")
            .unwrap()
            .load()
            .await
            .unwrap();
    }
    assert_eq!(transport.call_count("res.country", "search_read"), 1);
}

#[tokio::test]
async fn test_unknown_relationship_field_is_rejected() {
    let (client, transport) = mock_client();
    register_partner_schema(&client);
    transport.push_response(
        "res.partner",
        "search_read",
        json!([{"id": 1, "name": "A"}]),
    );

    let record = client.model("res.partner").get().await.unwrap();
    assert!(record.relationship("missing_field").is_err());
    // A scalar field is not a relationship either.
    assert!(record.relationship("name").is_err());
}
