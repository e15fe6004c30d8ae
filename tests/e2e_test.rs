//! End-to-end tests running the pipeline with background workers against
//! mock webhook receivers.

use anyhow::Result;
use herald_core::storage::DocumentWrite;
use herald_testing::{MockEndpoint, ResourceBuilder, SubscriptionBuilder, TestEnv};
use serde_json::json;

#[tokio::test]
async fn revisions_flow_through_background_workers() -> Result<()> {
    let mut env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/users/42")).await;
    let resource = env.default_resource().await?;
    env.subscribe(SubscriptionBuilder::new(
        resource.id,
        env.http_mock.endpoint_url("/users/{id}"),
    ))
    .await?;
    env.start().await?;

    env.ingest("https://api.example.com/users/42", json!({"seq": 1, "name": "Ada"})).await?;
    env.events().wait_for(1).await;
    env.ingest("https://api.example.com/users/42", json!({"seq": 2, "name": "Ada L."})).await?;
    env.events().wait_for(2).await;

    let replay =
        env.ingest("https://api.example.com/users/42", json!({"seq": 1, "name": "Ada"})).await?;
    assert_eq!(replay.write, DocumentWrite::Stale { current: 2 });
    assert_eq!(replay.enqueued, None);

    env.shutdown().await?;

    let requests = env.http_mock.requests_to("/users/42").await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header("x-herald-action"), Some("create"));
    assert_eq!(requests[1].header("x-herald-action"), Some("update"));
    assert_eq!(env.events().len().await, 2);
    Ok(())
}

#[tokio::test]
async fn timestamp_revisions_from_nested_field() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/hook")).await;
    let resource = env
        .create_resource(ResourceBuilder::new().path("/orders/{order}").change_field("meta.updated"))
        .await?;
    env.subscribe_mock(&resource, "/hook").await?;
    let order = "https://api.example.com/orders/7";

    let first = env.ingest(order, json!({"meta": {"updated": "2024-03-01T10:00:00Z"}})).await?;
    env.run_until_idle().await?;
    let older = env.ingest(order, json!({"meta": {"updated": "2024-02-01T10:00:00Z"}})).await?;
    env.run_until_idle().await?;
    let newer = env.ingest(order, json!({"meta": {"updated": "2024-03-01T10:00:01Z"}})).await?;
    env.run_until_idle().await?;

    assert_eq!(first.write, DocumentWrite::Created);
    assert_eq!(older.enqueued, None);
    assert!(newer.revision > first.revision);
    assert_eq!(env.document_revision(order).await?, newer.revision);
    env.http_mock.assert_request_count(2).await;
    Ok(())
}

#[tokio::test]
async fn documents_resolve_through_every_address() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/hook")).await;
    let resource = env
        .create_resource(
            ResourceBuilder::new()
                .address("https://api.example.com")
                .also_at("https://legacy.example.com/v2"),
        )
        .await?;
    env.subscribe_mock(&resource, "/hook").await?;

    env.ingest("https://api.example.com/users/1", json!({"seq": 1})).await?;
    env.ingest("https://legacy.example.com/v2/users/2", json!({"seq": 1})).await?;
    env.run_until_idle().await?;

    let mut ids: Vec<_> = env
        .http_mock
        .requests_to("/hook")
        .await
        .into_iter()
        .map(|request| request.body["id"].as_str().unwrap_or_default().to_string())
        .collect();
    ids.sort();
    assert_eq!(
        ids,
        vec!["https://api.example.com/users/1", "https://legacy.example.com/v2/users/2"]
    );
    Ok(())
}

#[tokio::test]
async fn relative_document_ids_template_the_callback() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/42")).await;
    let resource = env.default_resource().await?;
    env.subscribe(SubscriptionBuilder::new(resource.id, env.http_mock.endpoint_url("/{id}")))
        .await?;

    env.ingest("/users/42", json!({"seq": 1})).await?;
    env.run_until_idle().await?;
    env.ingest("/users/42", json!({"seq": 2})).await?;
    env.run_until_idle().await?;
    env.ingest("/users/42", json!({"seq": 1})).await?;
    env.run_until_idle().await?;

    let requests = env.http_mock.requests_to("/42").await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].header("x-herald-revision"), Some("2"));
    Ok(())
}
