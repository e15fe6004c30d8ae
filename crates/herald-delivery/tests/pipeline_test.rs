//! End-to-end pipeline tests: ingest through partition, spread and delivery
//! against a mock callback server.

use std::time::Duration;

use anyhow::Result;
use herald_core::{retry::RetryPolicy, Action, DocumentId, EndpointOverride};
use herald_testing::{
    DocumentBuilder, MockEndpoint, ResourceBuilder, SubscriptionBuilder, TestEnv,
};
use serde_json::{json, Value};

const USER: &str = "https://api.example.com/users/42";

fn doc(revision: i64) -> Value {
    Value::Object(DocumentBuilder::new(revision).build())
}

#[tokio::test]
async fn create_update_then_replay_delivers_each_revision_once() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/hook")).await;
    let resource = env.default_resource().await?;
    let subscription = env.subscribe_mock(&resource, "/hook").await?;

    env.ingest(USER, doc(1)).await?;
    env.run_until_idle().await?;
    env.ingest(USER, doc(2)).await?;
    env.run_until_idle().await?;
    let replay = env.ingest(USER, doc(1)).await?;
    env.run_until_idle().await?;

    assert_eq!(replay.enqueued, None);
    let requests = env.http_mock.requests_to("/hook").await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header("x-herald-action"), Some("create"));
    assert_eq!(requests[0].header("x-herald-revision"), Some("1"));
    assert_eq!(requests[1].header("x-herald-action"), Some("update"));
    assert_eq!(requests[1].header("x-herald-revision"), Some("2"));
    assert_eq!(
        requests[1].header("x-herald-subscription-id"),
        Some(subscription.id.to_string().as_str())
    );
    assert_eq!(requests[1].body["id"], json!(USER));
    assert_eq!(requests[1].body["action"], json!("update"));

    let revisions: Vec<_> = env.events().delivered().await.iter().map(|r| r.revision).collect();
    assert_eq!(revisions, vec![1, 2]);
    assert!(env.engine().is_idle());
    Ok(())
}

#[tokio::test]
async fn resubmitted_revision_is_not_delivered_twice() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/hook")).await;
    let resource = env.default_resource().await?;
    env.subscribe_mock(&resource, "/hook").await?;

    env.ingest(USER, doc(1)).await?;
    env.run_until_idle().await?;
    let resubmitted = env.ingest(USER, doc(1)).await?;
    env.run_until_idle().await?;

    assert_eq!(resubmitted.enqueued, Some(Action::Update));
    env.http_mock.assert_request_count(1).await;
    let skipped = env.events().skipped().await;
    assert_eq!(skipped.len(), 1);
    assert!(skipped[0].contains("not newer"));

    env.remove(USER).await?;
    env.run_until_idle().await?;
    env.remove(USER).await?;
    env.run_until_idle().await?;

    env.http_mock.assert_request_count(2).await;
    assert_eq!(env.events().skipped().await.len(), 2);
    assert!(env.engine().is_idle());
    Ok(())
}

#[tokio::test]
async fn endpoint_url_is_templated_from_document_id() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/users/42")).await;
    let resource =
        env.create_resource(ResourceBuilder::new().address("https://api.example.com/v1")).await?;
    env.subscribe(
        SubscriptionBuilder::new(resource.id, env.http_mock.endpoint_url("/users/{id}"))
            .data("user", "{id}")
            .data("rev", "{revision}"),
    )
    .await?;

    env.ingest("https://api.example.com/v1/users/42", doc(3)).await?;
    env.run_until_idle().await?;

    let requests = env.http_mock.requests_to("/users/42").await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body["data"], json!({"user": "42", "rev": "3"}));
    Ok(())
}

#[tokio::test]
async fn failed_update_waits_for_the_retry_window() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_sequence("/hook", &[200, 503], 200).await;
    let resource = env.default_resource().await?;
    env.subscribe(
        SubscriptionBuilder::new(resource.id, env.http_mock.endpoint_url("/hook")).retry(
            RetryPolicy { interval_ms: 1000, ..RetryPolicy::default() },
        ),
    )
    .await?;

    env.ingest(USER, doc(1)).await?;
    env.run_until_idle().await?;
    env.ingest(USER, doc(2)).await?;
    env.run_until_idle().await?;

    assert_eq!(env.events().failed().await.len(), 1);
    assert_eq!(env.engine().queue_stats().delivery.delayed, 1);

    env.redeliver_after(Duration::from_secs(2)).await?;

    env.http_mock.assert_request_count(3).await;
    let revisions: Vec<_> = env.events().delivered().await.iter().map(|r| r.revision).collect();
    assert_eq!(revisions, vec![1, 2]);
    assert!(env.engine().is_idle());
    Ok(())
}

#[tokio::test]
async fn discard_code_ends_delivery_without_redelivery() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::status("/hook", 410)).await;
    let resource = env.default_resource().await?;
    env.subscribe(
        SubscriptionBuilder::new(resource.id, env.http_mock.endpoint_url("/hook"))
            .discard_codes(&[410]),
    )
    .await?;

    env.ingest(USER, doc(1)).await?;
    env.run_until_idle().await?;

    env.http_mock.assert_request_count(1).await;
    assert!(env.events().failed().await.is_empty());
    assert_eq!(env.stats().await.notifications_discarded, 1);
    assert!(env.engine().is_idle());
    Ok(())
}

#[tokio::test]
async fn subscriptions_across_partitions_are_each_notified() -> Result<()> {
    let env = TestEnv::builder().partition_limit(2).build().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/hook")).await;
    let resource = env.default_resource().await?;
    for _ in 0..5 {
        env.subscribe_mock(&resource, "/hook").await?;
    }

    let partitions = env.storage().resources.partitions(resource.id).await?;
    assert_eq!(partitions.len(), 3);

    env.ingest(USER, doc(1)).await?;
    env.run_until_idle().await?;

    env.http_mock.assert_request_count(5).await;
    let mut notified: Vec<_> =
        env.events().delivered().await.iter().map(|r| r.subscription_id).collect();
    notified.sort();
    notified.dedup();
    assert_eq!(notified.len(), 5);
    Ok(())
}

#[tokio::test]
async fn delete_is_sent_to_the_delete_override() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/hook")).await;
    env.http_mock.mock_endpoint(MockEndpoint::success("/gone/42").method("DELETE")).await;
    let resource = env.default_resource().await?;
    env.subscribe(
        SubscriptionBuilder::new(resource.id, env.http_mock.endpoint_url("/hook")).on(
            Action::Delete,
            EndpointOverride {
                url: Some(env.http_mock.endpoint_url("/gone/{id}")),
                method: Some("DELETE".to_string()),
                headers: None,
            },
        ),
    )
    .await?;

    env.ingest(USER, doc(4)).await?;
    env.run_until_idle().await?;
    env.remove(USER).await?;
    env.run_until_idle().await?;

    let deletes = env.http_mock.requests_to("/gone/42").await;
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].method, "DELETE");
    assert_eq!(deletes[0].header("x-herald-revision"), Some("4"));

    // ledger entry is gone, so a second delete has nothing to notify
    env.ingestor().enqueue(Action::Delete, &DocumentId::from(USER), resource.id).await?;
    env.run_until_idle().await?;
    assert_eq!(env.http_mock.requests_to("/gone/42").await.len(), 1);
    assert!(!env.events().skipped().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn documents_of_other_resources_are_ignored() -> Result<()> {
    let env = TestEnv::new().await?;
    env.http_mock.mock_any(200).await;
    let users = env.default_resource().await?;
    env.create_resource(ResourceBuilder::new().path("/orders/{order}")).await?;
    env.subscribe_mock(&users, "/hook").await?;

    env.ingest("https://api.example.com/orders/7", doc(1)).await?;
    env.run_until_idle().await?;

    env.http_mock.assert_request_count(0).await;
    Ok(())
}

#[tokio::test]
async fn background_workers_deliver_and_shut_down() -> Result<()> {
    let mut env = TestEnv::new().await?;
    env.http_mock.mock_endpoint(MockEndpoint::success("/hook")).await;
    let resource = env.default_resource().await?;
    env.subscribe_mock(&resource, "/hook").await?;

    env.start().await?;
    env.ingest(USER, doc(1)).await?;
    env.events().wait_for(1).await;
    env.shutdown().await?;

    env.http_mock.assert_request_count(1).await;
    assert_eq!(env.events().delivered().await.len(), 1);
    Ok(())
}
