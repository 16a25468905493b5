//! Webhook delivery, against a wiremock endpoint.

mod common;

use common::fixtures::*;
use orchestrator::database::records::{NotificationLevel, Trigger};

#[tokio::test]
async fn test_run_outcome_is_posted_to_the_webhook() {
    let webhook = MockWebhookServer::start().await;
    webhook.mock_success().await;

    let stack = TestStack::with_options(StackOptions {
        webhook_url: Some(webhook.url()),
        ..StackOptions::default()
    })
    .await;
    stack.save_profile(&passing_profile(profiles::STANDARD)).await;

    stack
        .facade
        .run(profiles::STANDARD, Trigger::Manual, false)
        .await
        .unwrap();

    let bodies = webhook.received_bodies().await;
    assert!(!bodies.is_empty(), "the completed run must reach the webhook");
    let body = &bodies[0];
    assert_eq!(body["level"], "INFO");
    assert!(body["title"].as_str().unwrap().contains("Maintenance"));
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains(profiles::STANDARD));
}

#[tokio::test]
async fn test_webhook_failure_does_not_fail_the_run() {
    let webhook = MockWebhookServer::start().await;
    webhook.mock_failure(500).await;

    let stack = TestStack::with_options(StackOptions {
        webhook_url: Some(webhook.url()),
        ..StackOptions::default()
    })
    .await;
    stack.save_profile(&passing_profile(profiles::STANDARD)).await;

    let outcome = stack
        .facade
        .run(profiles::STANDARD, Trigger::Manual, false)
        .await
        .unwrap();

    // Delivery is best-effort; the run itself is unaffected
    assert_eq!(outcome.exit_code(), 0);

    // And the event is still on record locally
    let events = stack.database.recent_notification_events(10).await.unwrap();
    assert!(events.iter().any(|e| e.level == NotificationLevel::Info));
}
