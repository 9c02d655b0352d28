//! Dispatch and attempt tests against a mock HTTP receiver.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cityforge_events::{EventFactory, EventType, payload::UserRegistered};
use cityforge_webhooks::{
    DeliveryError, DeliveryOutcome, DeliveryStatus, InMemoryLedger, NewEndpoint, RetryPolicy, WebhookConfig,
    WebhookLedger, WebhookReceiver, WebhookSystem, sign_payload,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn enabled_config() -> WebhookConfig {
    WebhookConfig::default().enabled(true).environment("test")
}

fn system_with_ledger() -> (WebhookSystem, Arc<InMemoryLedger>) {
    let ledger = Arc::new(InMemoryLedger::new());
    let system = WebhookSystem::with_ledger(enabled_config(), ledger.clone()).unwrap();
    (system, ledger)
}

async fn mount_status(server: &MockServer, route: &str, status: u16) {
    Mock::given(method("POST"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(status))
        .mount(server)
        .await;
}

fn header_value(request: &wiremock::Request, name: &str) -> Option<String> {
    request
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

// =============================================================================
// Fan-out
// =============================================================================

#[tokio::test]
async fn test_fans_out_to_subscribed_enabled_endpoints_only() {
    let server = MockServer::start().await;
    mount_status(&server, "/a", 200).await;
    mount_status(&server, "/b", 200).await;
    mount_status(&server, "/disabled", 200).await;
    mount_status(&server, "/other", 200).await;

    let (system, ledger) = system_with_ledger();
    for (name, route) in [("a", "/a"), ("b", "/b")] {
        system
            .add_endpoint(
                NewEndpoint::new(name, format!("{}{}", server.uri(), route)).events([EventType::UserRegistered]),
            )
            .await
            .unwrap();
    }
    system
        .add_endpoint(
            NewEndpoint::new("disabled", format!("{}/disabled", server.uri()))
                .events([EventType::UserRegistered])
                .disabled(),
        )
        .await
        .unwrap();
    system
        .add_endpoint(NewEndpoint::new("other", format!("{}/other", server.uri())).events([EventType::CardSubmitted]))
        .await
        .unwrap();

    let report = system
        .create_and_send_event(EventType::UserRegistered, json!({"user_id": 7}))
        .await;

    assert_eq!(report.delivery_count(), 2);
    assert_eq!(report.delivered_count(), 2);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);

    let event_id = report.event_id.unwrap();
    let deliveries = ledger.list_deliveries_for_event(&event_id).await.unwrap();
    assert_eq!(deliveries.len(), 2);
    for delivery in deliveries {
        assert_eq!(delivery.status, DeliveryStatus::Delivered);
        assert_eq!(delivery.attempt, 1);
        assert_eq!(delivery.response_status, Some(200));
    }
    assert!(system.engine().queue().is_empty().await);
}

#[tokio::test]
async fn test_event_without_subscribers_is_still_recorded() {
    let (system, ledger) = system_with_ledger();

    let report = system
        .create_and_send_event(EventType::SupportTicketCreated, json!({"ticket_id": 1}))
        .await;

    assert!(!report.disabled);
    assert_eq!(report.delivery_count(), 0);
    let event_id = report.event_id.unwrap();
    assert!(ledger.get_event(&event_id).await.unwrap().is_some());
    assert_eq!(ledger.delivery_count().await, 0);
}

#[tokio::test]
async fn test_disabled_system_sends_nothing() {
    let server = MockServer::start().await;
    mount_status(&server, "/hook", 200).await;

    let ledger = Arc::new(InMemoryLedger::new());
    let system = WebhookSystem::with_ledger(WebhookConfig::default(), ledger.clone()).unwrap();
    system
        .add_endpoint(
            NewEndpoint::new("hook", format!("{}/hook", server.uri())).events([EventType::UserRegistered]),
        )
        .await
        .unwrap();

    let report = system
        .create_and_send_event(EventType::UserRegistered, json!({"user_id": 1}))
        .await;

    assert!(report.disabled);
    assert!(server.received_requests().await.unwrap().is_empty());
    assert_eq!(ledger.event_count().await, 0);
    assert_eq!(ledger.delivery_count().await, 0);
}

#[tokio::test]
async fn test_typed_payload_dispatch() {
    let server = MockServer::start().await;
    mount_status(&server, "/hook", 204).await;

    let (system, _) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("hook", format!("{}/hook", server.uri())).events([EventType::UserRegistered]),
        )
        .await
        .unwrap();

    let payload = UserRegistered {
        user_id: 42,
        email: "ada@example.com".to_string(),
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        registered_at: chrono::Utc::now(),
    };
    let report = system.create_and_send_typed(&payload).await;
    assert_eq!(report.delivered_count(), 1);

    let requests = server.received_requests().await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["type"], "user.registered");
    assert_eq!(body["environment"], "test");
    assert_eq!(body["data"]["user_id"], 42);
}

// =============================================================================
// Request shape
// =============================================================================

#[tokio::test]
async fn test_signed_request_headers() {
    let server = MockServer::start().await;
    mount_status(&server, "/hook", 200).await;

    let (system, _) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("hook", format!("{}/hook", server.uri()))
                .secret("whsec_test")
                .events([EventType::CardSubmitted]),
        )
        .await
        .unwrap();

    let report = system
        .create_and_send_event(EventType::CardSubmitted, json!({"card_id": 3}))
        .await;
    let delivery_id = report.outcomes[0].delivery_id().to_string();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];

    assert_eq!(header_value(request, "content-type").as_deref(), Some("application/json"));
    assert_eq!(header_value(request, "x-event").as_deref(), Some("card.submitted"));
    assert_eq!(header_value(request, "x-delivery"), Some(delivery_id));
    assert!(header_value(request, "user-agent").unwrap().starts_with("CityForge-Webhooks/"));
    assert!(header_value(request, "x-timestamp").unwrap().ends_with('Z'));

    let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(header_value(request, "x-timestamp").as_deref(), body["timestamp"].as_str());

    let signature = header_value(request, "x-signature").unwrap();
    assert_eq!(signature, sign_payload(&request.body, "whsec_test"));

    let event = WebhookReceiver::new("whsec_test")
        .verify(Some(&signature), &request.body)
        .unwrap();
    assert_eq!(Some(event.id), report.event_id);
}

#[tokio::test]
async fn test_unsigned_request_without_secret() {
    let server = MockServer::start().await;
    mount_status(&server, "/hook", 200).await;

    let (system, _) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("hook", format!("{}/hook", server.uri())).events([EventType::UserRegistered]),
        )
        .await
        .unwrap();

    system
        .create_and_send_event(EventType::UserRegistered, json!({}))
        .await;

    let requests = server.received_requests().await.unwrap();
    assert!(header_value(&requests[0], "x-signature").is_none());
}

#[tokio::test]
async fn test_custom_headers_applied_and_reserved_skipped() {
    let server = MockServer::start().await;
    mount_status(&server, "/hook", 200).await;

    let ledger = Arc::new(InMemoryLedger::new());
    let system = WebhookSystem::with_ledger(enabled_config(), ledger.clone()).unwrap();

    // Stored directly, bypassing registry validation.
    let mut endpoint = NewEndpoint::new("hook", format!("{}/hook", server.uri()))
        .events([EventType::UserRegistered])
        .header("X-Tenant", "cityforge")
        .build();
    endpoint
        .custom_headers
        .insert("X-Event".to_string(), "forged.event".to_string());
    ledger.save_endpoint(&endpoint).await.unwrap();

    let report = system
        .create_and_send_event(EventType::UserRegistered, json!({}))
        .await;
    assert_eq!(report.delivered_count(), 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(header_value(&requests[0], "x-tenant").as_deref(), Some("cityforge"));
    assert_eq!(header_value(&requests[0], "x-event").as_deref(), Some("user.registered"));
    assert_eq!(requests[0].headers.get_all("x-event").iter().count(), 1);
}

// =============================================================================
// Failures and retries
// =============================================================================

#[tokio::test]
async fn test_server_error_backs_off_then_fails() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let (system, ledger) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("hook", format!("{}/hook", server.uri()))
                .events([EventType::UserRegistered])
                .retry_policy(RetryPolicy::new(3, 30, true)),
        )
        .await
        .unwrap();

    let before = chrono::Utc::now();
    let report = system
        .create_and_send_event(EventType::UserRegistered, json!({}))
        .await;

    let (delivery_id, first_retry) = match &report.outcomes[0] {
        DeliveryOutcome::RetryScheduled {
            delivery_id,
            attempt,
            next_retry_at,
            error,
        } => {
            assert_eq!(*attempt, 1);
            assert_eq!(*error, DeliveryError::Status { status: 500 });
            (delivery_id.clone(), *next_retry_at)
        }
        other => panic!("expected retry, got {:?}", other),
    };
    let delay = (first_retry - before).num_seconds();
    assert!((29..=31).contains(&delay), "first delay was {}s", delay);

    let stored = ledger.get_delivery(&delivery_id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Pending);
    assert_eq!(stored.response_status, Some(500));
    assert_eq!(stored.response_body.as_deref(), Some("boom"));

    let engine = system.engine();
    let before = chrono::Utc::now();
    match engine.attempt_delivery(&delivery_id).await {
        DeliveryOutcome::RetryScheduled {
            attempt, next_retry_at, ..
        } => {
            assert_eq!(attempt, 2);
            let delay = (next_retry_at - before).num_seconds();
            assert!((59..=61).contains(&delay), "second delay was {}s", delay);
        }
        other => panic!("expected retry, got {:?}", other),
    }

    match engine.attempt_delivery(&delivery_id).await {
        DeliveryOutcome::Failed { attempt, .. } => assert_eq!(attempt, 3),
        other => panic!("expected failure, got {:?}", other),
    }

    let stored = ledger.get_delivery(&delivery_id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
    assert_eq!(stored.attempt, 3);
    assert!(stored.next_retry_at.is_none());
    assert!(!engine.queue().contains(&delivery_id).await);

    // Terminal deliveries are never attempted again.
    assert!(matches!(
        engine.attempt_delivery(&delivery_id).await,
        DeliveryOutcome::Skipped { .. }
    ));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_single_attempt_policy_fails_immediately() {
    let server = MockServer::start().await;
    mount_status(&server, "/hook", 404).await;

    let (system, ledger) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("hook", format!("{}/hook", server.uri()))
                .events([EventType::UserRegistered])
                .retry_policy(RetryPolicy::default().max_retries(1)),
        )
        .await
        .unwrap();

    let report = system
        .create_and_send_event(EventType::UserRegistered, json!({}))
        .await;

    let DeliveryOutcome::Failed { delivery_id, error, .. } = &report.outcomes[0] else {
        panic!("expected failure, got {:?}", report.outcomes[0]);
    };
    assert!(error.contains("404"));
    let stored = ledger.get_delivery(delivery_id).await.unwrap().unwrap();
    assert_eq!(stored.status, DeliveryStatus::Failed);
}

#[tokio::test]
async fn test_timeout_is_a_retryable_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let (system, ledger) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("slow", format!("{}/slow", server.uri()))
                .events([EventType::UserRegistered])
                .timeout_seconds(1),
        )
        .await
        .unwrap();

    let report = system
        .create_and_send_event(EventType::UserRegistered, json!({}))
        .await;

    match &report.outcomes[0] {
        DeliveryOutcome::RetryScheduled { delivery_id, error, .. } => {
            assert_eq!(*error, DeliveryError::Timeout { seconds: 1 });
            let stored = ledger.get_delivery(delivery_id).await.unwrap().unwrap();
            assert!(stored.response_status.is_none());
            assert!(stored.error_message.unwrap().contains("timed out"));
        }
        other => panic!("expected retry, got {:?}", other),
    }
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let (system, _) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("gone", format!("http://127.0.0.1:{}/hook", port)).events([EventType::UserRegistered]),
        )
        .await
        .unwrap();

    let report = system
        .create_and_send_event(EventType::UserRegistered, json!({}))
        .await;

    assert!(matches!(
        &report.outcomes[0],
        DeliveryOutcome::RetryScheduled {
            error: DeliveryError::Network(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_one_failing_endpoint_does_not_affect_others() {
    let server = MockServer::start().await;
    mount_status(&server, "/ok", 200).await;
    mount_status(&server, "/bad", 503).await;

    let (system, _) = system_with_ledger();
    for route in ["/ok", "/bad"] {
        system
            .add_endpoint(
                NewEndpoint::new(route, format!("{}{}", server.uri(), route)).events([EventType::ReviewReported]),
            )
            .await
            .unwrap();
    }

    let report = system
        .create_and_send_event(EventType::ReviewReported, json!({"review_id": 9}))
        .await;

    assert_eq!(report.delivery_count(), 2);
    assert_eq!(report.delivered_count(), 1);
    assert!(
        report
            .outcomes
            .iter()
            .any(|o| matches!(o, DeliveryOutcome::RetryScheduled { .. }))
    );
    assert_eq!(system.engine().queue().len().await, 1);
}

#[tokio::test]
async fn test_emit_runs_in_background() {
    let server = MockServer::start().await;
    mount_status(&server, "/hook", 200).await;

    let (system, _) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("hook", format!("{}/hook", server.uri())).events([EventType::UserRegistered]),
        )
        .await
        .unwrap();

    let event = EventFactory::new("test").create(EventType::UserRegistered, json!({}));
    let report = system.emit(event).await.unwrap();
    assert_eq!(report.delivered_count(), 1);
}

#[tokio::test]
async fn test_cancelled_dispatch_still_finishes_delivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;

    let (system, ledger) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("slow", format!("{}/slow", server.uri())).events([EventType::UserRegistered]),
        )
        .await
        .unwrap();

    let event = EventFactory::new("test").create(EventType::UserRegistered, json!({}));
    let event_id = event.id.clone();
    let dispatch = tokio::time::timeout(Duration::from_millis(100), system.send_event(event)).await;
    assert!(dispatch.is_err());

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let deliveries = ledger.list_deliveries_for_event(&event_id).await.unwrap();
            if deliveries.iter().any(|d| d.status == DeliveryStatus::Delivered) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert!(system.engine().queue().is_empty().await);
}

#[tokio::test]
async fn test_large_response_body_is_capped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chatty"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(10_000)))
        .mount(&server)
        .await;

    let (system, ledger) = system_with_ledger();
    system
        .add_endpoint(
            NewEndpoint::new("chatty", format!("{}/chatty", server.uri())).events([EventType::UserRegistered]),
        )
        .await
        .unwrap();

    let report = system
        .create_and_send_event(EventType::UserRegistered, json!({"user_id": 1}))
        .await;
    assert_eq!(report.delivered_count(), 1);

    let stored = ledger
        .get_delivery(report.outcomes[0].delivery_id())
        .await
        .unwrap()
        .unwrap();
    let body = stored.response_body.unwrap();
    assert_eq!(body.len(), system.engine().config().max_response_body_bytes);
    assert!(body.chars().all(|c| c == 'x'));
}
