//! Behavior-driven tests for the network transport
//!
//! These tests run the production reqwest client against a local mock server
//! and verify HOW failures are classified, retried and timed out.

use riskmesh_core::{
    Backoff, EventBus, HttpErrorKind, HttpRequest, OrchestratorEvent, ProviderId, ReqwestHttpClient,
    Transport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn usgs() -> ProviderId {
    ProviderId::from_static("USGS")
}

fn transport(events: EventBus) -> Transport {
    Transport::new(
        Arc::new(ReqwestHttpClient::new()),
        Backoff::Fixed {
            delay: Duration::from_millis(5),
        },
        events,
    )
}

// =============================================================================
// Transport: Retries
// =============================================================================

#[tokio::test]
async fn when_upstream_is_briefly_unavailable_the_call_is_retried_until_it_succeeds() {
    // Given: A server that answers 503 twice, then 200
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fdsnws/event/1/query"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fdsnws/event/1/query"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"features":[]}"#))
        .mount(&server)
        .await;
    let events = EventBus::new(64);
    let mut receiver = events.subscribe();

    // When: The call is sent with two retries allowed
    let response = transport(events)
        .send(
            &usgs(),
            HttpRequest::get(format!("{}/fdsnws/event/1/query", server.uri())),
            2,
        )
        .await
        .expect("third attempt succeeds");

    // Then: Three requests reached the server and two retries were announced
    assert_eq!(response.status, 200);
    assert_eq!(response.body, r#"{"features":[]}"#);
    let requests = server.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 3);

    let mut retries = 0;
    while let Ok(event) = receiver.try_recv() {
        if matches!(event, OrchestratorEvent::TransportRetrying { .. }) {
            retries += 1;
        }
    }
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn when_upstream_rejects_the_request_it_is_not_retried() {
    // Given: A server that answers 404
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such feed"))
        .mount(&server)
        .await;

    // When: The call is sent with a generous retry budget
    let error = transport(EventBus::new(16))
        .send(&usgs(), HttpRequest::get(format!("{}/missing", server.uri())), 3)
        .await
        .expect_err("404 is permanent");

    // Then: Exactly one request was made and the error is permanent
    assert_eq!(error.status_code(), Some(404));
    assert!(!error.is_transient());
    let requests = server.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn when_retries_run_out_the_last_failure_is_returned() {
    // Given: A server that is always overloaded
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    // When: The call is sent with one retry
    let error = transport(EventBus::new(16))
        .send(&usgs(), HttpRequest::get(server.uri()), 1)
        .await
        .expect_err("still unavailable");

    // Then: Two attempts were made
    assert_eq!(error.status_code(), Some(503));
    let requests = server.received_requests().await.expect("recording enabled");
    assert_eq!(requests.len(), 2);
}

#[tokio::test]
async fn when_a_status_is_expected_it_counts_as_success() {
    // Given: A health endpoint that answers 204
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    // When: The probe expects 204 only
    let response = transport(EventBus::new(16))
        .send_expecting(
            &usgs(),
            HttpRequest::get(format!("{}/health", server.uri())),
            0,
            &[204],
        )
        .await
        .expect("204 is expected");

    // Then: The response is returned as-is
    assert_eq!(response.status, 204);
}

// =============================================================================
// Transport: Timeouts
// =============================================================================

#[tokio::test]
async fn when_upstream_is_slower_than_the_timeout_the_attempt_is_abandoned() {
    // Given: A server that takes two seconds to answer
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    // When: The request allows 100ms and one retry
    let started = std::time::Instant::now();
    let error = transport(EventBus::new(16))
        .send(
            &usgs(),
            HttpRequest::get(server.uri()).with_timeout(Duration::from_millis(100)),
            1,
        )
        .await
        .expect_err("too slow");

    // Then: Both attempts time out well before the server would answer
    assert_eq!(error.kind(), HttpErrorKind::Timeout);
    assert!(error.is_transient());
    assert!(started.elapsed() < Duration::from_secs(2));
}

// =============================================================================
// Transport: Failure Classes
// =============================================================================

#[tokio::test]
async fn when_the_url_is_malformed_the_call_fails_once_as_permanent() {
    // Given: A provider URL that cannot be parsed
    let events = EventBus::new(16);
    let mut receiver = events.subscribe();

    // When: It is sent with retries available
    let error = transport(events)
        .send(&usgs(), HttpRequest::get("usgs endpoint"), 3)
        .await
        .expect_err("nothing to connect to");

    // Then: It is a permanent request error and nothing was retried
    assert_eq!(error.kind(), HttpErrorKind::Request);
    assert!(!error.is_transient());
    let mut started = 0;
    let mut retries = 0;
    while let Ok(event) = receiver.try_recv() {
        match event {
            OrchestratorEvent::TransportAttemptStarted { .. } => started += 1,
            OrchestratorEvent::TransportRetrying { .. } => retries += 1,
            _ => {}
        }
    }
    assert_eq!(started, 1);
    assert_eq!(retries, 0);
}

#[tokio::test]
async fn when_the_connection_drops_mid_body_the_failure_is_transient() {
    // Given: A server that promises 100 bytes and hangs up after 7
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("address");
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0_u8; 2048];
            let _ = socket.read(&mut request).await;
            let _ = socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .await;
            let _ = socket.shutdown().await;
        }
    });

    // When: A single attempt is made
    let error = transport(EventBus::new(16))
        .send(&usgs(), HttpRequest::get(format!("http://{address}/feed")), 0)
        .await
        .expect_err("body is cut short");

    // Then: It is classified as a retryable connection failure
    assert_eq!(error.kind(), HttpErrorKind::Connection);
    assert!(error.is_transient());
}
