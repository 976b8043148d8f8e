//! Behavior-driven tests for source orchestration
//!
//! These tests verify HOW a fetch moves through the cache, the candidate
//! ordering, circuit breakers, quotas and deadlines before giving up.

use riskmesh_core::{
    Backoff, CacheTtlTable, Category, CircuitBreakerConfig, CircuitState, FetchOptions, HttpClient,
    HttpError, HttpRequest, HttpResponse, OrchestratorBuilder, OrchestratorEvent, ProviderConfig,
    ProviderId, ProviderRegistration, Query, RateLimit, SkipReason, SourceOrchestrator, SourceUsed,
    TemplateAdapter,
};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone)]
enum Route {
    Json(serde_json::Value),
    Status(u16),
    Hang,
}

/// Fake upstreams keyed by host. Unknown hosts answer `{}`.
#[derive(Default)]
struct Upstreams {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl Upstreams {
    fn route(&self, host: &str, route: Route) {
        self.routes
            .lock()
            .expect("routes lock")
            .insert(host.to_owned(), route);
    }

    fn calls(&self, host: &str) -> u32 {
        self.calls
            .lock()
            .expect("calls lock")
            .get(host)
            .copied()
            .unwrap_or(0)
    }
}

fn host_of(url: &str) -> String {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or(rest).to_owned()
}

impl HttpClient for Upstreams {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        let host = host_of(&request.url);
        *self
            .calls
            .lock()
            .expect("calls lock")
            .entry(host.clone())
            .or_insert(0) += 1;
        let route = self
            .routes
            .lock()
            .expect("routes lock")
            .get(&host)
            .cloned()
            .unwrap_or(Route::Json(json!({})));

        Box::pin(async move {
            match route {
                Route::Json(body) => Ok(HttpResponse::ok_json(body.to_string())),
                Route::Status(status) => Ok(HttpResponse::new(status, "upstream says no")),
                Route::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(HttpResponse::ok_json("{}"))
                }
            }
        })
    }
}

fn usgs() -> ProviderId {
    ProviderId::from_static("USGS")
}

fn fema() -> ProviderId {
    ProviderId::from_static("FEMA")
}

fn provider(id: ProviderId, host: &str, priority: u32, config: ProviderConfig) -> ProviderRegistration {
    ProviderRegistration::new(id, Arc::new(TemplateAdapter::new(format!("https://{host}"))))
        .serving(Category::EARTHQUAKE_RISK)
        .with_config(ProviderConfig {
            priority,
            retry_budget: 0,
            ..config
        })
}

fn builder(upstreams: &Arc<Upstreams>, registrations: Vec<ProviderRegistration>) -> OrchestratorBuilder {
    registrations
        .into_iter()
        .fold(SourceOrchestrator::builder(), |builder, registration| {
            builder.register(registration)
        })
        .http_client(Arc::clone(upstreams) as Arc<dyn HttpClient>)
        .backoff(Backoff::Fixed {
            delay: Duration::from_millis(1),
        })
        .breaker_config(CircuitBreakerConfig {
            failure_threshold: 1,
            open_timeout: Duration::from_secs(300),
            failure_window: Duration::from_secs(60),
        })
}

fn build(upstreams: &Arc<Upstreams>, registrations: Vec<ProviderRegistration>) -> SourceOrchestrator {
    builder(upstreams, registrations)
        .build()
        .expect("valid orchestrator")
}

/// USGS then FEMA, with circuits that cool down after 50ms.
fn quick_recovery(upstreams: &Arc<Upstreams>) -> SourceOrchestrator {
    builder(
        upstreams,
        vec![
            provider(usgs(), "usgs.test", 1, ProviderConfig::default()),
            provider(fema(), "fema.test", 2, ProviderConfig::default()),
        ],
    )
    .breaker_config(CircuitBreakerConfig {
        failure_threshold: 1,
        open_timeout: Duration::from_millis(50),
        failure_window: Duration::from_secs(60),
    })
    .build()
    .expect("valid orchestrator")
}

fn usgs_then_fema(upstreams: &Arc<Upstreams>) -> SourceOrchestrator {
    build(
        upstreams,
        vec![
            provider(usgs(), "usgs.test", 1, ProviderConfig::default()),
            provider(fema(), "fema.test", 2, ProviderConfig::default()),
        ],
    )
}

fn quake_query() -> Query {
    Query::new().with("lat", 34.05).with("lon", -118.24)
}

// =============================================================================
// Orchestrator: Fallback
// =============================================================================

#[tokio::test]
async fn when_primary_fails_orchestrator_falls_back_and_reports_the_failure() {
    // Given: USGS answers 500 while FEMA is healthy
    let upstreams = Arc::new(Upstreams::default());
    upstreams.route("usgs.test", Route::Status(500));
    upstreams.route("fema.test", Route::Json(json!({"risk": "moderate"})));
    let orchestrator = usgs_then_fema(&upstreams);

    // When: A fetch is made
    let result = orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("FEMA answers");

    // Then: FEMA served it after USGS failed, and the fallback is visible
    assert_eq!(result.source_used, SourceUsed::Provider(fema()));
    assert_eq!(result.attempted_sources, vec![usgs(), fema()]);
    assert_eq!(result.payload, json!({"risk": "moderate"}));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].provider, usgs());
    assert_eq!(result.errors[0].status, Some(500));
    assert!(!result.warnings.is_empty(), "fallback should be flagged");
}

#[tokio::test]
async fn when_primary_circuit_is_open_it_is_skipped_without_a_network_call() {
    // Given: USGS tripped its breaker on an earlier fetch
    let upstreams = Arc::new(Upstreams::default());
    upstreams.route("usgs.test", Route::Status(503));
    let orchestrator = usgs_then_fema(&upstreams);
    orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("FEMA answers the first time");
    let status = orchestrator.get_source_status(&usgs()).expect("registered");
    assert_eq!(status.circuit.state, CircuitState::Open);

    // When: Another fetch bypasses the cache
    let result = orchestrator
        .fetch(
            &Category::EARTHQUAKE_RISK,
            &quake_query(),
            &FetchOptions::default().skip_cache(),
        )
        .await
        .expect("FEMA answers again");

    // Then: Only FEMA is called and USGS is reported as skipped
    assert_eq!(result.attempted_sources, vec![fema()]);
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(result.skipped[0].provider, usgs());
    assert_eq!(result.skipped[0].reason, SkipReason::CircuitOpen);
    assert_eq!(upstreams.calls("usgs.test"), 1);
}

#[tokio::test]
async fn when_the_cooldown_passes_a_recovered_provider_closes_its_circuit() {
    // Given: USGS opened its circuit and has since recovered
    let upstreams = Arc::new(Upstreams::default());
    upstreams.route("usgs.test", Route::Status(503));
    let orchestrator = quick_recovery(&upstreams);
    orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("FEMA answers");
    assert_eq!(
        orchestrator.get_source_status(&usgs()).expect("registered").circuit.state,
        CircuitState::Open
    );
    upstreams.route("usgs.test", Route::Json(json!({"risk": "low"})));

    // When: The cooldown elapses and another fetch is made
    tokio::time::sleep(Duration::from_millis(80)).await;
    let result = orchestrator
        .fetch(
            &Category::EARTHQUAKE_RISK,
            &quake_query(),
            &FetchOptions::default().skip_cache(),
        )
        .await
        .expect("USGS answers its trial call");

    // Then: USGS gets the trial call, answers, and its circuit closes
    assert_eq!(result.attempted_sources, vec![usgs()]);
    assert_eq!(result.source_used, SourceUsed::Provider(usgs()));
    let circuit = orchestrator.get_source_status(&usgs()).expect("registered").circuit;
    assert_eq!(circuit.state, CircuitState::Closed);
    assert_eq!(circuit.consecutive_failures, 0);
}

#[tokio::test]
async fn when_the_trial_call_fails_the_circuit_opens_again() {
    // Given: USGS opened its circuit and is still failing
    let upstreams = Arc::new(Upstreams::default());
    upstreams.route("usgs.test", Route::Status(503));
    let orchestrator = quick_recovery(&upstreams);
    orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("FEMA answers");

    // When: The cooldown elapses and another fetch is made
    tokio::time::sleep(Duration::from_millis(80)).await;
    let result = orchestrator
        .fetch(
            &Category::EARTHQUAKE_RISK,
            &quake_query(),
            &FetchOptions::default().skip_cache(),
        )
        .await
        .expect("FEMA answers again");

    // Then: USGS was tried once more, failed, and is open again
    assert_eq!(result.attempted_sources, vec![usgs(), fema()]);
    assert_eq!(upstreams.calls("usgs.test"), 2);
    let circuit = orchestrator.get_source_status(&usgs()).expect("registered").circuit;
    assert_eq!(circuit.state, CircuitState::Open);
    assert_eq!(circuit.times_opened, 2);
}

#[tokio::test]
async fn when_every_provider_fails_fetch_returns_all_sources_exhausted() {
    // Given: Both providers are overloaded
    let upstreams = Arc::new(Upstreams::default());
    upstreams.route("usgs.test", Route::Status(503));
    upstreams.route("fema.test", Route::Status(503));
    let orchestrator = usgs_then_fema(&upstreams);

    // When: A fetch is made
    let exhausted = orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect_err("nothing can answer");

    // Then: Every attempt is listed in priority order with its cause
    assert_eq!(exhausted.code(), "source.exhausted");
    assert_eq!(exhausted.attempted_sources, vec![usgs(), fema()]);
    assert_eq!(exhausted.errors.len(), 2);
    assert!(exhausted
        .errors
        .iter()
        .all(|failure| failure.code == "source.transient" && failure.retryable));
    assert_eq!(
        exhausted.last_error.as_ref().map(|failure| failure.provider.clone()),
        Some(fema())
    );
    assert!(exhausted.to_string().contains("earthquake_risk"));
}

#[tokio::test]
async fn when_no_provider_serves_the_category_fetch_is_exhausted_immediately() {
    // Given: Providers that only serve earthquake risk
    let upstreams = Arc::new(Upstreams::default());
    let orchestrator = usgs_then_fema(&upstreams);

    // When: Fire risk is requested
    let exhausted = orchestrator
        .fetch(&Category::FIRE_RISK, &Query::new(), &FetchOptions::default())
        .await
        .expect_err("no candidates");

    // Then: Nothing was attempted and no upstream was called
    assert!(exhausted.attempted_sources.is_empty());
    assert!(exhausted.last_error.is_none());
    assert_eq!(upstreams.calls("usgs.test") + upstreams.calls("fema.test"), 0);
}

// =============================================================================
// Orchestrator: Admission
// =============================================================================

#[tokio::test]
async fn when_a_provider_is_out_of_quota_it_is_skipped_and_the_next_one_answers() {
    // Given: USGS allows a single call per hour
    let upstreams = Arc::new(Upstreams::default());
    let orchestrator = build(
        &upstreams,
        vec![
            provider(
                usgs(),
                "usgs.test",
                1,
                ProviderConfig {
                    rate_limit: RateLimit {
                        capacity: 1,
                        window: Duration::from_secs(3600),
                    },
                    ..ProviderConfig::default()
                },
            ),
            provider(fema(), "fema.test", 2, ProviderConfig::default()),
        ],
    );
    let refresh = FetchOptions::default().skip_cache();
    orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &refresh)
        .await
        .expect("USGS answers");

    // When: A second fetch is made
    let result = orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &refresh)
        .await
        .expect("FEMA answers");

    // Then: USGS was passed over for quota, without a failure on its breaker
    assert_eq!(result.source_used, SourceUsed::Provider(fema()));
    assert_eq!(result.skipped[0].reason, SkipReason::QuotaDenied);
    assert_eq!(upstreams.calls("usgs.test"), 1);
    let status = orchestrator.get_source_status(&usgs()).expect("registered");
    assert_eq!(status.circuit.state, CircuitState::Closed);
    assert_eq!(status.circuit.consecutive_failures, 0);
}

#[tokio::test]
async fn when_a_query_lacks_required_fields_that_provider_is_skipped() {
    // Given: USGS needs a depth field the query does not carry
    let upstreams = Arc::new(Upstreams::default());
    let strict = ProviderRegistration::new(
        usgs(),
        Arc::new(TemplateAdapter::new("https://usgs.test").map_field("depth", "maxdepth")),
    )
    .serving(Category::EARTHQUAKE_RISK)
    .with_config(ProviderConfig {
        priority: 1,
        ..ProviderConfig::default()
    });
    let orchestrator = build(
        &upstreams,
        vec![strict, provider(fema(), "fema.test", 2, ProviderConfig::default())],
    );

    // When: The fetch runs
    let result = orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("FEMA answers");

    // Then: USGS is skipped as an invalid request and never called
    assert_eq!(result.attempted_sources, vec![fema()]);
    assert_eq!(result.skipped[0].reason, SkipReason::InvalidRequest);
    assert_eq!(upstreams.calls("usgs.test"), 0);
}

// =============================================================================
// Orchestrator: Deadlines
// =============================================================================

#[tokio::test]
async fn when_the_deadline_passes_mid_call_no_further_provider_is_tried() {
    // Given: USGS never answers
    let upstreams = Arc::new(Upstreams::default());
    upstreams.route("usgs.test", Route::Hang);
    let orchestrator = usgs_then_fema(&upstreams);

    // When: The caller allows 100ms
    let exhausted = orchestrator
        .fetch(
            &Category::EARTHQUAKE_RISK,
            &quake_query(),
            &FetchOptions::default().with_timeout(Duration::from_millis(100)),
        )
        .await
        .expect_err("deadline passes");

    // Then: The fetch stops at USGS, and the breaker does not count it
    assert_eq!(exhausted.attempted_sources, vec![usgs()]);
    assert_eq!(
        exhausted.last_error.as_ref().map(|failure| failure.code),
        Some("source.deadline_exceeded")
    );
    assert_eq!(upstreams.calls("fema.test"), 0);
    let status = orchestrator.get_source_status(&usgs()).expect("registered");
    assert_eq!(status.circuit.state, CircuitState::Closed);
}

#[tokio::test]
async fn when_a_fetch_stops_at_its_deadline_the_quota_slot_is_returned() {
    // Given: A single provider that never answers
    let upstreams = Arc::new(Upstreams::default());
    upstreams.route("usgs.test", Route::Hang);
    let orchestrator = build(
        &upstreams,
        vec![provider(usgs(), "usgs.test", 1, ProviderConfig::default())],
    );

    // When: The fetch gives up after 50ms
    orchestrator
        .fetch(
            &Category::EARTHQUAKE_RISK,
            &quake_query(),
            &FetchOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .expect_err("deadline passes");

    // Then: No concurrency slot is left behind
    let quota = orchestrator.quota().snapshot(&usgs()).expect("registered");
    assert_eq!(quota.active_requests, 0);
}

#[tokio::test]
async fn when_an_in_flight_fetch_is_dropped_its_reservations_are_returned() {
    // Given: A fetch parked on a provider that never answers
    let upstreams = Arc::new(Upstreams::default());
    upstreams.route("usgs.test", Route::Hang);
    let orchestrator = build(
        &upstreams,
        vec![provider(usgs(), "usgs.test", 1, ProviderConfig::default())],
    );
    let query = quake_query();
    let options = FetchOptions::default();
    let mut fetch = Box::pin(orchestrator.fetch(&Category::EARTHQUAKE_RISK, &query, &options));
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut fetch)
        .await
        .is_err());
    assert_eq!(
        orchestrator.quota().snapshot(&usgs()).expect("registered").active_requests,
        1
    );

    // When: The caller abandons it
    drop(fetch);

    // Then: The slot is free and the breaker holds no failure against USGS
    assert_eq!(
        orchestrator.quota().snapshot(&usgs()).expect("registered").active_requests,
        0
    );
    let circuit = orchestrator.get_source_status(&usgs()).expect("registered").circuit;
    assert_eq!(circuit.state, CircuitState::Closed);
    assert_eq!(circuit.consecutive_failures, 0);
}

// =============================================================================
// Orchestrator: Cache Lifetimes
// =============================================================================

#[tokio::test]
async fn when_a_category_ttl_is_enormous_results_are_still_cached() {
    // Given: Earthquake results configured to live for centuries
    let upstreams = Arc::new(Upstreams::default());
    let orchestrator = builder(
        &upstreams,
        vec![provider(
            usgs(),
            "usgs.test",
            1,
            ProviderConfig {
                cost_per_call: 1.0,
                ..ProviderConfig::default()
            },
        )],
    )
    .cache_ttl(
        CacheTtlTable::default()
            .with_category(Category::EARTHQUAKE_RISK, Duration::from_secs(u64::MAX / 4))
            .with_premium(0.01, f64::INFINITY),
    )
    .build()
    .expect("valid orchestrator");

    // When: The same query is fetched twice
    let first = orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("USGS answers");
    let second = orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("cache answers");

    // Then: The first result was stored and served back
    assert!(!first.cache_hit());
    assert!(second.cache_hit());
    assert_eq!(upstreams.calls("usgs.test"), 1);
}

// =============================================================================
// Orchestrator: Operator Controls
// =============================================================================

#[tokio::test]
async fn when_a_breaker_is_reset_the_provider_is_tried_again() {
    // Given: USGS opened its circuit and then recovered
    let upstreams = Arc::new(Upstreams::default());
    upstreams.route("usgs.test", Route::Status(502));
    let orchestrator = usgs_then_fema(&upstreams);
    orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("FEMA answers");
    upstreams.route("usgs.test", Route::Json(json!({"risk": "low"})));

    // When: An operator resets the breaker
    let reset = orchestrator.reset_circuit_breaker(&usgs()).expect("registered");

    // Then: USGS serves the next fetch
    assert!(reset);
    let result = orchestrator
        .fetch(
            &Category::EARTHQUAKE_RISK,
            &quake_query(),
            &FetchOptions::default().skip_cache(),
        )
        .await
        .expect("USGS answers");
    assert_eq!(result.source_used, SourceUsed::Provider(usgs()));
}

#[tokio::test]
async fn when_a_closed_breaker_is_reset_nothing_changes() {
    // Given: A healthy orchestrator
    let upstreams = Arc::new(Upstreams::default());
    let orchestrator = usgs_then_fema(&upstreams);

    // When/Then: Resetting a closed breaker is a no-op, unknown ids are errors
    assert!(!orchestrator.reset_circuit_breaker(&usgs()).expect("registered"));
    assert!(orchestrator
        .reset_circuit_breaker(&ProviderId::from_static("NOAA"))
        .is_err());
}

#[tokio::test]
async fn when_a_provider_is_disabled_it_drops_out_of_routing() {
    // Given: Both providers are healthy
    let upstreams = Arc::new(Upstreams::default());
    let orchestrator = usgs_then_fema(&upstreams);

    // When: USGS is disabled
    orchestrator
        .set_source_enabled(&usgs(), false)
        .expect("registered");

    // Then: FEMA answers and the status reflects the change
    let result = orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("FEMA answers");
    assert_eq!(result.attempted_sources, vec![fema()]);
    assert!(result.skipped.is_empty());
    assert!(!orchestrator.get_source_status(&usgs()).expect("registered").enabled);
}

#[tokio::test]
async fn when_a_category_is_invalidated_the_next_fetch_goes_upstream() {
    // Given: A cached earthquake payload
    let upstreams = Arc::new(Upstreams::default());
    let orchestrator = usgs_then_fema(&upstreams);
    orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("USGS answers");

    // When: The category is invalidated
    let removed = orchestrator.invalidate_category(&Category::EARTHQUAKE_RISK).await;

    // Then: The entry is gone and the provider is called again
    assert_eq!(removed, 1);
    let result = orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("USGS answers");
    assert!(!result.cache_hit());
    assert_eq!(upstreams.calls("usgs.test"), 2);
}

#[tokio::test]
async fn when_a_fetch_completes_subscribers_are_told() {
    // Given: An event subscriber
    let upstreams = Arc::new(Upstreams::default());
    let orchestrator = usgs_then_fema(&upstreams);
    let mut events = orchestrator.subscribe();

    // When: A fetch succeeds
    let result = orchestrator
        .fetch(&Category::EARTHQUAKE_RISK, &quake_query(), &FetchOptions::default())
        .await
        .expect("USGS answers");

    // Then: A completion event names the provider and request
    let mut completed = None;
    while let Ok(event) = events.try_recv() {
        if let OrchestratorEvent::FetchCompleted { request_id, source, .. } = event {
            completed = Some((request_id, source));
        }
    }
    assert_eq!(completed, Some((result.request_id, String::from("USGS"))));
}
