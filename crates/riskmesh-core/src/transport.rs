//! Network transport: one logical request, classified retries, hard timeout.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::events::{EventBus, OrchestratorEvent};
use crate::http_client::{HttpClient, HttpError, HttpRequest, HttpResponse};
use crate::retry::Backoff;
use crate::ProviderId;

/// Sends requests through an [`HttpClient`], retrying transient failures.
///
/// Each attempt is bounded by the request timeout. When it elapses the
/// in-flight future is dropped, which aborts the underlying call. Dropping the
/// future returned by [`Transport::send`] cancels the whole exchange, including
/// any pending backoff sleep.
#[derive(Clone)]
pub struct Transport {
    client: Arc<dyn HttpClient>,
    backoff: Backoff,
    events: EventBus,
}

impl Transport {
    pub fn new(client: Arc<dyn HttpClient>, backoff: Backoff, events: EventBus) -> Self {
        Self {
            client,
            backoff,
            events,
        }
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Send with up to `retry_budget` retries after the first attempt. Any
    /// non-2xx status is a failure.
    pub async fn send(
        &self,
        provider: &ProviderId,
        request: HttpRequest,
        retry_budget: u32,
    ) -> Result<HttpResponse, HttpError> {
        self.exchange(provider, request, retry_budget, &[]).await
    }

    /// Like [`Transport::send`], but any status in `accepted` counts as a success.
    /// An empty list accepts 2xx only.
    pub async fn send_expecting(
        &self,
        provider: &ProviderId,
        request: HttpRequest,
        retry_budget: u32,
        accepted: &[u16],
    ) -> Result<HttpResponse, HttpError> {
        self.exchange(provider, request, retry_budget, accepted).await
    }

    async fn exchange(
        &self,
        provider: &ProviderId,
        request: HttpRequest,
        retry_budget: u32,
        accepted: &[u16],
    ) -> Result<HttpResponse, HttpError> {
        let max_attempts = retry_budget.saturating_add(1);
        let mut attempt = 0_u32;

        loop {
            attempt += 1;
            self.events.publish(OrchestratorEvent::TransportAttemptStarted {
                provider: provider.clone(),
                attempt,
                url: request.url.clone(),
            });

            let (error, retry_after) = match self.attempt(request.clone()).await {
                Ok(response) if is_accepted(response.status, accepted) => {
                    debug!(provider = %provider, attempt, status = response.status, "transport call succeeded");
                    self.events.publish(OrchestratorEvent::TransportSucceeded {
                        provider: provider.clone(),
                        attempts: attempt,
                        status: response.status,
                    });
                    return Ok(response);
                }
                Ok(response) => {
                    let retry_after = match response.status {
                        429 | 503 => response.retry_after(),
                        _ => None,
                    };
                    let error = HttpError::status(response.status, truncate(&response.body, 200));
                    (error, retry_after)
                }
                Err(error) => (error, None),
            };

            if !error.is_transient() || attempt >= max_attempts {
                warn!(provider = %provider, attempts = attempt, error = %error, "transport call failed");
                self.events.publish(OrchestratorEvent::TransportExhausted {
                    provider: provider.clone(),
                    attempts: attempt,
                    error: error.to_string(),
                });
                return Err(error);
            }

            let delay = self.retry_delay(attempt - 1, retry_after);
            debug!(
                provider = %provider,
                attempt,
                delay_ms = duration_ms(delay),
                error = %error,
                "retrying transient transport failure"
            );
            self.events.publish(OrchestratorEvent::TransportRetrying {
                provider: provider.clone(),
                attempt,
                delay_ms: duration_ms(delay),
                error: error.to_string(),
            });
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let timeout = request.timeout;
        match tokio::time::timeout(timeout, self.client.execute(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HttpError::timeout(format!(
                "request exceeded {}ms timeout",
                duration_ms(timeout)
            ))),
        }
    }

    fn retry_delay(&self, retry_index: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) if hint <= self.backoff.cap() => hint,
            _ => self.backoff.delay(retry_index),
        }
    }
}

fn is_accepted(status: u16, accepted: &[u16]) -> bool {
    if accepted.is_empty() {
        (200..300).contains(&status)
    } else {
        accepted.contains(&status)
    }
}

fn truncate(body: &str, max: usize) -> String {
    match body.char_indices().nth(max) {
        Some((index, _)) => format!("{}...", &body[..index]),
        None => body.to_owned(),
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    struct Scripted {
        outcomes: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(outcomes: Vec<Result<HttpResponse, HttpError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().expect("calls lock")
        }
    }

    impl HttpClient for Scripted {
        fn execute<'a>(
            &'a self,
            _request: HttpRequest,
        ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
            *self.calls.lock().expect("calls lock") += 1;
            let next = self
                .outcomes
                .lock()
                .expect("outcomes lock")
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::ok_json("{}")));
            Box::pin(async move { next })
        }
    }

    fn transport(client: Arc<Scripted>) -> Transport {
        Transport::new(
            client,
            Backoff::Fixed {
                delay: Duration::from_millis(1),
            },
            EventBus::new(16),
        )
    }

    fn usgs() -> ProviderId {
        ProviderId::from_static("USGS")
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let client = Scripted::new(vec![
            Err(HttpError::connection("reset")),
            Ok(HttpResponse::new(503, "busy")),
            Ok(HttpResponse::ok_json("{\"ok\":true}")),
        ]);

        let response = transport(Arc::clone(&client))
            .send(&usgs(), HttpRequest::get("https://usgs.test"), 3)
            .await
            .expect("third attempt succeeds");

        assert_eq!(response.body, "{\"ok\":true}");
        assert_eq!(client.calls(), 3);
    }

    #[tokio::test]
    async fn never_retries_permanent_statuses() {
        let client = Scripted::new(vec![Ok(HttpResponse::new(404, "missing"))]);

        let error = transport(Arc::clone(&client))
            .send(&usgs(), HttpRequest::get("https://usgs.test"), 5)
            .await
            .expect_err("404 is permanent");

        assert_eq!(error.status_code(), Some(404));
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn stops_after_the_retry_budget() {
        let client = Scripted::new(vec![
            Ok(HttpResponse::new(500, "a")),
            Ok(HttpResponse::new(500, "b")),
            Ok(HttpResponse::new(500, "c")),
        ]);

        let error = transport(Arc::clone(&client))
            .send(&usgs(), HttpRequest::get("https://usgs.test"), 1)
            .await
            .expect_err("budget exhausted");

        assert!(error.is_transient());
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn accepted_statuses_override_the_2xx_rule() {
        let client = Scripted::new(vec![Ok(HttpResponse::new(401, "auth required"))]);

        let response = transport(client)
            .send_expecting(&usgs(), HttpRequest::get("https://usgs.test"), 0, &[200, 401])
            .await
            .expect("401 accepted");

        assert_eq!(response.status, 401);
    }

    #[test]
    fn retry_after_is_honoured_only_within_the_cap() {
        let transport = Transport::new(
            Scripted::new(Vec::new()),
            Backoff::Exponential {
                base: Duration::from_millis(100),
                factor: 2.0,
                max: Duration::from_secs(2),
                jitter: false,
            },
            EventBus::new(1),
        );

        assert_eq!(
            transport.retry_delay(0, Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        assert_eq!(
            transport.retry_delay(0, Some(Duration::from_secs(30))),
            Duration::from_millis(100)
        );
    }
}
