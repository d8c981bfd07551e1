//! Retry handling for calls to identity provider endpoints

use std::time::{Duration, SystemTime};

use authkeep_clock::{Clock, UnixTime};
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{AcquireError, ClientErrorKind, ServiceError},
    network::{HttpRequest, HttpResponse, NetworkClient, NetworkError},
};

/// The server errors treated as transient by the provided policies
pub const TRANSIENT_SERVER_ERRORS: [u16; 4] = [500, 502, 503, 504];

/// The longest `Retry-After` a policy waits out unless configured otherwise
pub const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

/// What to do after a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once the delay has passed
    RetryAfter(Duration),
    /// Try again now
    RetryImmediately,
    /// Give up
    DoNotRetry,
}

impl RetryDecision {
    fn after(delay: Duration) -> Self {
        if delay.is_zero() {
            RetryDecision::RetryImmediately
        } else {
            RetryDecision::RetryAfter(delay)
        }
    }
}

/// How often and how patiently to retry a call
///
/// Request timeouts (408) and the configured transient server errors are
/// retried after a fixed delay, as are transport failures. A `Retry-After`
/// header on any unsuccessful response replaces that delay and makes the
/// response retryable, unless it asks for a longer wait than
/// `max_retry_after`; such a response ends the attempts. No call is ever
/// attempted more than `max_retries + 1` times.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    max_retries: u32,
    #[serde(rename = "delay_ms", with = "millis")]
    delay: Duration,
    retryable_statuses: Vec<u16>,
    #[serde(
        rename = "max_retry_after_ms",
        with = "millis",
        default = "default_max_retry_after"
    )]
    max_retry_after: Duration,
}

fn default_max_retry_after() -> Duration {
    DEFAULT_MAX_RETRY_AFTER
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

impl Default for RetryPolicy {
    /// The token endpoint policy
    fn default() -> Self {
        Self::token_endpoint()
    }
}

impl RetryPolicy {
    /// Constructs a new policy
    pub fn new(max_retries: u32, delay: Duration, retryable_statuses: Vec<u16>) -> Self {
        Self {
            max_retries,
            delay,
            retryable_statuses,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }

    /// The policy for token endpoint calls: one retry after one second
    pub fn token_endpoint() -> Self {
        Self::new(1, Duration::from_secs(1), TRANSIENT_SERVER_ERRORS.to_vec())
    }

    /// The policy for managed identity endpoints: three retries, one second
    /// apart
    pub fn managed_identity() -> Self {
        Self::new(3, Duration::from_secs(1), TRANSIENT_SERVER_ERRORS.to_vec())
    }

    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Vec::new())
    }

    /// Sets the maximum number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the delay between attempts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Sets the longest `Retry-After` that is waited out
    pub fn with_max_retry_after(mut self, max_retry_after: Duration) -> Self {
        self.max_retry_after = max_retry_after;
        self
    }

    /// The maximum number of retries
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a response with `status` is retried on the policy's own
    /// schedule
    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        status == StatusCode::REQUEST_TIMEOUT || self.retryable_statuses.contains(&status.as_u16())
    }

    /// Decides whether to retry after an attempt
    ///
    /// `status` is `None` when the attempt failed before a response arrived.
    /// `retries` counts the retries already made.
    pub fn decide(
        &self,
        status: Option<StatusCode>,
        headers: &HeaderMap,
        retries: u32,
        now: UnixTime,
    ) -> RetryDecision {
        if retries >= self.max_retries {
            return RetryDecision::DoNotRetry;
        }

        match status {
            Some(status) if status.is_success() => RetryDecision::DoNotRetry,
            Some(status) => {
                if let Some(delay) = retry_after(headers, now) {
                    if delay > self.max_retry_after {
                        tracing::debug!(
                            retry_after_secs = delay.as_secs(),
                            "server asked for a longer wait than allowed"
                        );
                        RetryDecision::DoNotRetry
                    } else {
                        RetryDecision::after(delay)
                    }
                } else if self.is_retryable_status(status) {
                    RetryDecision::after(self.delay)
                } else {
                    RetryDecision::DoNotRetry
                }
            }
            None => RetryDecision::after(self.delay),
        }
    }
}

/// Parses a `Retry-After` header given as delta-seconds or an HTTP date
pub fn retry_after(headers: &HeaderMap, now: UnixTime) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at: SystemTime = httpdate::parse_http_date(value).ok()?;
    Some(UnixTime::from(at).duration_since(now).into())
}

/// Sends a request, retrying as `policy` allows
///
/// Successful responses and unsuccessful ones the policy does not retry are
/// returned for the caller to interpret. Exhausting retries on a transient
/// status or on transport failures yields a retryable [`ServiceError`].
#[tracing::instrument(
    err,
    skip(network, request, policy, clock, cancel),
    fields(url = %request.url, max_retries = policy.max_retries),
)]
pub async fn send_with_retry<C: Clock + ?Sized>(
    network: &dyn NetworkClient,
    request: HttpRequest,
    policy: &RetryPolicy,
    clock: &C,
    cancel: &CancellationToken,
) -> Result<HttpResponse, AcquireError> {
    let no_headers = HeaderMap::new();
    let mut retries = 0;

    loop {
        let outcome = match network.send(request.clone(), cancel).await {
            Ok(resp) => Ok(resp),
            Err(NetworkError::Cancelled) => return Err(AcquireError::Cancelled),
            Err(NetworkError::InvalidRequest(source)) => {
                return Err(AcquireError::client_with_source(
                    ClientErrorKind::InvalidRequest,
                    source,
                ))
            }
            Err(err @ NetworkError::Transport(_)) => Err(err),
        };

        let (status, headers) = match &outcome {
            Ok(resp) => (Some(resp.status), &resp.headers),
            Err(_) => (None, &no_headers),
        };

        let delay = match policy.decide(status, headers, retries, clock.now()) {
            RetryDecision::DoNotRetry => return finish(policy, outcome),
            RetryDecision::RetryImmediately => Duration::ZERO,
            RetryDecision::RetryAfter(delay) => delay,
        };

        retries += 1;
        tracing::debug!(
            retry = retries,
            status = status.map(|s| s.as_u16()),
            delay_ms = delay.as_millis() as u64,
            "retrying request"
        );

        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn finish(
    policy: &RetryPolicy,
    outcome: Result<HttpResponse, NetworkError>,
) -> Result<HttpResponse, AcquireError> {
    match outcome {
        Ok(resp) if !resp.status.is_success() && policy.is_retryable_status(resp.status) => {
            let code = if resp.status == StatusCode::REQUEST_TIMEOUT {
                "request_timeout"
            } else {
                "service_not_available"
            };
            tracing::warn!(status = resp.status.as_u16(), code, "retries exhausted");
            Err(ServiceError::new(code, true)
                .with_status(resp.status.as_u16())
                .into())
        }
        Ok(resp) => Ok(resp),
        Err(err) => {
            tracing::warn!(error = %err, "retries exhausted after transport failures");
            Err(ServiceError::new("network_error", true)
                .with_description(err.to_string())
                .into())
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{test_support::*, *};
    use authkeep_clock::System;

    fn request() -> HttpRequest {
        HttpRequest::post_form("https://login.example.com/t/token".parse().unwrap(), String::new())
    }

    fn with_retry_after(mut resp: HttpResponse, value: &str) -> HttpResponse {
        resp.headers
            .insert(http::header::RETRY_AFTER, value.parse().unwrap());
        resp
    }

    mod decide {
        use super::*;

        fn status(code: u16) -> Option<StatusCode> {
            Some(StatusCode::from_u16(code).unwrap())
        }

        #[test]
        fn transient_server_errors_are_retried_once() {
            let policy = RetryPolicy::token_endpoint();
            let h = HeaderMap::new();
            assert_eq!(
                policy.decide(status(503), &h, 0, UnixTime(0)),
                RetryDecision::RetryAfter(Duration::from_secs(1))
            );
            assert_eq!(
                policy.decide(status(503), &h, 1, UnixTime(0)),
                RetryDecision::DoNotRetry
            );
        }

        #[test]
        fn request_timeout_is_retried() {
            let policy = RetryPolicy::managed_identity();
            assert_eq!(
                policy.decide(status(408), &HeaderMap::new(), 2, UnixTime(0)),
                RetryDecision::RetryAfter(Duration::from_secs(1))
            );
        }

        #[test]
        fn other_client_errors_are_not_retried() {
            let policy = RetryPolicy::managed_identity();
            assert_eq!(
                policy.decide(status(400), &HeaderMap::new(), 0, UnixTime(0)),
                RetryDecision::DoNotRetry
            );
            assert_eq!(
                policy.decide(status(501), &HeaderMap::new(), 0, UnixTime(0)),
                RetryDecision::DoNotRetry
            );
        }

        #[test]
        fn retry_after_seconds_wins() {
            let policy = RetryPolicy::token_endpoint();
            let mut h = HeaderMap::new();
            h.insert(http::header::RETRY_AFTER, "7".parse().unwrap());
            assert_eq!(
                policy.decide(status(429), &h, 0, UnixTime(0)),
                RetryDecision::RetryAfter(Duration::from_secs(7))
            );
        }

        #[test]
        fn retry_after_http_date_wins() {
            let policy = RetryPolicy::token_endpoint();
            let now = UnixTime(1_445_412_480);
            let mut h = HeaderMap::new();
            h.insert(
                http::header::RETRY_AFTER,
                "Wed, 21 Oct 2015 07:28:30 GMT".parse().unwrap(),
            );
            assert_eq!(
                policy.decide(status(503), &h, 0, now),
                RetryDecision::RetryAfter(Duration::from_secs(30))
            );
        }

        #[test]
        fn retry_after_in_the_past_retries_immediately() {
            let policy = RetryPolicy::token_endpoint();
            let mut h = HeaderMap::new();
            h.insert(
                http::header::RETRY_AFTER,
                "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap(),
            );
            assert_eq!(
                policy.decide(status(503), &h, 0, UnixTime(1_445_412_500)),
                RetryDecision::RetryImmediately
            );
        }

        #[test]
        fn retry_after_is_still_bounded() {
            let policy = RetryPolicy::token_endpoint();
            let mut h = HeaderMap::new();
            h.insert(http::header::RETRY_AFTER, "1".parse().unwrap());
            assert_eq!(
                policy.decide(status(503), &h, 1, UnixTime(0)),
                RetryDecision::DoNotRetry
            );
        }

        #[test]
        fn overlong_retry_after_gives_up() {
            let policy = RetryPolicy::token_endpoint();
            let mut h = HeaderMap::new();
            h.insert(http::header::RETRY_AFTER, "7200".parse().unwrap());
            assert_eq!(
                policy.decide(status(503), &h, 0, UnixTime(0)),
                RetryDecision::DoNotRetry
            );

            let patient = policy.with_max_retry_after(Duration::from_secs(3 * 3600));
            assert_eq!(
                patient.decide(status(503), &h, 0, UnixTime(0)),
                RetryDecision::RetryAfter(Duration::from_secs(7200))
            );
        }

        #[test]
        fn zero_delay_means_immediately() {
            let policy = RetryPolicy::token_endpoint().with_delay(Duration::ZERO);
            assert_eq!(
                policy.decide(None, &HeaderMap::new(), 0, UnixTime(0)),
                RetryDecision::RetryImmediately
            );
        }
    }

    mod send {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn recovers_after_one_transient_failure() {
            let network = ScriptedNetwork::new([Some(response(503, "")), Some(response(200, "{}"))]);
            let resp = send_with_retry(
                &network,
                request(),
                &RetryPolicy::token_endpoint(),
                &System,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

            assert_eq!(resp.status, StatusCode::OK);
            assert_eq!(network.calls(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn exhaustion_is_a_retryable_service_error() {
            let network = ScriptedNetwork::new([Some(response(504, "")), Some(response(504, ""))]);
            let err = send_with_retry(
                &network,
                request(),
                &RetryPolicy::token_endpoint(),
                &System,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

            let service = err.service_error().unwrap();
            assert_eq!(service.code, "service_not_available");
            assert_eq!(service.status, Some(504));
            assert!(service.retryable);
            assert_eq!(network.calls(), 2);
        }

        #[tokio::test(start_paused = true)]
        async fn repeated_timeouts_report_request_timeout() {
            let network = ScriptedNetwork::new([Some(response(408, "")), Some(response(408, ""))]);
            let err = send_with_retry(
                &network,
                request(),
                &RetryPolicy::token_endpoint(),
                &System,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
            assert_eq!(err.service_error().unwrap().code, "request_timeout");
        }

        #[tokio::test(start_paused = true)]
        async fn transport_failures_become_network_errors() {
            let network = ScriptedNetwork::new([None, None]);
            let err = send_with_retry(
                &network,
                request(),
                &RetryPolicy::token_endpoint(),
                &System,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
            assert_eq!(err.service_error().unwrap().code, "network_error");
            assert!(err.is_retryable());
        }

        #[tokio::test(start_paused = true)]
        async fn rejected_requests_are_returned_for_interpretation() {
            let network = ScriptedNetwork::new([Some(response(400, r#"{"error":"invalid_grant"}"#))]);
            let resp = send_with_retry(
                &network,
                request(),
                &RetryPolicy::managed_identity(),
                &System,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            assert_eq!(resp.status, StatusCode::BAD_REQUEST);
            assert_eq!(network.calls(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn retry_after_makes_throttling_retryable() {
            let network = ScriptedNetwork::new([
                Some(with_retry_after(response(429, ""), "2")),
                Some(response(200, "{}")),
            ]);
            let resp = send_with_retry(
                &network,
                request(),
                &RetryPolicy::token_endpoint(),
                &System,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
            assert_eq!(resp.status, StatusCode::OK);
        }

        #[tokio::test(start_paused = true)]
        async fn overlong_retry_after_fails_fast_as_retryable() {
            let network = ScriptedNetwork::new([Some(with_retry_after(response(503, ""), "86400"))]);
            let err = send_with_retry(
                &network,
                request(),
                &RetryPolicy::token_endpoint(),
                &System,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

            let service = err.service_error().unwrap();
            assert_eq!(service.code, "service_not_available");
            assert!(service.retryable);
            assert_eq!(network.calls(), 1);
        }

        #[tokio::test(start_paused = true)]
        async fn cancellation_interrupts_the_delay() {
            let network = ScriptedNetwork::new([Some(response(503, ""))]);
            let cancel = CancellationToken::new();
            cancel.cancel();

            let err = send_with_retry(
                &network,
                request(),
                &RetryPolicy::token_endpoint(),
                &System,
                &cancel,
            )
            .await
            .unwrap_err();
            assert!(matches!(err, AcquireError::Cancelled));
            assert_eq!(network.calls(), 1);
        }
    }
}
