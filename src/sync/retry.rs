//! Retry/backoff wrapper around a single HTTP call.
//!
//! Policy: 429 retries on a fixed delay (raised to the server's Retry-After
//! when larger); a 401 with a known-expired token triggers exactly one
//! refresh through the auth collaborator; everything else non-2xx and
//! connection errors back off exponentially. All branches are bounded by
//! `max_retries` in a plain loop with an attempt counter.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Response;
use tracing::{debug, warn};

use crate::sync::error::{truncate_for_log, SyncError};

pub const MAX_RETRIES: u32 = 3;
const LOG_BODY_MAX: usize = 400;

/// Token lifecycle as seen by the retry wrapper. Implementations persist
/// tokens wherever they like; refresh failures are non-retryable.
#[async_trait]
pub trait AuthSession: Send + Sync {
    async fn access_token(&self) -> Result<Option<String>, SyncError>;
    async fn is_token_expired(&self) -> bool;
    async fn refresh_token(&self) -> Result<(), SyncError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub rate_limit_delay: Duration,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            rate_limit_delay: Duration::from_millis(1000),
            backoff_base: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Near-zero delays for tests.
    #[cfg(test)]
    pub fn fast() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            rate_limit_delay: Duration::from_millis(1),
            backoff_base: Duration::from_millis(1),
        }
    }

    /// Drive `send` to a successful response. `send` must build a fresh
    /// request each call (so a refreshed token is picked up) and map
    /// connection errors into `SyncError` via `From<reqwest::Error>`.
    pub async fn execute<F, Fut>(
        &self,
        label: &str,
        auth: Option<&dyn AuthSession>,
        send: F,
    ) -> Result<Response, SyncError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Response, SyncError>>,
    {
        let mut attempt: u32 = 0;
        let mut refreshed = false;
        loop {
            attempt += 1;
            let resp = match send().await {
                Ok(r) => r,
                Err(e) if e.is_retryable() => {
                    if attempt > self.max_retries {
                        warn!(label, attempts = attempt, error = %e, "retries exhausted on network error");
                        return Err(e);
                    }
                    let delay = self.backoff_base.saturating_mul(attempt);
                    debug!(label, attempt, delay_ms = delay.as_millis() as u64, error = %e, "network error; backing off");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            match status.as_u16() {
                429 => {
                    if attempt > self.max_retries {
                        warn!(label, attempts = attempt, "rate limit retries exhausted");
                        return Err(SyncError::RateLimited { attempts: attempt });
                    }
                    let mut delay = self.rate_limit_delay;
                    if let Some(ra) = resp
                        .headers()
                        .get("Retry-After")
                        .and_then(|h| h.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                    {
                        delay = delay.max(Duration::from_secs(ra));
                    }
                    warn!(label, attempt, delay_ms = delay.as_millis() as u64, "throttled; sleeping before retry");
                    tokio::time::sleep(delay).await;
                }
                401 => {
                    if let Some(a) = auth {
                        if !refreshed && a.is_token_expired().await {
                            debug!(label, "401 with expired token; refreshing once");
                            a.refresh_token().await.map_err(|e| {
                                SyncError::Auth(format!("token refresh failed: {e}"))
                            })?;
                            refreshed = true;
                            continue;
                        }
                    }
                    let body = truncate_for_log(resp.text().await.unwrap_or_default(), LOG_BODY_MAX);
                    return Err(SyncError::Auth(format!("{label}: 401 {body}")));
                }
                _ => {
                    if attempt > self.max_retries {
                        let body =
                            truncate_for_log(resp.text().await.unwrap_or_default(), LOG_BODY_MAX);
                        warn!(label, attempts = attempt, status = status.as_u16(), body = %body, "retries exhausted");
                        return Err(SyncError::Http {
                            status: status.as_u16(),
                            body,
                        });
                    }
                    let delay = self.backoff_base.saturating_mul(attempt);
                    debug!(label, attempt, status = status.as_u16(), delay_ms = delay.as_millis() as u64, "backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FakeAuth {
        expired: bool,
        refreshes: AtomicU32,
        fail_refresh: bool,
    }

    #[async_trait]
    impl AuthSession for FakeAuth {
        async fn access_token(&self) -> Result<Option<String>, SyncError> {
            Ok(Some("tok".into()))
        }
        async fn is_token_expired(&self) -> bool {
            self.expired
        }
        async fn refresh_token(&self) -> Result<(), SyncError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.fail_refresh {
                Err(SyncError::Auth("refresh rejected".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn three_throttles_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/things"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(3)
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/things"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = format!("{}/things", server.uri());
        let policy = RetryPolicy {
            rate_limit_delay: Duration::from_millis(10),
            ..RetryPolicy::fast()
        };
        let started = Instant::now();
        let resp = policy
            .execute("things", None, || async {
                Ok(client.get(&url).send().await?)
            })
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        // 3 retries at a fixed 10ms delay each.
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = server.uri();
        let err = RetryPolicy::fast()
            .execute("always-429", None, || async {
                Ok(client.get(&url).send().await?)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RateLimited { attempts: 4 }));
    }

    #[tokio::test]
    async fn expired_token_refreshes_exactly_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let auth = FakeAuth {
            expired: true,
            refreshes: AtomicU32::new(0),
            fail_refresh: false,
        };
        let client = reqwest::Client::new();
        let url = server.uri();
        let resp = RetryPolicy::fast()
            .execute("auth", Some(&auth), || async {
                Ok(client.get(&url).send().await?)
            })
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_401_after_refresh_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth = FakeAuth {
            expired: true,
            refreshes: AtomicU32::new(0),
            fail_refresh: false,
        };
        let client = reqwest::Client::new();
        let url = server.uri();
        let err = RetryPolicy::fast()
            .execute("auth", Some(&auth), || async {
                Ok(client.get(&url).send().await?)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_failure_is_non_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let auth = FakeAuth {
            expired: true,
            refreshes: AtomicU32::new(0),
            fail_refresh: true,
        };
        let client = reqwest::Client::new();
        let url = server.uri();
        let err = RetryPolicy::fast()
            .execute("auth", Some(&auth), || async {
                Ok(client.get(&url).send().await?)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Auth(_)));
        assert_eq!(auth.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_back_off_and_surface_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("kaboom"))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let url = server.uri();
        let err = RetryPolicy::fast()
            .execute("flaky", None, || async {
                Ok(client.get(&url).send().await?)
            })
            .await
            .unwrap_err();
        match err {
            SyncError::Http { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "kaboom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
