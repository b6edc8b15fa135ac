//! HTTP check client
//!
//! Executes one check end to end and feeds token health back into the pool.
//! Never returns an error for remote-side failures; see the crate docs.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use check_core::{CheckResult, Checker, Failure, FailureClass, MIN_CODE_LEN, Outcome};
use chrono::{DateTime, Utc};
use reqwest::Url;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use token_pool::TokenPool;
use tracing::{debug, info, warn};

use crate::classifier::classify;
use crate::constants::{
    CREDENTIAL_TEST_CODE, CREDENTIAL_TEST_CONNECT_TIMEOUT_SECS, CREDENTIAL_TEST_READ_TIMEOUT_SECS,
    DEFAULT_ENDPOINT, DEFAULT_LANGUAGE, DEFAULT_MARKET,
};
use crate::error::{Error, Result};
use crate::headers::BrowserIdentity;
use crate::spacer::{MIN_INTERVAL, RequestSpacer};

/// Client settings, deserialized from the `[client]` config table.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_market")]
    pub market: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_inter_request_delay")]
    pub inter_request_delay_secs: f64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// How long a token sits out after a 429.
    #[serde(default = "default_rate_limit_cooldown")]
    pub rate_limit_cooldown_secs: u64,
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_market() -> String {
    DEFAULT_MARKET.to_string()
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_inter_request_delay() -> f64 {
    1.0
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    30
}

fn default_rate_limit_cooldown() -> u64 {
    token_pool::DEFAULT_RATE_LIMIT_COOLDOWN.as_secs()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            market: default_market(),
            language: default_language(),
            inter_request_delay_secs: default_inter_request_delay(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            rate_limit_cooldown_secs: default_rate_limit_cooldown(),
        }
    }
}

impl ClientConfig {
    /// Reject settings that can only be programmer or operator mistakes.
    pub fn validate(&self) -> Result<Url> {
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(Error::Config(format!(
                "endpoint must start with http:// or https://, got: {}",
                self.endpoint
            )));
        }
        let url = Url::parse(&self.endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint {}: {e}", self.endpoint)))?;
        if url.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "endpoint cannot take a path segment: {}",
                self.endpoint
            )));
        }
        if !self.inter_request_delay_secs.is_finite()
            || self.inter_request_delay_secs < MIN_INTERVAL.as_secs_f64()
        {
            return Err(Error::Config(format!(
                "inter_request_delay_secs must be at least {}, got: {}",
                MIN_INTERVAL.as_secs_f64(),
                self.inter_request_delay_secs
            )));
        }
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(Error::Config(
                "connect_timeout_secs and read_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(url)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}

/// A token named by id and preview, never by its value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestedCredential {
    pub id: u64,
    pub preview: String,
    /// Set when the test could not tell whether the token is valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of `CheckClient::test_credentials`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CredentialTestReport {
    pub valid: Vec<TestedCredential>,
    pub invalid: Vec<TestedCredential>,
    pub errors: Vec<TestedCredential>,
}

/// Checks codes against the remote endpoint using tokens from a shared pool.
pub struct CheckClient {
    http: reqwest::Client,
    /// Total budget of one credential test request.
    test_timeout: Duration,
    endpoint: Url,
    market: String,
    language: String,
    rate_limit_cooldown: Duration,
    pool: Arc<TokenPool>,
    identity: BrowserIdentity,
    spacer: RequestSpacer,
}

impl CheckClient {
    pub fn new(config: &ClientConfig, pool: Arc<TokenPool>) -> Result<Self> {
        let endpoint = config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .timeout(Duration::from_secs(
                config.connect_timeout_secs + config.read_timeout_secs,
            ))
            .build()?;
        let identity = BrowserIdentity::new();
        info!(
            endpoint = %endpoint,
            delay_secs = config.inter_request_delay_secs,
            user_agent = identity.user_agent(),
            "check client initialized"
        );
        let test_timeout = Duration::from_secs(
            config.connect_timeout_secs.min(CREDENTIAL_TEST_CONNECT_TIMEOUT_SECS)
                + config.read_timeout_secs.min(CREDENTIAL_TEST_READ_TIMEOUT_SECS),
        );
        Ok(Self {
            http,
            test_timeout,
            endpoint,
            market: config.market.clone(),
            language: config.language.clone(),
            rate_limit_cooldown: config.rate_limit_cooldown(),
            pool,
            identity,
            spacer: RequestSpacer::new(Duration::from_secs_f64(config.inter_request_delay_secs)),
        })
    }

    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    fn url_for(&self, code: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(code);
        }
        url.query_pairs_mut()
            .append_pair("market", &self.market)
            .append_pair("language", &self.language)
            .append_pair("supportMultiAvailabilities", "true");
        url
    }

    /// Check one code.
    pub async fn check(&self, code: &str) -> CheckResult {
        let code = code.trim();
        if code.chars().count() < MIN_CODE_LEN {
            return CheckResult::new(
                code,
                Outcome::Invalid,
                format!("code too short (minimum {MIN_CODE_LEN} characters)"),
            );
        }

        self.identity.maybe_rotate();
        self.spacer.wait().await;

        let credential = match self.pool.acquire().await {
            Ok(c) => c,
            Err(e) => {
                debug!(code, reason = e.reason(), "no credential available");
                crate::metrics::record_credential_unavailable(e.reason());
                let result = CheckResult::new(code, Outcome::CredentialError, e.to_string());
                // Tell the orchestrator how long until a token frees up.
                return match e {
                    token_pool::Error::AllRateLimited { retry_in } => result.with_failure(
                        Failure::new(FailureClass::RateLimited, e.to_string())
                            .with_retry_after(Some(retry_in)),
                    ),
                    _ => result,
                };
            }
        };

        let started = Instant::now();
        let response = match self
            .http
            .get(self.url_for(code))
            .headers(self.identity.headers(credential.secret.expose()))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return transport_failure(code, &e),
        };
        self.pool.mark_used(credential.id).await;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, Utc::now()));
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return transport_failure(code, &e),
        };
        crate::metrics::record_request(status, started.elapsed().as_secs_f64());

        let result = classify(code, status, retry_after, &body);
        match result.outcome {
            Outcome::RateLimited => {
                self.pool
                    .mark_rate_limited(credential.id, self.rate_limit_cooldown)
                    .await;
            }
            Outcome::CredentialError => {
                warn!(code, token_id = credential.id, "credential rejected");
                self.pool.mark_error(credential.id).await;
            }
            _ => {}
        }
        debug!(
            code,
            status,
            outcome = %result.outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "check complete"
        );
        result
    }

    /// Send every token, invalid ones included, against a placeholder code.
    ///
    /// 401 marks the token invalid; 200 or 404 marks it valid. Any other
    /// status or a transport failure leaves it untouched and is reported in
    /// `errors`. Requests share the inter-request spacing with checks.
    pub async fn test_credentials(&self) -> CredentialTestReport {
        let mut report = CredentialTestReport::default();
        for credential in self.pool.credentials().await {
            self.spacer.wait().await;
            let mut tested = TestedCredential {
                id: credential.id,
                preview: credential.secret.preview(),
                error: None,
            };
            let response = self
                .http
                .get(self.url_for(CREDENTIAL_TEST_CODE))
                .headers(self.identity.headers(credential.secret.expose()))
                .timeout(self.test_timeout)
                .send()
                .await;
            match response.map(|r| r.status().as_u16()) {
                Ok(401) => {
                    self.pool.set_valid(credential.id, false).await;
                    report.invalid.push(tested);
                }
                Ok(200 | 404) => {
                    self.pool.set_valid(credential.id, true).await;
                    report.valid.push(tested);
                }
                Ok(status) => {
                    tested.error = Some(format!("HTTP {status}"));
                    report.errors.push(tested);
                }
                Err(e) => {
                    tested.error = Some(e.to_string());
                    report.errors.push(tested);
                }
            }
        }
        info!(
            valid = report.valid.len(),
            invalid = report.invalid.len(),
            errors = report.errors.len(),
            "credential test finished"
        );
        report
    }
}

/// `Retry-After` as delay-seconds or an HTTP date. A date in the past means
/// no wait.
fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

/// Convert a transport error into an `Error` result with its failure class.
fn transport_failure(code: &str, error: &reqwest::Error) -> CheckResult {
    let (class, detail) = if error.is_timeout() {
        (FailureClass::Timeout, format!("request timed out: {error}"))
    } else if error.is_connect() {
        (FailureClass::Connection, format!("connection failed: {error}"))
    } else {
        (FailureClass::Network, format!("network error: {error}"))
    };
    warn!(code, error_type = class.label(), error = %error, "request failed");
    crate::metrics::record_network_error(class.label());
    CheckResult::new(code, Outcome::Error, detail.clone()).with_failure(Failure::new(class, detail))
}

impl Checker for CheckClient {
    fn check<'a>(&'a self, code: &'a str) -> Pin<Box<dyn Future<Output = CheckResult> + Send + 'a>> {
        Box::pin(CheckClient::check(self, code))
    }

    fn health(&self) -> Pin<Box<dyn Future<Output = serde_json::Value> + Send + '_>> {
        Box::pin(self.pool.health())
    }
}
