//! Token pool state and selection
//!
//! Selection filters to tokens that are valid and not rate limited, prefers
//! those idle for more than a minute, and otherwise picks uniformly at random.
//! Rate-limit expiry is evaluated lazily against the clock, so a token returns
//! to service without any background task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use common::Secret;
use rand::RngExt;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Credential errors before a token is invalidated.
pub const ERROR_THRESHOLD: u32 = 3;

/// Cooldown applied when the server rate-limits a token.
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(300);

/// Tokens idle for longer than this are preferred by `acquire`.
const FRESH_AFTER: Duration = Duration::from_secs(60);

/// Derived status of a token at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialState {
    Available,
    RateLimited { until: Instant },
    Invalid,
}

impl CredentialState {
    pub fn label(&self) -> &'static str {
        match self {
            CredentialState::Available => "available",
            CredentialState::RateLimited { .. } => "rate_limited",
            CredentialState::Invalid => "invalid",
        }
    }
}

struct Credential {
    id: u64,
    secret: Secret<String>,
    valid: bool,
    error_count: u32,
    last_used_at: Option<Instant>,
    rate_limited_until: Option<Instant>,
}

impl Credential {
    fn new(id: u64, secret: Secret<String>) -> Self {
        Self {
            id,
            secret,
            valid: true,
            error_count: 0,
            last_used_at: None,
            rate_limited_until: None,
        }
    }

    fn state(&self, now: Instant) -> CredentialState {
        if !self.valid {
            return CredentialState::Invalid;
        }
        match self.rate_limited_until {
            Some(until) if now < until => CredentialState::RateLimited { until },
            _ => CredentialState::Available,
        }
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.last_used_at
            .is_none_or(|used| now.saturating_duration_since(used) > FRESH_AFTER)
    }
}

/// A token handed out for one request.
///
/// `id` is stable for the token's lifetime in the pool and is what the caller
/// reports back through `mark_*`. Positions shift on eviction; ids do not.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub id: u64,
    pub secret: Secret<String>,
}

/// Point-in-time view of one token for introspection.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub index: usize,
    pub id: u64,
    pub preview: String,
    pub status: &'static str,
    pub valid: bool,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_remaining_secs: Option<u64>,
}

/// Pool of caller tokens shared by all workers.
///
/// All mutation goes through `&self` methods guarded by a single `RwLock`,
/// so concurrent `mark_*` calls from different checks are safe.
pub struct TokenPool {
    credentials: RwLock<Vec<Credential>>,
    next_id: AtomicU64,
}

impl TokenPool {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let credentials: Vec<Credential> = secrets
            .into_iter()
            .map(|s| -> String { s.into() })
            .filter(|s| !s.trim().is_empty())
            .enumerate()
            .map(|(i, s)| Credential::new(i as u64, Secret::new(s.trim().to_string())))
            .collect();
        let next_id = credentials.len() as u64;
        info!(tokens = credentials.len(), "token pool initialized");
        metrics::gauge!("checker_tokens_total").set(credentials.len() as f64);
        Self {
            credentials: RwLock::new(credentials),
            next_id: AtomicU64::new(next_id),
        }
    }

    /// Pick a token for the next request.
    ///
    /// Returns `NoCredentials` for an empty pool, `AllRateLimited` with the
    /// time until the earliest cooldown ends when every valid token is
    /// cooling down, and `AllInvalid` otherwise.
    pub async fn acquire(&self) -> Result<SelectedCredential> {
        let credentials = self.credentials.read().await;
        if credentials.is_empty() {
            return Err(Error::NoCredentials);
        }

        let now = Instant::now();
        let available: Vec<&Credential> = credentials
            .iter()
            .filter(|c| c.state(now) == CredentialState::Available)
            .collect();

        if available.is_empty() {
            let next_free = credentials
                .iter()
                .filter_map(|c| match c.state(now) {
                    CredentialState::RateLimited { until } => Some(until),
                    _ => None,
                })
                .min();
            return Err(match next_free {
                Some(until) => Error::AllRateLimited {
                    retry_in: until.saturating_duration_since(now),
                },
                None => Error::AllInvalid {
                    total: credentials.len(),
                },
            });
        }

        let fresh: Vec<&Credential> = available
            .iter()
            .copied()
            .filter(|c| c.is_fresh(now))
            .collect();
        let candidates = if fresh.is_empty() { &available } else { &fresh };
        let chosen = candidates[rand::rng().random_range(0..candidates.len())];

        debug!(
            token_id = chosen.id,
            available = available.len(),
            fresh = fresh.len(),
            "token selected"
        );
        Ok(SelectedCredential {
            id: chosen.id,
            secret: chosen.secret.clone(),
        })
    }

    /// Stamp the token as used now.
    pub async fn mark_used(&self, id: u64) {
        let mut credentials = self.credentials.write().await;
        if let Some(c) = credentials.iter_mut().find(|c| c.id == id) {
            c.last_used_at = Some(Instant::now());
        }
    }

    /// Count a credential error. Returns true if this call invalidated the token.
    pub async fn mark_error(&self, id: u64) -> bool {
        let mut credentials = self.credentials.write().await;
        let Some(c) = credentials.iter_mut().find(|c| c.id == id) else {
            return false;
        };
        c.error_count += 1;
        if c.error_count >= ERROR_THRESHOLD && c.valid {
            c.valid = false;
            warn!(
                token_id = id,
                token = %c.secret.preview(),
                errors = c.error_count,
                "token invalidated after repeated credential errors"
            );
            metrics::counter!("checker_tokens_invalidated_total").increment(1);
            return true;
        }
        debug!(token_id = id, errors = c.error_count, "token error recorded");
        false
    }

    /// Take the token out of rotation for `cooldown`.
    pub async fn mark_rate_limited(&self, id: u64, cooldown: Duration) {
        let mut credentials = self.credentials.write().await;
        if let Some(c) = credentials.iter_mut().find(|c| c.id == id) {
            c.rate_limited_until = Some(Instant::now() + cooldown);
            info!(
                token_id = id,
                token = %c.secret.preview(),
                cooldown_secs = cooldown.as_secs(),
                "token rate limited"
            );
        }
    }

    /// Add a token. Returns its id.
    pub async fn add(&self, secret: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let secret = secret.into().trim().to_string();
        self.credentials
            .write()
            .await
            .push(Credential::new(id, Secret::new(secret)));
        info!(token_id = id, "token added to pool");
        id
    }

    /// Drop every invalid token. Returns how many were removed.
    pub async fn remove_invalid(&self) -> usize {
        let mut credentials = self.credentials.write().await;
        let before = credentials.len();
        credentials.retain(|c| c.valid);
        let removed = before - credentials.len();
        if removed > 0 {
            info!(removed, remaining = credentials.len(), "invalid tokens removed");
        }
        removed
    }

    /// Remove the token at `index` (position in the current list).
    pub async fn remove_by_index(&self, index: usize) -> Result<u64> {
        let mut credentials = self.credentials.write().await;
        if index >= credentials.len() {
            return Err(Error::IndexOutOfRange(index));
        }
        let removed = credentials.remove(index);
        info!(token_id = removed.id, index, "token removed from pool");
        Ok(removed.id)
    }

    /// Clear error counts and restore validity on every token.
    pub async fn reset_errors(&self) {
        let mut credentials = self.credentials.write().await;
        for c in credentials.iter_mut() {
            c.error_count = 0;
            c.valid = true;
        }
        info!(tokens = credentials.len(), "token error counts reset");
    }

    /// Every token with its id, invalid ones included.
    pub async fn credentials(&self) -> Vec<SelectedCredential> {
        self.credentials
            .read()
            .await
            .iter()
            .map(|c| SelectedCredential {
                id: c.id,
                secret: c.secret.clone(),
            })
            .collect()
    }

    /// Set validity from an out-of-band credential test. Error counts are
    /// left alone.
    pub async fn set_valid(&self, id: u64, valid: bool) {
        let mut credentials = self.credentials.write().await;
        if let Some(c) = credentials.iter_mut().find(|c| c.id == id) {
            if c.valid != valid {
                info!(token_id = id, token = %c.secret.preview(), valid, "token validity updated");
            }
            c.valid = valid;
        }
    }

    pub async fn len(&self) -> usize {
        self.credentials.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.credentials.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<CredentialSnapshot> {
        let credentials = self.credentials.read().await;
        let now = Instant::now();
        credentials
            .iter()
            .enumerate()
            .map(|(index, c)| {
                let state = c.state(now);
                CredentialSnapshot {
                    index,
                    id: c.id,
                    preview: c.secret.preview(),
                    status: state.label(),
                    valid: c.valid,
                    error_count: c.error_count,
                    idle_secs: c
                        .last_used_at
                        .map(|used| now.saturating_duration_since(used).as_secs()),
                    rate_limited_remaining_secs: match state {
                        CredentialState::RateLimited { until } => {
                            Some(until.saturating_duration_since(now).as_secs())
                        }
                        _ => None,
                    },
                }
            })
            .collect()
    }

    /// Pool health summary.
    ///
    /// Status mapping: all available → healthy, some available → degraded,
    /// none available → unhealthy.
    pub async fn health(&self) -> serde_json::Value {
        let tokens = self.snapshot().await;
        let total = tokens.len();
        let count = |label: &str| tokens.iter().filter(|t| t.status == label).count();
        let available = count("available");
        let rate_limited = count("rate_limited");
        let invalid = count("invalid");

        let status = if total > 0 && available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": status,
            "total": total,
            "valid": total - invalid,
            "invalid": invalid,
            "rate_limited": rate_limited,
            "available": available,
            "tokens": tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn pool_of(n: usize) -> TokenPool {
        TokenPool::new((0..n).map(|i| format!("token-{i}-EwAoA+pvBAAUKods63Ys")))
    }

    #[tokio::test]
    async fn empty_pool_reports_no_credentials() {
        let pool = TokenPool::new(Vec::<String>::new());
        assert_eq!(pool.acquire().await.unwrap_err(), Error::NoCredentials);
    }

    #[tokio::test]
    async fn blank_lines_are_ignored() {
        let pool = TokenPool::new(["  ", "abc", ""]);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn acquire_returns_a_configured_token() {
        let pool = TokenPool::new(["only-token"]);
        let selected = pool.acquire().await.unwrap();
        assert_eq!(selected.id, 0);
        assert_eq!(selected.secret.expose(), "only-token");
    }

    #[tokio::test]
    async fn three_errors_invalidate_a_token() {
        let pool = pool_of(1);
        assert!(!pool.mark_error(0).await);
        assert!(!pool.mark_error(0).await);
        assert!(pool.mark_error(0).await, "third error must invalidate");

        let snap = pool.snapshot().await;
        assert_eq!(snap[0].error_count, 3);
        assert!(!snap[0].valid);
        assert_eq!(
            pool.acquire().await.unwrap_err(),
            Error::AllInvalid { total: 1 }
        );
    }

    #[tokio::test]
    async fn invalid_token_is_never_acquired() {
        let pool = pool_of(3);
        for _ in 0..ERROR_THRESHOLD {
            pool.mark_error(1).await;
        }
        for _ in 0..50 {
            assert_ne!(pool.acquire().await.unwrap().id, 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_pool_reports_time_to_next_token() {
        let pool = pool_of(2);
        pool.mark_rate_limited(0, Duration::from_secs(300)).await;
        pool.mark_rate_limited(1, Duration::from_secs(120)).await;

        match pool.acquire().await.unwrap_err() {
            Error::AllRateLimited { retry_in } => assert_eq!(retry_in, Duration::from_secs(120)),
            other => panic!("expected AllRateLimited, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_expires_without_intervention() {
        let pool = pool_of(1);
        pool.mark_rate_limited(0, DEFAULT_RATE_LIMIT_COOLDOWN).await;
        assert!(pool.acquire().await.is_err());

        tokio::time::advance(DEFAULT_RATE_LIMIT_COOLDOWN + Duration::from_millis(1)).await;
        assert_eq!(pool.acquire().await.unwrap().id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_and_invalid_mix_reports_rate_limit() {
        let pool = pool_of(2);
        for _ in 0..ERROR_THRESHOLD {
            pool.mark_error(0).await;
        }
        pool.mark_rate_limited(1, Duration::from_secs(30)).await;
        assert!(matches!(
            pool.acquire().await.unwrap_err(),
            Error::AllRateLimited { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn prefers_tokens_idle_for_over_a_minute() {
        let pool = pool_of(3);
        pool.mark_used(0).await;
        pool.mark_used(1).await;
        for _ in 0..30 {
            assert_eq!(pool.acquire().await.unwrap().id, 2);
        }

        // Once every token is recently used, any available one may be picked.
        pool.mark_used(2).await;
        let seen: HashSet<u64> = acquired_ids(&pool, 200).await;
        assert_eq!(seen.len(), 3, "expected uniform pick across all tokens");

        tokio::time::advance(Duration::from_secs(61)).await;
        pool.mark_used(2).await;
        for _ in 0..30 {
            assert_ne!(pool.acquire().await.unwrap().id, 2);
        }
    }

    async fn acquired_ids(pool: &TokenPool, rounds: usize) -> HashSet<u64> {
        let mut seen = HashSet::new();
        for _ in 0..rounds {
            seen.insert(pool.acquire().await.unwrap().id);
        }
        seen
    }

    #[tokio::test]
    async fn remove_invalid_keeps_ids_stable() {
        let pool = pool_of(3);
        for _ in 0..ERROR_THRESHOLD {
            pool.mark_error(0).await;
        }
        assert_eq!(pool.remove_invalid().await, 1);
        let ids: Vec<u64> = pool.snapshot().await.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2]);

        // Reporting against a removed id is a no-op.
        assert!(!pool.mark_error(0).await);
    }

    #[tokio::test]
    async fn remove_by_index_rejects_out_of_range() {
        let pool = pool_of(2);
        assert_eq!(pool.remove_by_index(1).await.unwrap(), 1);
        assert_eq!(
            pool.remove_by_index(5).await.unwrap_err(),
            Error::IndexOutOfRange(5)
        );
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test]
    async fn added_tokens_get_fresh_ids() {
        let pool = pool_of(2);
        pool.remove_by_index(1).await.unwrap();
        let id = pool.add("new-token").await;
        assert_eq!(id, 2, "ids must not be reused after removal");
    }

    #[tokio::test]
    async fn reset_errors_restores_validity() {
        let pool = pool_of(1);
        for _ in 0..ERROR_THRESHOLD {
            pool.mark_error(0).await;
        }
        pool.reset_errors().await;
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn concurrent_marks_are_all_counted() {
        let pool = std::sync::Arc::new(pool_of(1));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.mark_used(0).await;
                pool.mark_error(0).await
            }));
        }
        let mut invalidations = 0;
        for h in handles {
            if h.await.unwrap() {
                invalidations += 1;
            }
        }
        assert_eq!(invalidations, 1, "exactly one call crosses the threshold");
        assert_eq!(pool.snapshot().await[0].error_count, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn health_counts_each_state() {
        let pool = pool_of(4);
        for _ in 0..ERROR_THRESHOLD {
            pool.mark_error(0).await;
        }
        pool.mark_rate_limited(1, Duration::from_secs(60)).await;

        let health = pool.health().await;
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["total"], 4);
        assert_eq!(health["valid"], 3);
        assert_eq!(health["invalid"], 1);
        assert_eq!(health["rate_limited"], 1);
        assert_eq!(health["available"], 2);
        assert_eq!(health["tokens"][1]["rate_limited_remaining_secs"], 60);
    }

    #[tokio::test]
    async fn health_never_leaks_full_secret() {
        let secret = "EwAoA+pvBAAUKods63YsTHIS-PART-IS-SECRET";
        let pool = TokenPool::new([secret]);
        let rendered = pool.health().await.to_string();
        assert!(!rendered.contains("THIS-PART-IS-SECRET"), "got: {rendered}");
        assert!(rendered.contains("EwAoA+pvBAAUKods63Ys..."));
    }

    #[tokio::test]
    async fn empty_pool_is_unhealthy() {
        let pool = TokenPool::new(Vec::<String>::new());
        assert_eq!(pool.health().await["status"], "unhealthy");
    }

    #[tokio::test]
    async fn set_valid_restores_and_revokes_without_touching_errors() {
        let pool = pool_of(2);
        for _ in 0..ERROR_THRESHOLD {
            pool.mark_error(0).await;
        }
        assert!(matches!(pool.acquire().await, Ok(c) if c.id == 1));

        pool.set_valid(0, true).await;
        pool.set_valid(1, false).await;
        let snapshot = pool.snapshot().await;
        assert!(snapshot[0].valid);
        assert_eq!(snapshot[0].error_count, ERROR_THRESHOLD);
        assert_eq!(snapshot[1].status, "invalid");

        let listed: Vec<u64> = pool.credentials().await.iter().map(|c| c.id).collect();
        assert_eq!(listed, [0, 1], "invalid tokens are still listed");
    }
}
