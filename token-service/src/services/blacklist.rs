//! Blacklist engine: the authoritative revocation state.
//!
//! Single tokens are revoked by writing a write-once blacklist entry keyed
//! by JTI. Bulk revocation advances a monotonic per-user boundary instead of
//! enumerating tokens; validation rejects anything issued before it.

use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use chrono::{DateTime, Duration as ChronoDuration, SubsecRound, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{
    is_well_formed_jti, AuditEvent, AuditEventType, BlacklistFilter, BlacklistStats,
    BlacklistedToken, Page, PageRequest, RevocationReason,
};
use crate::services::audit::AuditService;
use crate::services::error::{ServiceError, StoreError};
use crate::services::metrics::Metrics;
use crate::services::store::TokenStore;

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(25),
            max_interval: Duration::from_millis(400),
            max_elapsed: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> ExponentialBackoff {
        let mut backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(Some(self.max_elapsed))
            .build();
        backoff.reset();
        backoff
    }
}

#[derive(Clone)]
pub struct BlacklistEngine {
    store: Arc<dyn TokenStore>,
    audit: AuditService,
    metrics: Metrics,
    /// Expiry assigned to entries for JTIs this service never issued.
    unknown_token_ttl: ChronoDuration,
    retry: RetryPolicy,
}

impl BlacklistEngine {
    pub fn new(
        store: Arc<dyn TokenStore>,
        audit: AuditService,
        metrics: Metrics,
        unknown_token_ttl: ChronoDuration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            audit,
            metrics,
            unknown_token_ttl,
            retry,
        }
    }

    /// Runs a store call, retrying only while it fails with
    /// `StoreError::Unavailable`. Definitive answers are returned at once.
    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        mut call: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        backoff::future::retry_notify(
            self.retry.backoff(),
            || {
                let attempt = call();
                async move {
                    attempt.await.map_err(|e| {
                        if e.is_transient() {
                            backoff::Error::transient(e)
                        } else {
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |err: StoreError, wait: Duration| {
                tracing::warn!(
                    operation,
                    error = %err,
                    retry_in_ms = wait.as_millis() as u64,
                    "Token store unavailable, retrying"
                );
            },
        )
        .await
    }

    /// Strongly consistent: reads the primary store. Errors propagate so the
    /// caller can fail closed.
    pub async fn is_token_revoked(&self, jti: &str) -> Result<bool, ServiceError> {
        let revoked = self
            .with_retry("is_blacklisted", || self.store.is_blacklisted(jti))
            .await?;
        Ok(revoked)
    }

    pub async fn revocation_entry(
        &self,
        jti: &str,
    ) -> Result<Option<BlacklistedToken>, ServiceError> {
        let entry = self
            .with_retry("find_blacklist_entry", || self.store.find_blacklist_entry(jti))
            .await?;
        Ok(entry)
    }

    /// Blacklists a single JTI, access or refresh alike.
    ///
    /// Owner and expiry are taken from the issued-token registry. The first
    /// entry for a JTI wins; later attempts get `AlreadyRevoked` and leave it
    /// untouched.
    #[tracing::instrument(skip(self, reason), fields(reason = %reason))]
    pub async fn revoke_token(
        &self,
        jti: &str,
        revoked_by: &str,
        reason: RevocationReason,
    ) -> Result<BlacklistedToken, ServiceError> {
        if !is_well_formed_jti(jti) {
            return Err(ServiceError::Validation("Malformed token identifier".into()));
        }

        let now = Utc::now();
        let issued = self
            .with_retry("find_issued_token", || self.store.find_issued_token(jti))
            .await?;

        let (user_id, expires_at) = match issued {
            Some(token) => (Some(token.user_id), token.expires_at),
            None => {
                tracing::warn!(jti, "Revoking a JTI with no issuance record");
                (None, now + self.unknown_token_ttl)
            }
        };

        let entry = BlacklistedToken {
            jti: jti.to_string(),
            user_id,
            revoked_by: revoked_by.to_string(),
            reason,
            revoked_at: now,
            expires_at,
        };

        let inserted = self
            .with_retry("insert_blacklist_entry", || {
                self.store.insert_blacklist_entry(&entry)
            })
            .await?;
        if !inserted {
            tracing::info!(jti, "Token is already revoked");
            return Err(ServiceError::AlreadyRevoked);
        }

        self.metrics.token_revoked(entry.reason.as_str());
        self.audit
            .record(
                AuditEvent::new(AuditEventType::TokenRevoked)
                    .actor(revoked_by)
                    .target_user(entry.user_id.clone())
                    .target_jti(jti)
                    .details(serde_json::json!({ "reason": entry.reason.as_str() })),
            )
            .await;

        tracing::info!(jti, user_id = ?entry.user_id, "Token revoked");
        Ok(entry)
    }

    /// Revokes every token the user currently holds without enumerating
    /// them: advances the user's boundary past now and closes their open
    /// sessions. Tokens issued after the returned boundary are unaffected.
    #[tracing::instrument(skip(self, reason), fields(reason = %reason))]
    pub async fn revoke_all_user_tokens(
        &self,
        user_id: &str,
        revoked_by: &str,
        reason: RevocationReason,
    ) -> Result<DateTime<Utc>, ServiceError> {
        let now = Utc::now();
        // Rounded up to the next whole microsecond so that every token minted
        // up to `now` sorts strictly before it.
        let cutoff = now.trunc_subsecs(6) + ChronoDuration::microseconds(1);

        let boundary = self
            .with_retry("advance_boundary", || {
                self.store.advance_boundary(user_id, cutoff, reason.as_str())
            })
            .await?;
        let sessions = self
            .with_retry("revoke_user_sessions", || {
                self.store.revoke_user_sessions(user_id, reason.as_str(), now)
            })
            .await?;

        self.metrics.user_tokens_revoked();
        self.audit
            .record(
                AuditEvent::new(AuditEventType::UserTokensRevoked)
                    .actor(revoked_by)
                    .target_user(Some(user_id))
                    .details(serde_json::json!({
                        "reason": reason.as_str(),
                        "tokens_valid_since": boundary,
                        "sessions_closed": sessions.len(),
                    })),
            )
            .await;

        tracing::info!(
            user_id,
            sessions_closed = sessions.len(),
            tokens_valid_since = %boundary,
            "All user tokens revoked"
        );
        Ok(boundary)
    }

    pub async fn user_tokens_valid_since(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, ServiceError> {
        let boundary = self
            .with_retry("get_boundary", || self.store.get_boundary(user_id))
            .await?;
        Ok(boundary)
    }

    pub async fn get_tokens_by_reason(
        &self,
        reason: RevocationReason,
        page: PageRequest,
    ) -> Result<Page<BlacklistedToken>, ServiceError> {
        let filter = BlacklistFilter {
            user_id: None,
            reason: Some(reason),
        };
        self.list(filter, page).await
    }

    pub async fn get_user_blacklisted_tokens(
        &self,
        user_id: &str,
        page: PageRequest,
    ) -> Result<Page<BlacklistedToken>, ServiceError> {
        let filter = BlacklistFilter {
            user_id: Some(user_id.to_string()),
            reason: None,
        };
        self.list(filter, page).await
    }

    /// Listing with both filters applied; newest revocations first.
    pub async fn list(
        &self,
        filter: BlacklistFilter,
        page: PageRequest,
    ) -> Result<Page<BlacklistedToken>, ServiceError> {
        let page = self
            .with_retry("list_blacklist", || self.store.list_blacklist(&filter, page))
            .await?;
        Ok(page)
    }

    pub async fn get_blacklisted_tokens_count(&self) -> Result<i64, ServiceError> {
        let count = self
            .with_retry("count_blacklisted", || self.store.count_blacklisted())
            .await?;
        Ok(count)
    }

    pub async fn stats(&self) -> Result<BlacklistStats, ServiceError> {
        let now = Utc::now();
        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|midnight| midnight.and_utc())
            .unwrap_or(now);

        let stats = self
            .with_retry("blacklist_stats", || self.store.blacklist_stats(now, day_start))
            .await?;
        Ok(stats)
    }

    /// Drops entries whose original token has expired anyway.
    pub async fn prune_expired(&self) -> Result<u64, ServiceError> {
        let now = Utc::now();
        let removed = self
            .with_retry("prune_expired", || self.store.prune_expired(now))
            .await?;
        if removed > 0 {
            tracing::info!(removed, "Pruned expired token records");
        }
        Ok(removed)
    }
}

/// Periodically prunes expired records until the returned handle is aborted.
pub fn spawn_pruner(engine: BlacklistEngine, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.prune_expired().await {
                tracing::error!(error = %e, "Failed to prune expired token records");
            }
        }
    })
}
