use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus collectors for the token service. Owned by `AppState` and
/// handed to each component; there is no process-wide registry.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    tokens_issued: IntCounterVec,
    tokens_revoked: IntCounterVec,
    bulk_revocations: IntCounter,
    validations: IntCounterVec,
    refresh_reuse: IntCounter,
    oauth_callbacks: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("token_service".to_string()), None)?;

        let tokens_issued = IntCounterVec::new(
            Opts::new("tokens_issued_total", "Tokens minted, by token type"),
            &["token_type"],
        )?;
        let tokens_revoked = IntCounterVec::new(
            Opts::new("tokens_revoked_total", "Blacklist entries written, by reason"),
            &["reason"],
        )?;
        let bulk_revocations = IntCounter::new(
            "user_revocations_total",
            "Per-user revocation boundaries advanced",
        )?;
        let validations = IntCounterVec::new(
            Opts::new("token_validations_total", "Access token validations, by outcome"),
            &["outcome"],
        )?;
        let refresh_reuse = IntCounter::new(
            "refresh_reuse_detected_total",
            "Superseded refresh tokens presented again",
        )?;
        let oauth_callbacks = IntCounterVec::new(
            Opts::new("oauth_callbacks_total", "OAuth callbacks, by provider and outcome"),
            &["provider", "outcome"],
        )?;

        registry.register(Box::new(tokens_issued.clone()))?;
        registry.register(Box::new(tokens_revoked.clone()))?;
        registry.register(Box::new(bulk_revocations.clone()))?;
        registry.register(Box::new(validations.clone()))?;
        registry.register(Box::new(refresh_reuse.clone()))?;
        registry.register(Box::new(oauth_callbacks.clone()))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                tokens_issued,
                tokens_revoked,
                bulk_revocations,
                validations,
                refresh_reuse,
                oauth_callbacks,
            }),
        })
    }

    pub fn token_issued(&self, token_type: &str) {
        self.inner
            .tokens_issued
            .with_label_values(&[token_type])
            .inc();
    }

    pub fn token_revoked(&self, reason: &str) {
        self.inner.tokens_revoked.with_label_values(&[reason]).inc();
    }

    pub fn user_tokens_revoked(&self) {
        self.inner.bulk_revocations.inc();
    }

    pub fn validation(&self, outcome: &str) {
        self.inner.validations.with_label_values(&[outcome]).inc();
    }

    pub fn refresh_reuse_detected(&self) {
        self.inner.refresh_reuse.inc();
    }

    pub fn oauth_callback(&self, provider: &str, outcome: &str) {
        self.inner
            .oauth_callbacks
            .with_label_values(&[provider, outcome])
            .inc();
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.inner.registry.gather();

        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return format!("# Failed to encode metrics: {}\n", e);
        }

        match String::from_utf8(buffer) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to convert metrics to UTF-8: {}", e);
                format!("# Failed to convert metrics to UTF-8: {}\n", e)
            }
        }
    }
}
