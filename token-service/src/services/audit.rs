use std::sync::Arc;

use crate::models::AuditEvent;
use crate::services::store::TokenStore;

/// Writes audit events to the token store. A failed audit write is logged
/// but never undoes the action being audited.
#[derive(Clone)]
pub struct AuditService {
    store: Arc<dyn TokenStore>,
}

impl AuditService {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            event_type = %event.event_type,
            actor = event.actor_user_id.as_deref().unwrap_or("-"),
            target_user = event.target_user_id.as_deref().unwrap_or("-"),
            target_jti = event.target_jti.as_deref().unwrap_or("-"),
            "audit event"
        );

        if let Err(e) = self.store.record_audit_event(&event).await {
            tracing::error!(
                error = %e,
                event_id = %event.event_id,
                event_type = %event.event_type,
                "Failed to persist audit event"
            );
        }
    }
}
