//! In-process implementations of the store traits, used by tests and local
//! development. Single-key atomicity comes from `DashMap`'s entry API.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use std::sync::Mutex;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::{
    AuditEvent, BlacklistFilter, BlacklistStats, BlacklistedToken, Invitation, IssuedToken,
    NewOAuthUser, Page, PageRequest, Role, Session, UserAccount, AuthMethod,
};
use crate::services::directory::{CreateUserError, UserDirectory};
use crate::services::error::StoreError;
use crate::services::redis::EphemeralStore;
use crate::services::store::TokenStore;

#[derive(Default)]
pub struct InMemoryTokenStore {
    issued: DashMap<String, IssuedToken>,
    blacklist: DashMap<String, BlacklistedToken>,
    boundaries: DashMap<String, DateTime<Utc>>,
    sessions: DashMap<Uuid, Session>,
    audit: Mutex<Vec<AuditEvent>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn record_issued_token(&self, token: &IssuedToken) -> Result<(), StoreError> {
        match self.issued.entry(token.jti.clone()) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                Ok(())
            }
        }
    }

    async fn find_issued_token(&self, jti: &str) -> Result<Option<IssuedToken>, StoreError> {
        Ok(self.issued.get(jti).map(|t| t.clone()))
    }

    async fn insert_blacklist_entry(&self, entry: &BlacklistedToken) -> Result<bool, StoreError> {
        match self.blacklist.entry(entry.jti.clone()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                Ok(true)
            }
        }
    }

    async fn find_blacklist_entry(
        &self,
        jti: &str,
    ) -> Result<Option<BlacklistedToken>, StoreError> {
        Ok(self.blacklist.get(jti).map(|e| e.clone()))
    }

    async fn is_blacklisted(&self, jti: &str) -> Result<bool, StoreError> {
        Ok(self.blacklist.contains_key(jti))
    }

    async fn list_blacklist(
        &self,
        filter: &BlacklistFilter,
        page: PageRequest,
    ) -> Result<Page<BlacklistedToken>, StoreError> {
        let mut matching: Vec<BlacklistedToken> = self
            .blacklist
            .iter()
            .filter(|e| filter.matches(e.value()))
            .map(|e| e.value().clone())
            .collect();
        matching.sort_by(|a, b| {
            b.revoked_at
                .cmp(&a.revoked_at)
                .then_with(|| a.jti.cmp(&b.jti))
        });

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .collect();

        Ok(Page {
            items,
            total,
            limit: page.limit,
            offset: page.offset,
        })
    }

    async fn count_blacklisted(&self) -> Result<i64, StoreError> {
        Ok(self.blacklist.len() as i64)
    }

    async fn blacklist_stats(
        &self,
        now: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> Result<BlacklistStats, StoreError> {
        let mut stats = BlacklistStats::default();
        for entry in self.blacklist.iter() {
            stats.total_blacklisted += 1;
            if entry.expires_at > now {
                stats.active += 1;
            }
            if entry.revoked_at >= day_start {
                stats.revoked_today += 1;
            }
            *stats
                .by_reason
                .entry(entry.reason.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn advance_boundary(
        &self,
        user_id: &str,
        at: DateTime<Utc>,
        _reason: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        let mut boundary = self.boundaries.entry(user_id.to_string()).or_insert(at);
        if at > *boundary {
            *boundary = at;
        }
        Ok(*boundary)
    }

    async fn get_boundary(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.boundaries.get(user_id).map(|b| *b))
    }

    async fn create_session(&self, session: &Session) -> Result<(), StoreError> {
        match self.sessions.entry(session.session_id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(())
            }
        }
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(&session_id).map(|s| s.clone()))
    }

    async fn rotate_session_refresh(
        &self,
        session_id: Uuid,
        expected_jti: &str,
        new_jti: &str,
    ) -> Result<bool, StoreError> {
        match self.sessions.get_mut(&session_id) {
            Some(mut session)
                if session.revoked_at.is_none() && session.current_refresh_jti == expected_jti =>
            {
                session.current_refresh_jti = new_jti.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<Session>, StoreError> {
        match self.sessions.get_mut(&session_id) {
            Some(mut session) if session.revoked_at.is_none() => {
                session.revoked_at = Some(at);
                session.revoked_reason = Some(reason.to_string());
                Ok(Some(session.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_user_sessions(
        &self,
        user_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Session>, StoreError> {
        let mut closed = Vec::new();
        for mut session in self.sessions.iter_mut() {
            if session.user_id == user_id && session.revoked_at.is_none() {
                session.revoked_at = Some(at);
                session.revoked_reason = Some(reason.to_string());
                closed.push(session.clone());
            }
        }
        Ok(closed)
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.blacklist.len() + self.issued.len() + self.sessions.len();
        self.blacklist.retain(|_, e| e.expires_at >= now);
        self.issued.retain(|_, t| t.expires_at >= now);
        self.sessions.retain(|_, s| s.expires_at >= now);
        let after = self.blacklist.len() + self.issued.len() + self.sessions.len();
        Ok((before - after) as u64)
    }

    async fn record_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.audit
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("audit mutex poisoned: {}", e)))?
            .push(event.clone());
        Ok(())
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<String, UserAccount>,
    invitations: DashMap<String, Invitation>,
    // Serializes account creation so the email uniqueness check and the
    // invitation consumption happen as one step.
    create_lock: Mutex<()>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: UserAccount) {
        self.users.insert(user.id.clone(), user);
    }

    pub fn insert_invitation(&self, invitation: Invitation) {
        self.invitations.insert(invitation.token.clone(), invitation);
    }

    pub fn invitation(&self, token: &str) -> Option<Invitation> {
        self.invitations.get(token).map(|i| i.clone())
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn get_user(&self, id: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self.users.get(id).map(|u| u.clone()))
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .map(|u| u.value().clone()))
    }

    async fn create_oauth_user(&self, user: NewOAuthUser) -> Result<UserAccount, CreateUserError> {
        let _guard = self
            .create_lock
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("directory mutex poisoned: {}", e)))?;

        if self
            .users
            .iter()
            .any(|u| u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(CreateUserError::EmailTaken);
        }

        let now = Utc::now();
        let role = match &user.invitation_token {
            Some(token) => {
                let mut invitation = self
                    .invitations
                    .get_mut(token)
                    .ok_or(CreateUserError::InvitationInvalid)?;
                if !invitation.admits(&user.email, now) {
                    return Err(CreateUserError::InvitationInvalid);
                }
                invitation.consumed_at = Some(now);
                invitation.role
            }
            None => Role::Member,
        };

        let account = UserAccount {
            id: Uuid::new_v4().to_string(),
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            role,
            auth_method: AuthMethod::OAuth,
            password_hash: None,
            oauth_provider: Some(user.provider),
            oauth_provider_id: Some(user.provider_id),
            created_at: now,
        };
        self.users.insert(account.id.clone(), account.clone());
        Ok(account)
    }

    async fn update_password_hash(&self, user_id: &str, hash: &str) -> Result<(), StoreError> {
        match self.users.get_mut(user_id) {
            Some(mut user) if user.auth_method == AuthMethod::Password => {
                user.password_hash = Some(hash.to_string());
                Ok(())
            }
            _ => Err(StoreError::NotFound),
        }
    }
}

#[derive(Default)]
pub struct InMemoryEphemeralStore {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryEphemeralStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EphemeralStore for InMemoryEphemeralStore {
    async fn put(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let expires = Instant::now() + Duration::from_secs(ttl_seconds.max(1));
        self.entries
            .insert(key.to_string(), (value.to_string(), expires));
        Ok(())
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .entries
            .remove(key)
            .filter(|(_, (_, expires))| *expires > Instant::now())
            .map(|(_, (value, _))| value))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
