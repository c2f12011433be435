pub mod audit_event;
pub mod blacklisted_token;
pub mod issued_token;
pub mod oauth;
pub mod session;
pub mod user;

pub use audit_event::{AuditEvent, AuditEventType};
pub use blacklisted_token::{
    is_well_formed_jti, BlacklistFilter, BlacklistPage, BlacklistStats, BlacklistedToken,
    InvalidReason, Page, PageRequest, RevocationReason,
};
pub use issued_token::{IssuedToken, TokenType};
pub use oauth::{ExternalProfile, OAuthLoginGrant, OAuthSession, OAuthState, ProviderKind};
pub use session::Session;
pub use user::{normalize_email, AuthMethod, Invitation, NewOAuthUser, Role, UserAccount};
