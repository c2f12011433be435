pub mod audit;
pub mod blacklist;
pub mod directory;
pub mod error;
pub mod jwt;
pub mod memory;
pub mod metrics;
pub mod oauth;
pub mod redis;
pub mod store;
pub mod tokens;

pub use audit::AuditService;
pub use blacklist::{spawn_pruner, BlacklistEngine, RetryPolicy};
pub use directory::{CreateUserError, PgUserDirectory, UserDirectory};
pub use error::{ServiceError, StoreError};
pub use jwt::{Claims, JwtService, TokenError};
pub use memory::{InMemoryEphemeralStore, InMemoryTokenStore, InMemoryUserDirectory};
pub use metrics::Metrics;
pub use oauth::{
    build_providers, CallbackParams, GithubProvider, GoogleProvider, LinkError, OAuthLinker,
    OAuthProvider, OAuthTtls, ProviderError,
};
pub use redis::{EphemeralStore, RedisService};
pub use store::{PgTokenStore, TokenStore};
pub use tokens::{AuthContext, Introspection, TokenPair, TokenService};
