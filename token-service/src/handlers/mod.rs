pub mod admin_tokens;
pub mod auth;
pub mod metrics;
pub mod oauth;

pub use admin_tokens::*;
pub use auth::*;
pub use metrics::*;
pub use oauth::*;
