pub mod linker;
pub mod provider;

pub use linker::{CallbackParams, LinkError, OAuthLinker, OAuthTtls};
pub use provider::{
    build_providers, GithubProvider, GoogleProvider, OAuthProvider, ProviderError,
};
