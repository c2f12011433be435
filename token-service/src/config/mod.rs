use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct TokenServiceConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub oauth: OAuthConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub maintenance: MaintenanceConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

/// Signing material. RS256 when both key paths are set, HS256 with
/// `secret` otherwise.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub secret: Option<Secret<String>>,
    pub private_key_path: Option<String>,
    pub public_key_path: Option<String>,
    pub issuer: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub frontend_url: String,
    pub state_ttl_seconds: u64,
    pub session_ttl_seconds: u64,
    pub login_grant_ttl_seconds: u64,
    pub google: Option<OAuthClientConfig>,
    pub github: Option<OAuthClientConfig>,
}

#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: Secret<String>,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    /// GitHub only: where verified addresses are listed.
    pub emails_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    /// Deadline for one access-token validation, store lookups included.
    pub validation_timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub prune_interval_seconds: u64,
    pub store_retry_max_elapsed_ms: u64,
}

impl TokenServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let jwt_secret = env::var("JWT_SECRET").ok().map(Secret::new);
        let private_key_path = env::var("JWT_PRIVATE_KEY_PATH").ok();
        let public_key_path = env::var("JWT_PUBLIC_KEY_PATH").ok();

        let config = TokenServiceConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("token-service"), is_prod)?,
            service_version: get_env(
                "SERVICE_VERSION",
                Some(env!("CARGO_PKG_VERSION")),
                is_prod,
            )?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: Secret::new(get_env("DATABASE_URL", None, is_prod)?),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            jwt: JwtConfig {
                secret: jwt_secret,
                private_key_path,
                public_key_path,
                issuer: get_env("JWT_ISSUER", Some("token-service"), is_prod)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "15",
                    is_prod,
                )?,
                refresh_token_expiry_days: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    "7",
                    is_prod,
                )?,
            },
            oauth: OAuthConfig {
                frontend_url: get_env("FRONTEND_URL", Some("http://localhost:3000"), is_prod)?,
                state_ttl_seconds: parse_env("OAUTH_STATE_TTL_SECONDS", "600", is_prod)?,
                session_ttl_seconds: parse_env("OAUTH_SESSION_TTL_SECONDS", "600", is_prod)?,
                login_grant_ttl_seconds: parse_env(
                    "OAUTH_LOGIN_GRANT_TTL_SECONDS",
                    "120",
                    is_prod,
                )?,
                google: provider_from_env(
                    "GOOGLE",
                    "https://accounts.google.com/o/oauth2/v2/auth",
                    "https://oauth2.googleapis.com/token",
                    "https://openidconnect.googleapis.com/v1/userinfo",
                    None,
                )?,
                github: provider_from_env(
                    "GITHUB",
                    "https://github.com/login/oauth/authorize",
                    "https://github.com/login/oauth/access_token",
                    "https://api.github.com/user",
                    Some("https://api.github.com/user/emails"),
                )?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
                validation_timeout_ms: parse_env("TOKEN_VALIDATION_TIMEOUT_MS", "2000", is_prod)?,
            },
            rate_limit: RateLimitConfig {
                login_attempts: get_env("RATE_LIMIT_LOGIN_ATTEMPTS", Some("5"), is_prod)?
                    .parse()
                    .unwrap_or(5),
                login_window_seconds: get_env(
                    "RATE_LIMIT_LOGIN_WINDOW_SECONDS",
                    Some("900"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(900),
            },
            maintenance: MaintenanceConfig {
                prune_interval_seconds: parse_env("PRUNE_INTERVAL_SECONDS", "3600", is_prod)?,
                store_retry_max_elapsed_ms: parse_env(
                    "STORE_RETRY_MAX_ELAPSED_MS",
                    "1500",
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        let has_key_pair = self.jwt.private_key_path.is_some() && self.jwt.public_key_path.is_some();
        if !has_key_pair && self.jwt.secret.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Either JWT_SECRET or both JWT_PRIVATE_KEY_PATH and JWT_PUBLIC_KEY_PATH must be set"
            )));
        }

        if self.security.validation_timeout_ms == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_VALIDATION_TIMEOUT_MS must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if !has_key_pair {
                tracing::warn!("Using HS256 token signing in production; RS256 key pair recommended");
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

/// A provider is enabled when its client id is present. Endpoints can be
/// overridden to point at a proxy or a test double.
fn provider_from_env(
    prefix: &str,
    authorize_url: &str,
    token_url: &str,
    userinfo_url: &str,
    emails_url: Option<&str>,
) -> Result<Option<OAuthClientConfig>, AppError> {
    let var = |name: &str| env::var(format!("{}_{}", prefix, name)).ok();

    let Some(client_id) = var("CLIENT_ID") else {
        return Ok(None);
    };
    let client_secret = var("CLIENT_SECRET").ok_or_else(|| {
        AppError::ConfigError(anyhow::anyhow!("{}_CLIENT_SECRET is required", prefix))
    })?;
    let redirect_uri = var("REDIRECT_URI").ok_or_else(|| {
        AppError::ConfigError(anyhow::anyhow!("{}_REDIRECT_URI is required", prefix))
    })?;

    Ok(Some(OAuthClientConfig {
        client_id,
        client_secret: Secret::new(client_secret),
        redirect_uri,
        authorize_url: var("AUTHORIZE_URL").unwrap_or_else(|| authorize_url.to_string()),
        token_url: var("TOKEN_URL").unwrap_or_else(|| token_url.to_string()),
        userinfo_url: var("USERINFO_URL").unwrap_or_else(|| userinfo_url.to_string()),
        emails_url: var("EMAILS_URL").or_else(|| emails_url.map(str::to_string)),
    }))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_env_uses_default_outside_prod_only() {
        let key = "TOKEN_SERVICE_TEST_UNSET_KEY";
        assert_eq!(get_env(key, Some("fallback"), false).unwrap(), "fallback");
        assert!(get_env(key, Some("fallback"), true).is_err());
        assert!(get_env(key, None, false).is_err());
    }

    #[test]
    fn parse_env_reports_the_key() {
        std::env::set_var("TOKEN_SERVICE_TEST_BAD_NUMBER", "ten");
        let err = parse_env::<u64>("TOKEN_SERVICE_TEST_BAD_NUMBER", "1", false).unwrap_err();
        assert!(err.to_string().contains("TOKEN_SERVICE_TEST_BAD_NUMBER"));
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }
}
