use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;
use uuid::Uuid;

use crate::config::JwtConfig;
use crate::models::{Role, TokenType};

/// Signs and verifies session tokens. Knows nothing about revocation.
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    issuer: String,
    access_token_expiry_minutes: i64,
    refresh_token_expiry_days: i64,
}

/// Claims carried by both access and refresh tokens; `typ` tells them apart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,
    /// Session the token belongs to
    pub sid: Uuid,
    /// JWT ID (for blacklisting)
    pub jti: String,
    pub typ: TokenType,
    pub role: Role,
    /// Issued at (Unix seconds)
    pub iat: i64,
    /// Expiration time (Unix seconds)
    pub exp: i64,
    /// Issued at in microseconds, compared against the revocation boundary
    pub iat_us: i64,
    pub iss: String,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(
            self.iat_us.div_euclid(1_000_000),
            (self.iat_us.rem_euclid(1_000_000) * 1_000) as u32,
        )
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token invalid")]
    Invalid,
}

impl JwtService {
    /// RS256 when both key paths are configured, HS256 with the shared
    /// secret otherwise.
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        let (encoding_key, decoding_key, algorithm) =
            match (&config.private_key_path, &config.public_key_path) {
                (Some(private_path), Some(public_path)) => {
                    let private_key_pem = fs::read_to_string(private_path).map_err(|e| {
                        anyhow::anyhow!("Failed to read private key from {}: {}", private_path, e)
                    })?;
                    let public_key_pem = fs::read_to_string(public_path).map_err(|e| {
                        anyhow::anyhow!("Failed to read public key from {}: {}", public_path, e)
                    })?;

                    let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
                        .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;
                    let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
                        .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

                    tracing::info!("JWT service initialized with RS256 keys");
                    (encoding_key, decoding_key, Algorithm::RS256)
                }
                _ => {
                    let secret = config
                        .secret
                        .as_ref()
                        .ok_or_else(|| anyhow::anyhow!("JWT secret is not configured"))?;
                    let bytes = secret.expose_secret().as_bytes();
                    if bytes.len() < 32 {
                        return Err(anyhow::anyhow!(
                            "JWT secret must be at least 32 bytes long"
                        ));
                    }

                    tracing::info!("JWT service initialized with HS256 secret");
                    (
                        EncodingKey::from_secret(bytes),
                        DecodingKey::from_secret(bytes),
                        Algorithm::HS256,
                    )
                }
            };

        Ok(Self {
            encoding_key,
            decoding_key,
            algorithm,
            issuer: config.issuer.clone(),
            access_token_expiry_minutes: config.access_token_expiry_minutes,
            refresh_token_expiry_days: config.refresh_token_expiry_days,
        })
    }

    /// Mints a token with a fresh UUIDv4 JTI.
    pub fn mint(
        &self,
        user_id: &str,
        role: Role,
        session_id: Uuid,
        typ: TokenType,
        now: DateTime<Utc>,
    ) -> Result<(String, Claims), anyhow::Error> {
        let exp = now + self.ttl(typ);

        let claims = Claims {
            sub: user_id.to_string(),
            sid: session_id,
            jti: Uuid::new_v4().to_string(),
            typ,
            role,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iat_us: now.timestamp_micros(),
            iss: self.issuer.clone(),
        };

        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key)
            .map_err(|e| anyhow::anyhow!("Failed to encode {} token: {}", typ.as_str(), e))?;

        Ok((token, claims))
    }

    /// Verifies signature first, then expiry and issuer. Whatever the cause,
    /// callers only learn whether the token expired or is otherwise invalid.
    pub fn decode(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "sub", "jti", "iss"]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => {
                    tracing::debug!(error = %e, "Token rejected");
                    TokenError::Invalid
                }
            })
    }

    pub fn ttl(&self, typ: TokenType) -> Duration {
        match typ {
            TokenType::Access => Duration::minutes(self.access_token_expiry_minutes),
            TokenType::Refresh => Duration::days(self.refresh_token_expiry_days),
        }
    }

    /// Get access token expiry in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }
}
