use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use chrono::{Duration, Utc};
use cloudbid_ledger::MarketStore;
use cloudbid_types::{Credentials, UserId};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::error::ApiError;

/// Longest session a token can be issued for (ten years).
pub const MAX_TOKEN_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Claims carried by a session token.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (uid)
    pub sub: String,
    /// Expiration time (as numeric date)
    pub exp: usize,
    /// Issued at (as numeric date)
    pub iat: usize,
    /// JWT ID
    pub jti: String,
}

/// Session token settings.
#[derive(Clone)]
pub struct JwtConfig {
    secret_key: String,
    ttl: Duration,
    validation: Validation,
}

impl std::fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtConfig")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl JwtConfig {
    pub fn new(secret_key: impl Into<String>, ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["sub", "exp"]);
        validation.leeway = 0;
        Self {
            secret_key: secret_key.into(),
            ttl: Duration::seconds(ttl_secs.min(MAX_TOKEN_TTL_SECS) as i64),
            validation,
        }
    }

    pub fn issue(&self, uid: UserId) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: uid.to_string(),
            exp: now
                .checked_add_signed(self.ttl)
                .unwrap_or(now)
                .timestamp()
                .max(0) as usize,
            iat: now.timestamp().max(0) as usize,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret_key.as_bytes()),
        )
    }

    pub fn validate(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret_key.as_bytes()),
            &self.validation,
        )
        .map(|data| data.claims)
    }

    /// Hashes the credentials, registers unknown users and records a fresh
    /// session token. Returns the uid, the token and whether the user is new.
    pub async fn login(
        &self,
        store: &dyn MarketStore,
        credentials: &Credentials,
    ) -> Result<(UserId, String, bool), ApiError> {
        credentials.validate()?;
        let (uid, created) = store
            .register_or_authenticate(
                &hash_credential(&credentials.username),
                &hash_credential(&credentials.password),
            )
            .await?;
        let token = self
            .issue(uid)
            .map_err(|err| ApiError::Internal(format!("failed to sign session token: {err}")))?;
        store.issue_session_token(uid, &token).await?;
        info!(uid = %uid, created, "session opened");
        Ok((uid, token, created))
    }

    /// Resolves a session token to its user. The token must verify, be on
    /// record, and belong to the user named in its claims. Expired tokens are
    /// dropped from the store.
    pub async fn authenticate(
        &self,
        store: &dyn MarketStore,
        token: &str,
    ) -> Result<UserId, ApiError> {
        let claims = match self.validate(token) {
            Ok(claims) => claims,
            Err(err) if matches!(err.kind(), ErrorKind::ExpiredSignature) => {
                store.revoke_token(token).await?;
                debug!("expired session token removed");
                return Err(ApiError::AuthInvalid);
            }
            Err(err) => {
                warn!(error = %err, "JWT validation failed");
                return Err(ApiError::AuthInvalid);
            }
        };

        let uid = store
            .resolve_token(token)
            .await?
            .ok_or(ApiError::AuthInvalid)?;
        if claims.sub != uid.to_string() {
            warn!(uid = %uid, sub = %claims.sub, "token subject does not match its owner");
            return Err(ApiError::AuthMismatch);
        }
        Ok(uid)
    }
}

/// Hex-encoded SHA-256 of a username or password.
pub fn hash_credential(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Accepts the raw token or `Bearer <token>`.
fn token_from_header(value: &str) -> Option<&str> {
    let value = value.trim();
    let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
    (!token.is_empty()).then_some(token)
}

/// Extractor for authenticated requests.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub uid: UserId,
    pub token: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .ok_or(ApiError::AuthMissing)?
            .to_str()
            .map_err(|_| ApiError::AuthInvalid)?;
        let token = token_from_header(header).ok_or(ApiError::AuthMissing)?;

        let uid = state
            .jwt
            .authenticate(state.auction.store().as_ref(), token)
            .await?;
        Ok(AuthUser {
            uid,
            token: token.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudbid_ledger::InMemoryMarketStore;

    fn config() -> JwtConfig {
        JwtConfig::new("test_secret_key", 3600)
    }

    #[test]
    fn credential_hash_is_sha256_hex() {
        assert_eq!(
            hash_credential("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn header_accepts_raw_and_bearer_tokens() {
        assert_eq!(token_from_header("abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(token_from_header("Bearer abc.def.ghi"), Some("abc.def.ghi"));
        assert_eq!(token_from_header("Bearer "), None);
        assert_eq!(token_from_header(""), None);
    }

    #[test]
    fn issued_token_validates() {
        let config = config();
        let token = config.issue(UserId(7)).unwrap();
        let claims = config.validate(&token).unwrap();
        assert_eq!(claims.sub, "7");
        assert!(claims.exp > claims.iat);
        assert!(JwtConfig::new("other_secret", 3600).validate(&token).is_err());
    }

    #[test]
    fn oversized_ttl_is_clamped() {
        let config = JwtConfig::new("test_secret_key", u64::MAX);
        let token = config.issue(UserId(7)).unwrap();
        let claims = config.validate(&token).unwrap();
        let lifetime = (claims.exp - claims.iat) as u64;
        assert!(lifetime <= MAX_TOKEN_TTL_SECS);
        assert!(lifetime + 1 >= MAX_TOKEN_TTL_SECS);
    }

    #[tokio::test]
    async fn login_registers_then_authenticates() {
        let store = InMemoryMarketStore::new();
        let config = config();
        let creds = Credentials {
            username: "alice".into(),
            password: "pw".into(),
        };

        let (uid, token, created) = config.login(&store, &creds).await.unwrap();
        assert!(created);
        assert_eq!(config.authenticate(&store, &token).await.unwrap(), uid);

        let (again, _, created) = config.login(&store, &creds).await.unwrap();
        assert_eq!(again, uid);
        assert!(!created);

        let wrong = Credentials {
            username: "alice".into(),
            password: "nope".into(),
        };
        assert!(matches!(
            config.login(&store, &wrong).await,
            Err(ApiError::AuthInvalid)
        ));
    }

    #[tokio::test]
    async fn unknown_and_foreign_tokens_are_refused() {
        let store = InMemoryMarketStore::new();
        let config = config();
        let creds = Credentials {
            username: "bob".into(),
            password: "pw".into(),
        };
        let (uid, _, _) = config.login(&store, &creds).await.unwrap();

        let unrecorded = config.issue(uid).unwrap();
        assert!(matches!(
            config.authenticate(&store, &unrecorded).await,
            Err(ApiError::AuthInvalid)
        ));

        let forged = config.issue(UserId(uid.get() + 100)).unwrap();
        store.issue_session_token(uid, &forged).await.unwrap();
        assert!(matches!(
            config.authenticate(&store, &forged).await,
            Err(ApiError::AuthMismatch)
        ));
    }

    #[tokio::test]
    async fn expired_token_is_removed() {
        let store = InMemoryMarketStore::new();
        let config = config();
        let (uid, _) = store.register_or_authenticate("carol", "pw").await.unwrap();

        let past = Utc::now() - Duration::hours(2);
        let claims = Claims {
            sub: uid.to_string(),
            exp: (past + Duration::hours(1)).timestamp() as usize,
            iat: past.timestamp() as usize,
            jti: "expired".into(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"test_secret_key"),
        )
        .unwrap();
        store.issue_session_token(uid, &token).await.unwrap();

        assert!(matches!(
            config.authenticate(&store, &token).await,
            Err(ApiError::AuthInvalid)
        ));
        assert_eq!(store.resolve_token(&token).await.unwrap(), None);
    }
}
