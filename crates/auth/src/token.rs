//! Session token issuing and validation.
//!
//! Tokens are JWTs signed with either a shared-secret HMAC or an RSA key
//! pair — a deployment choice that doesn't change semantics. Revocation is
//! a jti-keyed entry in the counter store with a TTL no shorter than the
//! token's remaining lifetime, so a revoked id stays dead until it would
//! have expired anyway.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use voxgate_core::{Error, Result};
use voxgate_store::{keys, CounterStore};

pub const ISSUER: &str = "voxgate";
pub const AUDIENCE: &str = "voxgate-client";
/// Tokens below this version are rejected outright.
pub const TOKEN_MIN_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT claim set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    pub tenant_id: String,
    pub principal_id: String,
    pub token_type: TokenType,
    /// Permission snapshot; access tokens only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(default = "default_token_version")]
    pub token_version: u32,
}

fn default_token_version() -> u32 {
    1
}

impl TokenClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_else(Utc::now)
    }
}

/// Signing material: HMAC shared secret or RSA key pair.
pub enum TokenKeys {
    Hmac {
        secret: Vec<u8>,
    },
    Rsa {
        encoding: Box<EncodingKey>,
        decoding: Box<DecodingKey>,
    },
}

impl TokenKeys {
    pub fn hmac(secret: impl Into<Vec<u8>>) -> Self {
        Self::Hmac {
            secret: secret.into(),
        }
    }

    pub fn rsa_from_pem(private_pem: &[u8], public_pem: &[u8]) -> Result<Self> {
        Ok(Self::Rsa {
            encoding: Box::new(
                EncodingKey::from_rsa_pem(private_pem)
                    .map_err(|e| Error::Internal(format!("bad RSA private key: {e}")))?,
            ),
            decoding: Box::new(
                DecodingKey::from_rsa_pem(public_pem)
                    .map_err(|e| Error::Internal(format!("bad RSA public key: {e}")))?,
            ),
        })
    }

    fn algorithm(&self) -> Algorithm {
        match self {
            Self::Hmac { .. } => Algorithm::HS256,
            Self::Rsa { .. } => Algorithm::RS256,
        }
    }

    fn encoding_key(&self) -> EncodingKey {
        match self {
            Self::Hmac { secret } => EncodingKey::from_secret(secret),
            Self::Rsa { encoding, .. } => (**encoding).clone(),
        }
    }

    fn decoding_key(&self) -> DecodingKey {
        match self {
            Self::Hmac { secret } => DecodingKey::from_secret(secret),
            Self::Rsa { decoding, .. } => (**decoding).clone(),
        }
    }
}

/// Issued access/refresh pair.
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub permissions: Vec<String>,
}

pub struct TokenService {
    keys: TokenKeys,
    access_lifetime: chrono::Duration,
    refresh_lifetime: chrono::Duration,
    revocations: Arc<dyn CounterStore>,
}

impl TokenService {
    pub fn new(
        keys: TokenKeys,
        access_lifetime_minutes: i64,
        refresh_lifetime_days: i64,
        revocations: Arc<dyn CounterStore>,
    ) -> Self {
        Self {
            keys,
            access_lifetime: chrono::Duration::minutes(access_lifetime_minutes),
            refresh_lifetime: chrono::Duration::days(refresh_lifetime_days),
            revocations,
        }
    }

    fn claims(
        &self,
        tenant_id: &str,
        principal_id: &str,
        token_type: TokenType,
        permissions: Vec<String>,
        lifetime: chrono::Duration,
    ) -> TokenClaims {
        let now = Utc::now();
        TokenClaims {
            iss: ISSUER.to_string(),
            aud: AUDIENCE.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + lifetime).timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            principal_id: principal_id.to_string(),
            token_type,
            permissions,
            token_version: 1,
        }
    }

    fn sign(&self, claims: &TokenClaims) -> Result<String> {
        encode(
            &Header::new(self.keys.algorithm()),
            claims,
            &self.keys.encoding_key(),
        )
        .map_err(|e| Error::Internal(format!("token signing failed: {e}")))
    }

    /// Issue an access + refresh pair for a freshly authenticated session.
    pub fn issue_pair(
        &self,
        tenant_id: &str,
        principal_id: &str,
        permissions: Vec<String>,
    ) -> Result<TokenPair> {
        let access = self.claims(
            tenant_id,
            principal_id,
            TokenType::Access,
            permissions.clone(),
            self.access_lifetime,
        );
        // Refresh tokens never carry permission authority.
        let refresh = self.claims(
            tenant_id,
            principal_id,
            TokenType::Refresh,
            Vec::new(),
            self.refresh_lifetime,
        );

        Ok(TokenPair {
            access_token: self.sign(&access)?,
            refresh_token: self.sign(&refresh)?,
            access_expires_at: access.expires_at(),
            refresh_expires_at: refresh.expires_at(),
            permissions,
        })
    }

    /// Validate signature, issuer, audience, expiry, type, minimum token
    /// version and the revocation blocklist.
    pub async fn validate(&self, token: &str, expected: TokenType) -> Result<TokenClaims> {
        let mut validation = Validation::new(self.keys.algorithm());
        validation.set_issuer(&[ISSUER]);
        validation.set_audience(&[AUDIENCE]);
        validation.leeway = 0;

        let data = decode::<TokenClaims>(token, &self.keys.decoding_key(), &validation)
            .map_err(|e| Error::Unauthenticated(format!("invalid token: {e}")))?;
        let claims = data.claims;

        if claims.token_type != expected {
            return Err(Error::Unauthenticated("wrong token type".to_string()));
        }
        if claims.token_version < TOKEN_MIN_VERSION {
            return Err(Error::Unauthenticated("token version too old".to_string()));
        }

        let revoked = self
            .revocations
            .multi_get(&[keys::token_revoked(&claims.jti)])
            .await
            // Revocation checks fail closed when the blocklist store is
            // unreachable.
            .map_err(|e| Error::Unauthenticated(format!("revocation check failed: {e}")))?;
        if revoked[0].is_some() {
            return Err(Error::Unauthenticated("token revoked".to_string()));
        }

        Ok(claims)
    }

    /// Revoke a token by id for at least its remaining lifetime.
    pub async fn revoke(&self, claims: &TokenClaims) -> Result<()> {
        let remaining = (claims.expires_at() - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1))
            .max(Duration::from_secs(1));
        self.revocations
            .set_with_ttl(&keys::token_revoked(&claims.jti), 1.0, remaining)
            .await
            .map_err(voxgate_core::Error::from)?;
        tracing::info!(jti = %claims.jti, tenant_id = %claims.tenant_id, "token revoked");
        Ok(())
    }

    /// Exchange a refresh token for a new access token. The refresh token
    /// itself is returned unchanged; it only rotates at explicit logout.
    /// `current_permissions` is the principal's snapshot at exchange time.
    pub async fn refresh(
        &self,
        refresh_token: &str,
        current_permissions: Vec<String>,
    ) -> Result<(String, DateTime<Utc>)> {
        let claims = self.validate(refresh_token, TokenType::Refresh).await?;
        let access = self.claims(
            &claims.tenant_id,
            &claims.principal_id,
            TokenType::Access,
            current_permissions,
            self.access_lifetime,
        );
        Ok((self.sign(&access)?, access.expires_at()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxgate_store::InMemoryCounterStore;

    fn service() -> TokenService {
        TokenService::new(
            TokenKeys::hmac("unit-test-secret"),
            30,
            7,
            Arc::new(InMemoryCounterStore::new()),
        )
    }

    #[tokio::test]
    async fn issue_and_validate_access() {
        let svc = service();
        let pair = svc
            .issue_pair("t-1", "p-1", vec!["conversation:read".into()])
            .unwrap();
        let claims = svc.validate(&pair.access_token, TokenType::Access).await.unwrap();
        assert_eq!(claims.tenant_id, "t-1");
        assert_eq!(claims.principal_id, "p-1");
        assert_eq!(claims.permissions, vec!["conversation:read"]);
        assert_eq!(claims.token_version, 1);
    }

    #[tokio::test]
    async fn refresh_token_cannot_act_as_access() {
        let svc = service();
        let pair = svc.issue_pair("t-1", "p-1", vec![]).unwrap();
        assert!(svc
            .validate(&pair.refresh_token, TokenType::Access)
            .await
            .is_err());
        assert!(svc
            .validate(&pair.refresh_token, TokenType::Refresh)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn revoked_token_stays_dead() {
        let svc = service();
        let pair = svc.issue_pair("t-1", "p-1", vec![]).unwrap();
        let claims = svc.validate(&pair.access_token, TokenType::Access).await.unwrap();
        svc.revoke(&claims).await.unwrap();

        for _ in 0..3 {
            assert!(svc
                .validate(&pair.access_token, TokenType::Access)
                .await
                .is_err());
        }
    }

    #[tokio::test]
    async fn refresh_exchange_uses_current_permissions() {
        let svc = service();
        let pair = svc
            .issue_pair("t-1", "p-1", vec!["conversation:read".into()])
            .unwrap();
        let (access, _) = svc
            .refresh(&pair.refresh_token, vec!["conversation:read".into(), "lead:read".into()])
            .await
            .unwrap();
        let claims = svc.validate(&access, TokenType::Access).await.unwrap();
        assert!(claims.permissions.contains(&"lead:read".to_string()));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let svc = service();
        let other = TokenService::new(
            TokenKeys::hmac("different-secret"),
            30,
            7,
            Arc::new(InMemoryCounterStore::new()),
        );
        let pair = svc.issue_pair("t-1", "p-1", vec![]).unwrap();
        assert!(other
            .validate(&pair.access_token, TokenType::Access)
            .await
            .is_err());
    }
}
