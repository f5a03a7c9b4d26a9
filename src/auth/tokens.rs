// Signed access and refresh tokens.
//
// Signing keys are a list: the first key signs, every key is tried for
// verification, so keys can be rotated without invalidating outstanding
// tokens.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{Result, TreeError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityClaim {
    /// Identity provider name.
    pub prv: String,
    /// External id with that provider.
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Principal UUID.
    pub sub: String,
    pub ids: Vec<IdentityClaim>,
    /// Effective scopes at issue time.
    pub scp: Vec<String>,
    /// Session UUID.
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: String,
    pub sid: String,
    /// Session refresh counter at issue time. A refresh presented with a
    /// stale counter is a replay of a rotated-out token.
    pub cnt: i64,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub token_type: String,
}

pub struct TokenSigner {
    keys: Vec<String>,
}

impl TokenSigner {
    pub fn new(keys: Vec<String>) -> Result<Self> {
        if keys.is_empty() {
            return Err(TreeError::Config(
                "token signing requires at least one secret key".into(),
            ));
        }
        Ok(Self { keys })
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        // Claims are ours; no audience/issuer registered.
        validation.required_spec_claims.clear();
        validation
    }

    pub fn encode_access(
        &self,
        principal_uuid: Uuid,
        identities: Vec<IdentityClaim>,
        scopes: Vec<String>,
        session_uuid: Uuid,
        max_age_seconds: i64,
    ) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = AccessClaims {
            sub: principal_uuid.to_string(),
            ids: identities,
            scp: scopes,
            sid: session_uuid.to_string(),
            iat: now,
            exp: now + max_age_seconds,
            token_type: "access".to_string(),
        };
        self.sign(&claims)
    }

    pub fn encode_refresh(
        &self,
        principal_uuid: Uuid,
        session_uuid: Uuid,
        refresh_count: i64,
        max_age_seconds: i64,
    ) -> Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = RefreshClaims {
            sub: principal_uuid.to_string(),
            sid: session_uuid.to_string(),
            cnt: refresh_count,
            iat: now,
            exp: now + max_age_seconds,
            token_type: "refresh".to_string(),
        };
        self.sign(&claims)
    }

    fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let key = EncodingKey::from_secret(self.keys[0].as_bytes());
        encode(&Header::new(Algorithm::HS256), claims, &key)
            .map_err(|e| TreeError::Internal(anyhow::anyhow!("failed to sign token: {e}")))
    }

    fn verify<T: serde::de::DeserializeOwned>(&self, token: &str) -> Result<T> {
        let validation = Self::validation();
        for key in &self.keys {
            let decoding = DecodingKey::from_secret(key.as_bytes());
            match decode::<T>(token, &decoding, &validation) {
                Ok(data) => return Ok(data.claims),
                Err(_) => continue,
            }
        }
        Err(TreeError::AuthRequired)
    }

    pub fn decode_access(&self, token: &str) -> Result<AccessClaims> {
        let claims: AccessClaims = self.verify(token)?;
        if claims.token_type != "access" {
            return Err(TreeError::AuthRequired);
        }
        Ok(claims)
    }

    pub fn decode_refresh(&self, token: &str) -> Result<RefreshClaims> {
        let claims: RefreshClaims = self.verify(token)?;
        if claims.token_type != "refresh" {
            return Err(TreeError::AuthRequired);
        }
        Ok(claims)
    }
}
