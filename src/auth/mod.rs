// Authentication core: principals, identities, roles, sessions, and API
// keys, persisted alongside the catalog, plus the provider-facing service
// that turns successful logins into token pairs.

pub mod api_keys;
pub mod tokens;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::Digest;
use sqlx::{AnyPool, Row};
use std::collections::BTreeSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::access::PolicyPrincipal;
use crate::catalog::translate::{
    execute, fetch_all, fetch_optional, BindValue, Dialect, SqlBuilder,
};
use crate::config::{AdminIdentity, AuthConfig, ProviderConfig, ProviderMode};
use crate::errors::{Result, TreeError};
use crate::scopes;
use tokens::{IdentityClaim, TokenSigner};

pub const ROLE_USER: &str = "user";
pub const ROLE_ADMIN: &str = "admin";

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    User,
    Service,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::User => "user",
            PrincipalType::Service => "service",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(PrincipalType::User),
            "service" => Ok(PrincipalType::Service),
            other => Err(TreeError::Internal(anyhow::anyhow!(
                "unknown principal type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub provider: String,
    pub external_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Role {
    pub name: String,
    pub scopes: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Principal {
    pub id: i64,
    pub uuid: Uuid,
    pub principal_type: PrincipalType,
    pub identities: Vec<Identity>,
    pub roles: Vec<Role>,
}

impl Principal {
    /// Union of the scopes granted by this principal's roles.
    pub fn role_scopes(&self) -> BTreeSet<String> {
        self.roles
            .iter()
            .flat_map(|role| role.scopes.iter().cloned())
            .collect()
    }

    pub fn policy_principal(&self) -> PolicyPrincipal {
        match self.principal_type {
            PrincipalType::User => PolicyPrincipal::User {
                uuid: self.uuid,
                identities: self
                    .identities
                    .iter()
                    .map(|identity| (identity.provider.clone(), identity.external_id.clone()))
                    .collect(),
            },
            PrincipalType::Service => PolicyPrincipal::Service { uuid: self.uuid },
        }
    }
}

/// The authenticated subject of one request: the principal plus the
/// effective scopes of the credential actually presented.
#[derive(Debug, Clone)]
pub struct PrincipalContext {
    pub principal: Principal,
    pub scopes: BTreeSet<String>,
    pub session_id: Option<Uuid>,
}

impl PrincipalContext {
    pub fn policy_principal(&self) -> PolicyPrincipal {
        self.principal.policy_principal()
    }
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub uuid: Uuid,
    pub principal_id: i64,
    pub expiration_time: i64,
    pub revoked: bool,
    pub refresh_count: i64,
    pub time_created: i64,
    pub time_last_refreshed: Option<i64>,
}

/// API key attributes safe to show back to the owner.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    pub first_eight: String,
    pub expiration_time: Option<i64>,
    pub latest_activity: Option<i64>,
    pub note: Option<String>,
    pub scopes: Vec<String>,
    pub access_tags: Option<Vec<String>>,
    pub time_created: i64,
}

/// The refresh-endpoint response shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    pub refresh_token: String,
    pub refresh_token_expires_in: i64,
    pub token_type: String,
}

pub struct AuthService {
    pool: AnyPool,
    dialect: Dialect,
    signer: TokenSigner,
    pub config: AuthConfig,
}

impl AuthService {
    pub fn new(pool: AnyPool, dialect: Dialect, config: AuthConfig) -> Result<Self> {
        let keys = if config.secret_keys.is_empty() {
            // No configured keys: sign with an ephemeral secret. Tokens do
            // not survive a restart, which is fine for single-user use.
            vec![api_keys::generate_secret()]
        } else {
            config.secret_keys.clone()
        };
        Ok(Self {
            pool,
            dialect,
            signer: TokenSigner::new(keys)?,
            config,
        })
    }

    fn builder(&self) -> SqlBuilder {
        SqlBuilder::new(self.dialect)
    }

    /// Create the built-in "user" and "admin" roles if absent.
    pub async fn ensure_default_roles(&self) -> Result<()> {
        for (name, role_scopes) in [
            (ROLE_USER, scopes::user_scopes()),
            (ROLE_ADMIN, scopes::all_scopes()),
        ] {
            let mut builder = self.builder();
            builder.push("SELECT id FROM roles WHERE name = ");
            builder.bind(BindValue::Text(name.to_string()));
            let (sql, binds) = builder.finish();
            if fetch_optional(&self.pool, &sql, &binds).await?.is_none() {
                let mut builder = self.builder();
                builder.push("INSERT INTO roles (name, scopes) VALUES (");
                builder.bind(BindValue::Text(name.to_string()));
                builder.push(", ");
                builder.bind_json(
                    serde_json::to_string(&role_scopes.iter().collect::<Vec<_>>())
                        .map_err(anyhow::Error::from)?,
                );
                builder.push(")");
                let (sql, binds) = builder.finish();
                execute(&self.pool, &sql, &binds).await?;
            }
        }
        Ok(())
    }

    /// Promote the configured admin identities, creating their principals
    /// on first sight.
    pub async fn ensure_admins(&self, admins: &[AdminIdentity]) -> Result<()> {
        for admin in admins {
            let principal = self
                .upsert_principal(&admin.provider, &admin.id, PrincipalType::User)
                .await?;
            self.assign_role(principal.id, ROLE_ADMIN).await?;
            info!(provider = %admin.provider, id = %admin.id, "ensured admin role");
        }
        Ok(())
    }

    async fn assign_role(&self, principal_id: i64, role_name: &str) -> Result<()> {
        let mut builder = self.builder();
        builder.push("SELECT id FROM roles WHERE name = ");
        builder.bind(BindValue::Text(role_name.to_string()));
        let (sql, binds) = builder.finish();
        let role_id: i64 = fetch_optional(&self.pool, &sql, &binds)
            .await?
            .ok_or_else(|| {
                TreeError::Internal(anyhow::anyhow!("role {role_name:?} is not defined"))
            })?
            .try_get("id")?;
        let mut builder = self.builder();
        match self.dialect {
            Dialect::Sqlite => {
                builder.push("INSERT OR IGNORE INTO principal_roles (principal_id, role_id) VALUES (");
            }
            Dialect::Postgres => {
                builder.push("INSERT INTO principal_roles (principal_id, role_id) VALUES (");
            }
        }
        builder.bind(BindValue::Int(principal_id));
        builder.push(", ");
        builder.bind(BindValue::Int(role_id));
        builder.push(")");
        if self.dialect == Dialect::Postgres {
            builder.push(" ON CONFLICT DO NOTHING");
        }
        let (sql, binds) = builder.finish();
        execute(&self.pool, &sql, &binds).await?;
        Ok(())
    }

    /// Find or create the principal owning (provider, external_id). First
    /// login creates the principal and grants the default user role.
    pub async fn upsert_principal(
        &self,
        provider: &str,
        external_id: &str,
        principal_type: PrincipalType,
    ) -> Result<Principal> {
        let mut builder = self.builder();
        builder.push("SELECT principal_id FROM identities WHERE provider = ");
        builder.bind(BindValue::Text(provider.to_string()));
        builder.push(" AND external_id = ");
        builder.bind(BindValue::Text(external_id.to_string()));
        let (sql, binds) = builder.finish();
        if let Some(row) = fetch_optional(&self.pool, &sql, &binds).await? {
            let principal_id: i64 = row.try_get("principal_id")?;
            return self.load_principal(principal_id).await;
        }

        let uuid = Uuid::new_v4();
        let mut builder = self.builder();
        builder.push(
            "INSERT INTO principals (uuid, principal_type, time_created, time_updated) \
             VALUES (",
        );
        builder.bind(BindValue::Text(uuid.to_string()));
        builder.push(", ");
        builder.bind(BindValue::Text(principal_type.as_str().to_string()));
        builder.push(", ");
        builder.bind(BindValue::Int(now()));
        builder.push(", ");
        builder.bind(BindValue::Int(now()));
        builder.push(") RETURNING id");
        let (sql, binds) = builder.finish();
        let principal_id: i64 = fetch_optional(&self.pool, &sql, &binds)
            .await?
            .ok_or_else(|| TreeError::Internal(anyhow::anyhow!("INSERT returned no id")))?
            .try_get("id")?;

        let mut builder = self.builder();
        builder.push(
            "INSERT INTO identities (provider, external_id, principal_id, time_created) \
             VALUES (",
        );
        builder.bind(BindValue::Text(provider.to_string()));
        builder.push(", ");
        builder.bind(BindValue::Text(external_id.to_string()));
        builder.push(", ");
        builder.bind(BindValue::Int(principal_id));
        builder.push(", ");
        builder.bind(BindValue::Int(now()));
        builder.push(")");
        let (sql, binds) = builder.finish();
        execute(&self.pool, &sql, &binds).await?;

        self.assign_role(principal_id, ROLE_USER).await?;
        info!(provider, external_id, "created principal on first login");
        self.load_principal(principal_id).await
    }

    pub async fn load_principal(&self, principal_id: i64) -> Result<Principal> {
        let mut builder = self.builder();
        builder.push("SELECT id, uuid, principal_type FROM principals WHERE id = ");
        builder.bind(BindValue::Int(principal_id));
        let (sql, binds) = builder.finish();
        let row = fetch_optional(&self.pool, &sql, &binds)
            .await?
            .ok_or_else(|| TreeError::NotFound(format!("no principal {principal_id}")))?;
        self.hydrate_principal(&row).await
    }

    pub async fn load_principal_by_uuid(&self, uuid: &Uuid) -> Result<Option<Principal>> {
        let mut builder = self.builder();
        builder.push("SELECT id, uuid, principal_type FROM principals WHERE uuid = ");
        builder.bind(BindValue::Text(uuid.to_string()));
        let (sql, binds) = builder.finish();
        match fetch_optional(&self.pool, &sql, &binds).await? {
            Some(row) => Ok(Some(self.hydrate_principal(&row).await?)),
            None => Ok(None),
        }
    }

    async fn hydrate_principal(&self, row: &sqlx::any::AnyRow) -> Result<Principal> {
        let id: i64 = row.try_get("id")?;
        let uuid_text: String = row.try_get("uuid")?;
        let type_text: String = row.try_get("principal_type")?;

        let mut builder = self.builder();
        builder.push("SELECT provider, external_id FROM identities WHERE principal_id = ");
        builder.bind(BindValue::Int(id));
        let (sql, binds) = builder.finish();
        let identity_rows = fetch_all(&self.pool, &sql, &binds).await?;
        let identities = identity_rows
            .iter()
            .map(|row| {
                Ok(Identity {
                    provider: row.try_get("provider")?,
                    external_id: row.try_get("external_id")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let scopes_column = match self.dialect {
            Dialect::Sqlite => "roles.scopes",
            Dialect::Postgres => "roles.scopes::text",
        };
        let mut builder = self.builder();
        builder.push(&format!(
            "SELECT roles.name AS name, {scopes_column} AS scopes FROM roles \
             JOIN principal_roles ON principal_roles.role_id = roles.id \
             WHERE principal_roles.principal_id = "
        ));
        builder.bind(BindValue::Int(id));
        let (sql, binds) = builder.finish();
        let role_rows = fetch_all(&self.pool, &sql, &binds).await?;
        let roles = role_rows
            .iter()
            .map(|row| {
                let scopes_text: String = row.try_get("scopes")?;
                let scopes: BTreeSet<String> =
                    serde_json::from_str(&scopes_text).map_err(anyhow::Error::from)?;
                Ok(Role {
                    name: row.try_get("name")?,
                    scopes,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Principal {
            id,
            uuid: Uuid::parse_str(&uuid_text).map_err(anyhow::Error::from)?,
            principal_type: PrincipalType::parse(&type_text)?,
            identities,
            roles,
        })
    }

    // ------------------------------------------------------------------
    // Sessions and tokens

    pub async fn create_session(&self, principal: &Principal) -> Result<SessionRow> {
        let uuid = Uuid::new_v4();
        let timestamp = now();
        let mut builder = self.builder();
        builder.push(
            "INSERT INTO sessions (uuid, principal_id, expiration_time, revoked, \
             refresh_count, time_created) VALUES (",
        );
        builder.bind(BindValue::Text(uuid.to_string()));
        builder.push(", ");
        builder.bind(BindValue::Int(principal.id));
        builder.push(", ");
        builder.bind(BindValue::Int(timestamp + self.config.refresh_token_max_age));
        builder.push(", 0, 0, ");
        builder.bind(BindValue::Int(timestamp));
        builder.push(")");
        let (sql, binds) = builder.finish();
        execute(&self.pool, &sql, &binds).await?;
        self.get_session(&uuid)
            .await?
            .ok_or_else(|| TreeError::Internal(anyhow::anyhow!("created session vanished")))
    }

    pub async fn get_session(&self, uuid: &Uuid) -> Result<Option<SessionRow>> {
        let mut builder = self.builder();
        builder.push(
            "SELECT id, uuid, principal_id, expiration_time, revoked, refresh_count, \
             time_created, time_last_refreshed FROM sessions WHERE uuid = ",
        );
        builder.bind(BindValue::Text(uuid.to_string()));
        let (sql, binds) = builder.finish();
        let Some(row) = fetch_optional(&self.pool, &sql, &binds).await? else {
            return Ok(None);
        };
        let uuid_text: String = row.try_get("uuid")?;
        let revoked: i64 = row.try_get("revoked")?;
        Ok(Some(SessionRow {
            id: row.try_get("id")?,
            uuid: Uuid::parse_str(&uuid_text).map_err(anyhow::Error::from)?,
            principal_id: row.try_get("principal_id")?,
            expiration_time: row.try_get("expiration_time")?,
            revoked: revoked != 0,
            refresh_count: row.try_get("refresh_count")?,
            time_created: row.try_get("time_created")?,
            time_last_refreshed: row.try_get("time_last_refreshed")?,
        }))
    }

    fn identity_claims(principal: &Principal) -> Vec<IdentityClaim> {
        principal
            .identities
            .iter()
            .map(|identity| IdentityClaim {
                prv: identity.provider.clone(),
                id: identity.external_id.clone(),
            })
            .collect()
    }

    /// Mint an access + refresh pair for an open session.
    pub fn issue_tokens(
        &self,
        principal: &Principal,
        session: &SessionRow,
    ) -> Result<TokenResponse> {
        let scopes: Vec<String> = principal.role_scopes().into_iter().collect();
        let access_token = self.signer.encode_access(
            principal.uuid,
            Self::identity_claims(principal),
            scopes,
            session.uuid,
            self.config.access_token_max_age,
        )?;
        let refresh_token = self.signer.encode_refresh(
            principal.uuid,
            session.uuid,
            session.refresh_count,
            self.config.refresh_token_max_age,
        )?;
        Ok(TokenResponse {
            access_token,
            expires_in: self.config.access_token_max_age,
            refresh_token,
            refresh_token_expires_in: self.config.refresh_token_max_age,
            token_type: "bearer".to_string(),
        })
    }

    /// Password-provider login. Verifies the credentials against the
    /// provider's dictionary, then opens a session.
    pub async fn authenticate_password(
        &self,
        provider: &ProviderConfig,
        username: &str,
        password: &str,
    ) -> Result<TokenResponse> {
        if provider.mode != ProviderMode::Password {
            return Err(TreeError::Unprocessable(format!(
                "provider {:?} does not accept password credentials",
                provider.provider
            )));
        }
        let stored = provider.users.get(username).ok_or(TreeError::AuthRequired)?;
        let presented = hex::encode(sha2::Sha256::digest(password.as_bytes()));
        let expected = hex::encode(sha2::Sha256::digest(stored.as_bytes()));
        if !api_keys::digests_match(&presented, &expected) {
            warn!(username, provider = %provider.provider, "failed password login");
            return Err(TreeError::AuthRequired);
        }
        let principal = self
            .upsert_principal(&provider.provider, username, PrincipalType::User)
            .await?;
        let session = self.create_session(&principal).await?;
        self.issue_tokens(&principal, &session)
    }

    /// External (authorization-code) provider login. The provider's
    /// dictionary maps codes to external ids; a real deployment exchanges
    /// the code with the identity provider instead.
    pub async fn authenticate_code(
        &self,
        provider: &ProviderConfig,
        code: &str,
    ) -> Result<TokenResponse> {
        if provider.mode != ProviderMode::External {
            return Err(TreeError::Unprocessable(format!(
                "provider {:?} does not accept authorization codes",
                provider.provider
            )));
        }
        let external_id = provider.users.get(code).ok_or(TreeError::AuthRequired)?;
        let principal = self
            .upsert_principal(&provider.provider, external_id, PrincipalType::User)
            .await?;
        let session = self.create_session(&principal).await?;
        self.issue_tokens(&principal, &session)
    }

    /// Refresh-token rotation. Any failed check deletes the session and
    /// returns 401, so a replayed token revokes the whole chain.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let claims = self.signer.decode_refresh(refresh_token)?;
        let session_uuid = Uuid::parse_str(&claims.sid).map_err(|_| TreeError::AuthRequired)?;
        let Some(session) = self.get_session(&session_uuid).await? else {
            return Err(TreeError::AuthRequired);
        };
        let timestamp = now();
        let expired = session.revoked
            || session.expiration_time <= timestamp
            || claims.cnt != session.refresh_count
            || timestamp - session.time_created >= self.config.session_max_age;
        if expired {
            self.delete_session(&session_uuid).await?;
            return Err(TreeError::AuthRequired);
        }
        let mut builder = self.builder();
        builder.push("UPDATE sessions SET refresh_count = refresh_count + 1, ");
        builder.push("time_last_refreshed = ");
        builder.bind(BindValue::Int(timestamp));
        builder.push(", expiration_time = ");
        builder.bind(BindValue::Int(timestamp + self.config.refresh_token_max_age));
        builder.push(" WHERE id = ");
        builder.bind(BindValue::Int(session.id));
        let (sql, binds) = builder.finish();
        execute(&self.pool, &sql, &binds).await?;

        let session = self
            .get_session(&session_uuid)
            .await?
            .ok_or(TreeError::AuthRequired)?;
        let principal = self.load_principal(session.principal_id).await?;
        self.issue_tokens(&principal, &session)
    }

    pub async fn revoke_session(&self, uuid: &Uuid) -> Result<()> {
        let mut builder = self.builder();
        builder.push("UPDATE sessions SET revoked = 1 WHERE uuid = ");
        builder.bind(BindValue::Text(uuid.to_string()));
        let (sql, binds) = builder.finish();
        let result = execute(&self.pool, &sql, &binds).await?;
        if result.rows_affected() == 0 {
            return Err(TreeError::NotFound(format!("no session {uuid}")));
        }
        Ok(())
    }

    pub async fn delete_session(&self, uuid: &Uuid) -> Result<()> {
        let mut builder = self.builder();
        builder.push("DELETE FROM sessions WHERE uuid = ");
        builder.bind(BindValue::Text(uuid.to_string()));
        let (sql, binds) = builder.finish();
        execute(&self.pool, &sql, &binds).await?;
        Ok(())
    }

    pub async fn purge_expired_sessions(&self) -> Result<u64> {
        let mut builder = self.builder();
        builder.push("DELETE FROM sessions WHERE expiration_time <= ");
        builder.bind(BindValue::Int(now()));
        let (sql, binds) = builder.finish();
        let result = execute(&self.pool, &sql, &binds).await?;
        Ok(result.rows_affected())
    }

    pub async fn purge_expired_api_keys(&self) -> Result<u64> {
        let mut builder = self.builder();
        builder.push(
            "DELETE FROM api_keys WHERE expiration_time IS NOT NULL AND expiration_time <= ",
        );
        builder.bind(BindValue::Int(now()));
        let (sql, binds) = builder.finish();
        let result = execute(&self.pool, &sql, &binds).await?;
        Ok(result.rows_affected())
    }

    /// Validate an access token and build the request context. Scopes are
    /// the token's scopes intersected with the principal's current roles,
    /// so a role downgrade takes effect before token expiry.
    pub async fn authenticate_bearer(&self, token: &str) -> Result<PrincipalContext> {
        let claims = self.signer.decode_access(token)?;
        let principal_uuid =
            Uuid::parse_str(&claims.sub).map_err(|_| TreeError::AuthRequired)?;
        let principal = self
            .load_principal_by_uuid(&principal_uuid)
            .await?
            .ok_or(TreeError::AuthRequired)?;
        let token_scopes: BTreeSet<String> = claims.scp.into_iter().collect();
        let scopes = token_scopes
            .intersection(&principal.role_scopes())
            .cloned()
            .collect();
        let session_id = Uuid::parse_str(&claims.sid).ok();
        Ok(PrincipalContext {
            principal,
            scopes,
            session_id,
        })
    }

    // ------------------------------------------------------------------
    // API keys

    /// Create an API key for the principal. The secret is returned once
    /// and never stored.
    pub async fn create_api_key(
        &self,
        principal: &Principal,
        requested_scopes: Option<Vec<String>>,
        expires_in: Option<i64>,
        note: Option<String>,
        access_tags: Option<Vec<String>>,
    ) -> Result<(String, ApiKeyInfo)> {
        let role_scopes = principal.role_scopes();
        let key_scopes = match requested_scopes {
            Some(scopes) => {
                let requested: BTreeSet<String> = scopes.iter().cloned().collect();
                if !requested.is_subset(&role_scopes) {
                    return Err(TreeError::Forbidden(format!(
                        "cannot create a key with scopes beyond your own: {:?}",
                        requested.difference(&role_scopes).collect::<Vec<_>>()
                    )));
                }
                scopes
            }
            // Inherit: the key carries the principal's full role scopes.
            None => role_scopes.iter().cloned().collect(),
        };
        let secret = api_keys::generate_secret();
        let first_eight = api_keys::first_eight(&secret)
            .ok_or_else(|| TreeError::Internal(anyhow::anyhow!("secret too short")))?
            .to_string();
        let hashed = api_keys::hash_secret(&secret)
            .ok_or_else(|| TreeError::Internal(anyhow::anyhow!("secret not hex")))?;
        let timestamp = now();
        let expiration_time = expires_in.map(|seconds| timestamp + seconds);

        let mut builder = self.builder();
        builder.push(
            "INSERT INTO api_keys (first_eight, hashed_secret, principal_id, \
             expiration_time, note, scopes, access_tags, time_created) VALUES (",
        );
        builder.bind(BindValue::Text(first_eight.clone()));
        builder.push(", ");
        builder.bind(BindValue::Text(hashed));
        builder.push(", ");
        builder.bind(BindValue::Int(principal.id));
        builder.push(", ");
        match expiration_time {
            Some(t) => {
                builder.bind(BindValue::Int(t));
            }
            None => {
                builder.push("NULL");
            }
        }
        builder.push(", ");
        match &note {
            Some(text) => {
                builder.bind(BindValue::Text(text.clone()));
            }
            None => {
                builder.push("NULL");
            }
        }
        builder.push(", ");
        builder.bind_json(serde_json::to_string(&key_scopes).map_err(anyhow::Error::from)?);
        builder.push(", ");
        match &access_tags {
            Some(tags) => {
                builder.bind_json(serde_json::to_string(tags).map_err(anyhow::Error::from)?);
            }
            None => {
                builder.push("NULL");
            }
        }
        builder.push(", ");
        builder.bind(BindValue::Int(timestamp));
        builder.push(")");
        let (sql, binds) = builder.finish();
        execute(&self.pool, &sql, &binds).await?;

        Ok((
            secret,
            ApiKeyInfo {
                first_eight,
                expiration_time,
                latest_activity: None,
                note,
                scopes: key_scopes,
                access_tags,
                time_created: timestamp,
            },
        ))
    }

    fn api_key_columns(&self) -> &'static str {
        match self.dialect {
            Dialect::Sqlite => {
                "id, first_eight, hashed_secret, principal_id, expiration_time, \
                 latest_activity, note, scopes, access_tags, time_created"
            }
            Dialect::Postgres => {
                "id, first_eight, hashed_secret, principal_id, expiration_time, \
                 latest_activity, note, scopes::text AS scopes, \
                 access_tags::text AS access_tags, time_created"
            }
        }
    }

    /// Authenticate a presented API key: prefix match, timing-safe digest
    /// compare, expiration and principal checks, activity bump.
    pub async fn authenticate_api_key(&self, secret: &str) -> Result<PrincipalContext> {
        let Some(prefix) = api_keys::first_eight(secret) else {
            return Err(TreeError::AuthRequired);
        };
        let Some(presented_hash) = api_keys::hash_secret(secret) else {
            return Err(TreeError::AuthRequired);
        };
        let mut builder = self.builder();
        builder.push(&format!(
            "SELECT {} FROM api_keys WHERE first_eight = ",
            self.api_key_columns()
        ));
        builder.bind(BindValue::Text(prefix.to_string()));
        let (sql, binds) = builder.finish();
        let rows = fetch_all(&self.pool, &sql, &binds).await?;
        for row in &rows {
            let stored_hash: String = row.try_get("hashed_secret")?;
            if !api_keys::digests_match(&stored_hash, &presented_hash) {
                continue;
            }
            let expiration_time: Option<i64> = row.try_get("expiration_time")?;
            if let Some(expiration) = expiration_time {
                if expiration <= now() {
                    return Err(TreeError::AuthRequired);
                }
            }
            let principal_id: i64 = row.try_get("principal_id")?;
            let principal = self.load_principal(principal_id).await?;
            let key_id: i64 = row.try_get("id")?;
            let mut builder = self.builder();
            builder.push("UPDATE api_keys SET latest_activity = ");
            builder.bind(BindValue::Int(now()));
            builder.push(" WHERE id = ");
            builder.bind(BindValue::Int(key_id));
            let (sql, binds) = builder.finish();
            execute(&self.pool, &sql, &binds).await?;

            let scopes_text: String = row.try_get("scopes")?;
            let key_scopes: BTreeSet<String> =
                serde_json::from_str(&scopes_text).map_err(anyhow::Error::from)?;
            let scopes = key_scopes
                .intersection(&principal.role_scopes())
                .cloned()
                .collect();
            return Ok(PrincipalContext {
                principal,
                scopes,
                session_id: None,
            });
        }
        Err(TreeError::AuthRequired)
    }

    pub async fn list_api_keys(&self, principal_id: i64) -> Result<Vec<ApiKeyInfo>> {
        let mut builder = self.builder();
        builder.push(&format!(
            "SELECT {} FROM api_keys WHERE principal_id = ",
            self.api_key_columns()
        ));
        builder.bind(BindValue::Int(principal_id));
        builder.push(" ORDER BY time_created ASC");
        let (sql, binds) = builder.finish();
        let rows = fetch_all(&self.pool, &sql, &binds).await?;
        rows.iter()
            .map(|row| {
                let scopes_text: String = row.try_get("scopes")?;
                let access_tags_text: Option<String> = row.try_get("access_tags")?;
                Ok(ApiKeyInfo {
                    first_eight: row.try_get("first_eight")?,
                    expiration_time: row.try_get("expiration_time")?,
                    latest_activity: row.try_get("latest_activity")?,
                    note: row.try_get("note")?,
                    scopes: serde_json::from_str(&scopes_text).map_err(anyhow::Error::from)?,
                    access_tags: access_tags_text
                        .map(|text| serde_json::from_str(&text).map_err(anyhow::Error::from))
                        .transpose()?,
                    time_created: row.try_get("time_created")?,
                })
            })
            .collect()
    }

    pub async fn revoke_api_key(&self, principal_id: i64, first_eight: &str) -> Result<()> {
        let mut builder = self.builder();
        builder.push("DELETE FROM api_keys WHERE principal_id = ");
        builder.bind(BindValue::Int(principal_id));
        builder.push(" AND first_eight = ");
        builder.bind(BindValue::Text(first_eight.to_string()));
        let (sql, binds) = builder.finish();
        let result = execute(&self.pool, &sql, &binds).await?;
        if result.rows_affected() == 0 {
            return Err(TreeError::NotFound(format!("no API key {first_eight}")));
        }
        Ok(())
    }

    /// Expose principal attributes for the whoami route.
    pub fn describe_principal(principal: &Principal) -> JsonValue {
        serde_json::json!({
            "uuid": principal.uuid,
            "type": principal.principal_type.as_str(),
            "identities": principal.identities,
            "roles": principal.roles.iter().map(|r| &r.name).collect::<Vec<_>>(),
        })
    }
}
