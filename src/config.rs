// Parsed server configuration.
//
// Configuration *file* loading is the embedder's concern; this module only
// defines the deserialized shape and its validation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::errors::TreeError;
use crate::scopes;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, e.g. "127.0.0.1:8000".
    pub listen: SocketAddr,
    /// Catalog database URI: "sqlite::memory:", "sqlite:/path/to.db", or
    /// "postgres://user@host/db".
    pub database_uri: String,
    /// Initialize the catalog schema when the database is empty.
    #[serde(default)]
    pub init_if_not_exists: bool,
    /// Directories external assets may be served from.
    #[serde(default)]
    pub readable_storage: Vec<PathBuf>,
    /// Directory new internally-managed assets are created under.
    #[serde(default)]
    pub writable_storage: Option<PathBuf>,
    #[serde(default)]
    pub authentication: AuthConfig,
    /// Tag-based access policy configuration; None means open access.
    #[serde(default)]
    pub access_policy: Option<PolicyConfig>,
    /// Responses below this many bytes are never compressed.
    #[serde(default = "default_compression_minimum_size")]
    pub compression_minimum_size: usize,
    /// Object cache budget in bytes; 0 disables the cache.
    #[serde(default)]
    pub object_cache_available_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Keys used to sign and verify tokens. The first key signs; all keys
    /// are tried for verification, permitting rotation.
    pub secret_keys: Vec<String>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub allow_anonymous_access: bool,
    /// Seconds an access token remains valid.
    #[serde(default = "default_access_token_max_age")]
    pub access_token_max_age: i64,
    /// Seconds a refresh token remains valid.
    #[serde(default = "default_refresh_token_max_age")]
    pub refresh_token_max_age: i64,
    /// Absolute ceiling, in seconds, on the life of a session regardless
    /// of refresh activity.
    #[serde(default = "default_session_max_age")]
    pub session_max_age: i64,
    /// Identities promoted to the admin role at startup.
    #[serde(default)]
    pub admins: Vec<AdminIdentity>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_keys: Vec::new(),
            providers: Vec::new(),
            allow_anonymous_access: false,
            access_token_max_age: default_access_token_max_age(),
            refresh_token_max_age: default_refresh_token_max_age(),
            session_max_age: default_session_max_age(),
            admins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider name, used in identity rows and route paths.
    pub provider: String,
    pub mode: ProviderMode,
    /// Dictionary credentials. Password mode: username -> password.
    /// External mode: authorization code -> external id. Real deployments
    /// supply an external verifier instead.
    #[serde(default)]
    pub users: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    Password,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminIdentity {
    pub provider: String,
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Identity provider whose ids are used as policy identifiers.
    pub provider: String,
    /// The raw tag definitions (roles / tags / tag_owners), as parsed from
    /// the policy YAML document.
    pub tag_definitions: crate::access::tags::TagDefinitions,
    /// Scope universe; defaults to the full built-in set.
    #[serde(default)]
    pub scopes: Option<BTreeSet<String>>,
    /// Minutes between full policy reloads.
    #[serde(default = "default_reload_period_minutes")]
    pub reload_period_minutes: u64,
    /// Minutes between partial (additive) policy updates.
    #[serde(default = "default_update_period_minutes")]
    pub update_period_minutes: u64,
}

fn default_compression_minimum_size() -> usize {
    1000
}

fn default_access_token_max_age() -> i64 {
    15 * 60
}

fn default_refresh_token_max_age() -> i64 {
    7 * 24 * 60 * 60
}

fn default_session_max_age() -> i64 {
    365 * 24 * 60 * 60
}

fn default_reload_period_minutes() -> u64 {
    60
}

fn default_update_period_minutes() -> u64 {
    5
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), TreeError> {
        if !self.authentication.providers.is_empty()
            && self.authentication.secret_keys.is_empty()
        {
            return Err(TreeError::Config(
                "authentication providers require at least one secret key".into(),
            ));
        }
        if let Some(policy) = &self.access_policy {
            if let Some(universe) = &policy.scopes {
                if !universe.is_subset(&scopes::all_scopes()) {
                    return Err(TreeError::Config(format!(
                        "unknown scopes in policy configuration: {:?}",
                        universe
                            .difference(&scopes::all_scopes())
                            .collect::<Vec<_>>()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_providers_require_secret_keys() {
        let config = ServerConfig {
            listen: "127.0.0.1:8000".parse().unwrap(),
            database_uri: "sqlite::memory:".into(),
            init_if_not_exists: true,
            readable_storage: vec![],
            writable_storage: None,
            authentication: AuthConfig {
                providers: vec![ProviderConfig {
                    provider: "toy".into(),
                    mode: ProviderMode::Password,
                    users: Default::default(),
                }],
                ..Default::default()
            },
            access_policy: None,
            compression_minimum_size: 1000,
            object_cache_available_bytes: 0,
        };
        assert!(config.validate().is_err());
    }
}
