// Access policy contract.
//
// A policy answers two questions: which scopes a principal holds on a
// given node, and which filter queries must be conjoined with a search so
// that results are limited to what the principal may see. The two answers
// must be consistent with each other.

pub mod tags;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::errors::Result;
use crate::queries::Query;
use crate::scopes;

/// The policy's view of the requesting principal. `Public` is the
/// anonymous principal, available when the server permits anonymous
/// access.
#[derive(Debug, Clone)]
pub enum PolicyPrincipal {
    User {
        uuid: Uuid,
        /// (provider, external id) pairs.
        identities: Vec<(String, String)>,
    },
    Service {
        uuid: Uuid,
    },
    Public,
}

impl PolicyPrincipal {
    /// The identifier this policy knows the principal by: the external id
    /// from the policy's provider for users, the UUID for services.
    pub fn identifier(&self, provider: &str) -> Option<String> {
        match self {
            PolicyPrincipal::User { identities, .. } => identities
                .iter()
                .find(|(p, _)| p == provider)
                .map(|(_, id)| id.clone()),
            PolicyPrincipal::Service { uuid } => Some(uuid.to_string()),
            PolicyPrincipal::Public => None,
        }
    }
}

/// Search filters computed by a policy. `NoAccess` means the requested
/// scopes cannot be satisfied at all; the HTTP layer maps it to 403.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyFilters {
    Queries(Vec<Query>),
    NoAccess,
}

#[async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Scopes the principal holds on a node with the given access blob.
    /// A node with no blob is unrestricted.
    async fn allowed_scopes(
        &self,
        access_blob: Option<&JsonValue>,
        principal: &PolicyPrincipal,
        authn_scopes: &BTreeSet<String>,
    ) -> BTreeSet<String>;

    /// Queries to conjoin with a search so that only nodes granting all
    /// of `scopes` to the principal are returned.
    async fn filters(
        &self,
        principal: &PolicyPrincipal,
        authn_scopes: &BTreeSet<String>,
        requested_scopes: &BTreeSet<String>,
    ) -> PolicyFilters;

    /// Validate and finalize the access blob for a node about to be
    /// created. Returns (modified, final_blob).
    async fn init_node(
        &self,
        principal: &PolicyPrincipal,
        authn_scopes: &BTreeSet<String>,
        access_blob: Option<&JsonValue>,
    ) -> Result<(bool, JsonValue)>;

    /// Validate and finalize a change to an existing node's access blob.
    async fn modify_node(
        &self,
        current_blob: Option<&JsonValue>,
        principal: &PolicyPrincipal,
        authn_scopes: &BTreeSet<String>,
        access_blob: &JsonValue,
    ) -> Result<(bool, JsonValue)>;
}

/// Imposes no access restrictions; every principal gets every scope.
/// What an anonymous request may actually do is still bounded by its
/// credential scopes, which the HTTP layer checks alongside the policy.
pub struct OpenAccessPolicy;

#[async_trait]
impl AccessPolicy for OpenAccessPolicy {
    async fn allowed_scopes(
        &self,
        _access_blob: Option<&JsonValue>,
        _principal: &PolicyPrincipal,
        _authn_scopes: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        scopes::all_scopes()
    }

    async fn filters(
        &self,
        _principal: &PolicyPrincipal,
        _authn_scopes: &BTreeSet<String>,
        _requested_scopes: &BTreeSet<String>,
    ) -> PolicyFilters {
        PolicyFilters::Queries(Vec::new())
    }

    async fn init_node(
        &self,
        _principal: &PolicyPrincipal,
        _authn_scopes: &BTreeSet<String>,
        access_blob: Option<&JsonValue>,
    ) -> Result<(bool, JsonValue)> {
        Ok((false, access_blob.cloned().unwrap_or(JsonValue::Null)))
    }

    async fn modify_node(
        &self,
        _current_blob: Option<&JsonValue>,
        _principal: &PolicyPrincipal,
        _authn_scopes: &BTreeSet<String>,
        access_blob: &JsonValue,
    ) -> Result<(bool, JsonValue)> {
        Ok((false, access_blob.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_policy_grants_everything_to_users() {
        let policy = OpenAccessPolicy;
        let principal = PolicyPrincipal::User {
            uuid: Uuid::new_v4(),
            identities: vec![("toy".into(), "alice".into())],
        };
        let allowed = policy
            .allowed_scopes(None, &principal, &BTreeSet::new())
            .await;
        assert_eq!(allowed, scopes::all_scopes());
        assert_eq!(
            policy
                .filters(&principal, &BTreeSet::new(), &scopes::public_scopes())
                .await,
            PolicyFilters::Queries(vec![])
        );
    }

    #[tokio::test]
    async fn test_open_policy_leaves_anonymous_to_credential_scopes() {
        let policy = OpenAccessPolicy;
        let allowed = policy
            .allowed_scopes(None, &PolicyPrincipal::Public, &BTreeSet::new())
            .await;
        assert_eq!(allowed, scopes::all_scopes());
    }

    #[test]
    fn test_identifier_resolution() {
        let user = PolicyPrincipal::User {
            uuid: Uuid::new_v4(),
            identities: vec![
                ("orcid".into(), "0000-1".into()),
                ("toy".into(), "alice".into()),
            ],
        };
        assert_eq!(user.identifier("toy").as_deref(), Some("alice"));
        assert_eq!(user.identifier("ldap"), None);

        let uuid = Uuid::new_v4();
        let service = PolicyPrincipal::Service { uuid };
        assert_eq!(service.identifier("toy"), Some(uuid.to_string()));
        assert_eq!(PolicyPrincipal::Public.identifier("toy"), None);
    }
}
