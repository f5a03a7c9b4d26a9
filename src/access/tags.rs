// Tag-based access policy.
//
// A tag grants a set of scopes to users and groups, and may nest other
// tags through auto_tags. Compilation flattens the tag graph into
// per-tag user->scopes maps plus reverse indices for filter pushdown.
// The compiled state is published by swapping an Arc so readers never
// wait on a compilation in progress.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{AccessPolicy, PolicyFilters, PolicyPrincipal};
use crate::errors::{Result, TreeError};
use crate::queries::Query;
use crate::scopes;

const MAX_TAG_NESTING: usize = 5;
const PUBLIC_TAG: &str = "public";
const UPDATE_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Raw policy configuration, as parsed from the policy YAML document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagDefinitions {
    #[serde(default)]
    pub roles: BTreeMap<String, RoleDefinition>,
    #[serde(default)]
    pub tags: BTreeMap<String, TagDefinition>,
    #[serde(default)]
    pub tag_owners: BTreeMap<String, OwnerDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleDefinition {
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagDefinition {
    #[serde(default)]
    pub users: Vec<MemberDefinition>,
    #[serde(default)]
    pub groups: Vec<MemberDefinition>,
    #[serde(default)]
    pub auto_tags: Vec<NameReference>,
}

/// A user or group entry. Exactly one of `role` and `scopes` is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameReference {
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerDefinition {
    #[serde(default)]
    pub users: Vec<NameReference>,
    #[serde(default)]
    pub groups: Vec<NameReference>,
}

/// Resolves a group name to its member usernames. `None` means the group
/// does not exist; compilation warns and skips it.
pub trait GroupResolver: Send + Sync {
    fn members(&self, group: &str) -> Option<Vec<String>>;
}

/// Fixed group membership, for tests and static deployments.
pub struct StaticGroups(pub BTreeMap<String, Vec<String>>);

impl GroupResolver for StaticGroups {
    fn members(&self, group: &str) -> Option<Vec<String>> {
        self.0.get(group).cloned()
    }
}

type UserScopes = BTreeMap<String, BTreeSet<String>>;

/// The compiled, immutable policy state read by every request.
#[derive(Debug, Clone, Default)]
pub struct LoadedTags {
    /// tag -> user -> scopes
    pub tags: BTreeMap<String, UserScopes>,
    /// Tags that (transitively) include the public tag.
    pub public: BTreeSet<String>,
    /// scope -> user -> tags, for reverse lookup during filter pushdown.
    pub scopes: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
    /// tag -> users allowed to apply/remove it.
    pub owners: BTreeMap<String, BTreeSet<String>>,
}

pub struct TagBasedAccessPolicy {
    provider: String,
    scope_universe: BTreeSet<String>,
    read_scopes: BTreeSet<String>,
    reverse_lookup_scopes: BTreeSet<String>,
    unremovable_scopes: BTreeSet<String>,
    admin_scopes: BTreeSet<String>,
    group_resolver: Arc<dyn GroupResolver>,
    loaded: RwLock<Arc<LoadedTags>>,
    /// Serializes compilations; the periodic partial update acquires with
    /// a short timeout and skips the cycle if contended.
    compile_lock: tokio::sync::Mutex<()>,
}

impl TagBasedAccessPolicy {
    pub fn new(
        provider: impl Into<String>,
        definitions: TagDefinitions,
        group_resolver: Arc<dyn GroupResolver>,
        scope_universe: Option<BTreeSet<String>>,
    ) -> Result<Self> {
        let scope_universe = scope_universe.unwrap_or_else(scopes::all_scopes);
        let policy = Self {
            provider: provider.into(),
            read_scopes: [scopes::READ_METADATA, scopes::READ_DATA]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            reverse_lookup_scopes: [scopes::READ_METADATA, scopes::READ_DATA]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            unremovable_scopes: [scopes::READ_METADATA, scopes::WRITE_METADATA]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            admin_scopes: [scopes::ADMIN_APIKEYS].iter().map(|s| s.to_string()).collect(),
            scope_universe,
            group_resolver,
            loaded: RwLock::new(Arc::new(LoadedTags::default())),
            compile_lock: tokio::sync::Mutex::new(()),
        };
        let compiled = policy.compile(&definitions)?;
        policy.publish(compiled);
        Ok(policy)
    }

    /// A consistent snapshot of the compiled state.
    pub fn loaded(&self) -> Arc<LoadedTags> {
        Arc::clone(&self.loaded.read())
    }

    fn publish(&self, compiled: LoadedTags) {
        *self.loaded.write() = Arc::new(compiled);
    }

    /// Full reload: recompile from scratch and swap. Blocks until the
    /// compile lock is available.
    pub async fn reload(&self, definitions: TagDefinitions) -> Result<()> {
        let _guard = self.compile_lock.lock().await;
        info!("access policy full reload");
        let compiled = self.compile(&definitions)?;
        self.publish(compiled);
        Ok(())
    }

    /// Partial update: compile the given definitions and merge the result
    /// into the loaded state without removing anything. Skips (returning
    /// false) when a reload holds the compile lock.
    pub async fn update(&self, definitions: TagDefinitions) -> Result<bool> {
        let guard =
            match tokio::time::timeout(UPDATE_LOCK_TIMEOUT, self.compile_lock.lock()).await {
                Ok(guard) => guard,
                Err(_) => {
                    warn!("compile lock contended; skipping policy update cycle");
                    return Ok(false);
                }
            };
        let _guard = guard;
        info!("access policy partial update");
        let fresh = self.compile(&definitions)?;
        let current = self.loaded();
        let mut merged = (*current).clone();
        for (tag, users) in fresh.tags {
            let entry = merged.tags.entry(tag).or_default();
            for (user, user_scopes) in users {
                entry.entry(user).or_default().extend(user_scopes);
            }
        }
        merged.public.extend(fresh.public);
        for (tag, owners) in fresh.owners {
            merged.owners.entry(tag).or_default().extend(owners);
        }
        merged.scopes = build_reverse_index(&merged.tags, &self.reverse_lookup_scopes);
        self.publish(merged);
        Ok(true)
    }

    fn validate_scopes(&self, scopes: &BTreeSet<String>, subject: &str) -> Result<()> {
        if scopes.is_empty() {
            return Err(TreeError::Config(format!(
                "scopes must not be empty for {subject}"
            )));
        }
        if !scopes.is_subset(&self.scope_universe) {
            return Err(TreeError::Config(format!(
                "scopes for {subject} are not in the valid set of scopes; invalid: {:?}",
                scopes
                    .difference(&self.scope_universe)
                    .collect::<Vec<_>>()
            )));
        }
        Ok(())
    }

    fn member_scopes(
        &self,
        definitions: &TagDefinitions,
        member: &MemberDefinition,
        kind: &str,
    ) -> Result<BTreeSet<String>> {
        match (&member.role, &member.scopes) {
            (Some(_), Some(_)) => Err(TreeError::Config(format!(
                "cannot define both 'scopes' and 'role' for a {kind}: {}",
                member.name
            ))),
            (None, None) => Err(TreeError::Config(format!(
                "must define either 'scopes' or 'role' for a {kind}: {}",
                member.name
            ))),
            (Some(role), None) => {
                let role_def = definitions.roles.get(role).ok_or_else(|| {
                    TreeError::Config(format!(
                        "{kind} {} references undefined role {role:?}",
                        member.name
                    ))
                })?;
                let scopes: BTreeSet<String> = role_def.scopes.iter().cloned().collect();
                self.validate_scopes(&scopes, &member.name)?;
                Ok(scopes)
            }
            (None, Some(list)) => {
                let scopes: BTreeSet<String> = list.iter().cloned().collect();
                self.validate_scopes(&scopes, &member.name)?;
                Ok(scopes)
            }
        }
    }

    /// Depth-first flattening of one tag: merge nested tags' grants, then
    /// apply this tag's direct users and groups. A tag revisited while
    /// still on the traversal stack is a cycle.
    #[allow(clippy::too_many_arguments)]
    fn dfs(
        &self,
        tag: &str,
        adjacency: &BTreeMap<String, BTreeSet<String>>,
        definitions: &TagDefinitions,
        memo: &mut BTreeMap<String, (UserScopes, bool)>,
        stack: &mut BTreeSet<String>,
        depth: usize,
    ) -> Result<(UserScopes, bool)> {
        if let Some(done) = memo.get(tag) {
            return Ok(done.clone());
        }
        if stack.contains(tag) {
            return Err(TreeError::Config(format!(
                "tag nesting cycle detected at tag {tag:?}"
            )));
        }
        if depth > MAX_TAG_NESTING {
            return Err(TreeError::Config(format!(
                "exceeded maximum tag nesting of {MAX_TAG_NESTING} levels at tag {tag:?}"
            )));
        }
        stack.insert(tag.to_string());

        let mut users: UserScopes = BTreeMap::new();
        let mut public = false;
        if let Some(nested) = adjacency.get(tag) {
            for child in nested {
                if child.eq_ignore_ascii_case(PUBLIC_TAG) {
                    public = true;
                    continue;
                }
                let (child_users, child_public) = self
                    .dfs(child, adjacency, definitions, memo, stack, depth + 1)
                    .map_err(|e| {
                        TreeError::Config(format!("tag compilation failed at tag {tag:?}: {e}"))
                    })?;
                public = public || child_public;
                for (user, user_scopes) in child_users {
                    users.entry(user).or_default().extend(user_scopes);
                }
            }
        }

        if let Some(definition) = definitions.tags.get(tag) {
            for user in &definition.users {
                let member_scopes = self.member_scopes(definitions, user, "user")?;
                users
                    .entry(user.name.clone())
                    .or_default()
                    .extend(member_scopes);
            }
            for group in &definition.groups {
                let member_scopes = self.member_scopes(definitions, group, "group")?;
                match self.group_resolver.members(&group.name) {
                    Some(usernames) => {
                        for username in usernames {
                            users.entry(username).or_default().extend(member_scopes.clone());
                        }
                    }
                    None => {
                        warn!(group = %group.name, "group does not exist - skipping");
                    }
                }
            }
        }

        stack.remove(tag);
        memo.insert(tag.to_string(), (users.clone(), public));
        Ok((users, public))
    }

    /// Compile raw definitions into a fresh LoadedTags.
    pub fn compile(&self, definitions: &TagDefinitions) -> Result<LoadedTags> {
        for (name, role) in &definitions.roles {
            let role_scopes: BTreeSet<String> = role.scopes.iter().cloned().collect();
            self.validate_scopes(&role_scopes, &format!("role {name:?}"))?;
        }

        let mut adjacency: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (tag, definition) in &definitions.tags {
            if tag.eq_ignore_ascii_case(PUBLIC_TAG) {
                return Err(TreeError::Config(format!(
                    "the {PUBLIC_TAG:?} tag cannot be redefined"
                )));
            }
            let mut nested = BTreeSet::new();
            for auto_tag in &definition.auto_tags {
                if !definitions.tags.contains_key(&auto_tag.name)
                    && !auto_tag.name.eq_ignore_ascii_case(PUBLIC_TAG)
                {
                    return Err(TreeError::Config(format!(
                        "tag {tag:?} has nested tag {:?} which does not have a definition",
                        auto_tag.name
                    )));
                }
                nested.insert(auto_tag.name.clone());
            }
            adjacency.insert(tag.clone(), nested);
        }

        let mut memo: BTreeMap<String, (UserScopes, bool)> = BTreeMap::new();
        for tag in adjacency.keys() {
            let mut stack = BTreeSet::new();
            self.dfs(tag, &adjacency, definitions, &mut memo, &mut stack, 0)?;
        }

        let mut compiled = LoadedTags {
            public: BTreeSet::from([PUBLIC_TAG.to_string()]),
            ..Default::default()
        };
        for (tag, (users, public)) in memo {
            if public {
                compiled.public.insert(tag.clone());
            }
            compiled.tags.insert(tag, users);
        }
        compiled.scopes = build_reverse_index(&compiled.tags, &self.reverse_lookup_scopes);

        for (tag, owner_definition) in &definitions.tag_owners {
            let owners = compiled.owners.entry(tag.clone()).or_default();
            for user in &owner_definition.users {
                owners.insert(user.name.clone());
            }
            for group in &owner_definition.groups {
                match self.group_resolver.members(&group.name) {
                    Some(usernames) => owners.extend(usernames),
                    None => {
                        warn!(group = %group.name, "group does not exist - skipping");
                    }
                }
            }
        }
        Ok(compiled)
    }

    fn is_admin(&self, authn_scopes: &BTreeSet<String>) -> bool {
        self.admin_scopes.iter().all(|s| authn_scopes.contains(s))
    }

    /// Validate a tags-shaped blob and return the normalized tag set,
    /// enforcing ownership and public/empty restrictions. `current_tags`
    /// carries the node's existing tags for modify-time diffs.
    fn check_tags_blob(
        &self,
        loaded: &LoadedTags,
        identifier: Option<&str>,
        is_admin: bool,
        access_blob: &JsonValue,
        current_tags: Option<&BTreeSet<String>>,
    ) -> Result<BTreeSet<String>> {
        let object = access_blob.as_object().filter(|map| {
            map.len() == 1 && map.contains_key("tags") && map["tags"].is_array()
        });
        let Some(object) = object else {
            return Err(TreeError::Unprocessable(format!(
                "access_blob must be in the form '{{\"tags\": [\"tag1\", ...]}}'; \
                 received {access_blob}"
            )));
        };
        let requested: Vec<String> = object["tags"]
            .as_array()
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        if requested.is_empty() && !is_admin {
            return Err(TreeError::Forbidden(
                "only admins can apply an empty tag list to a node".into(),
            ));
        }
        let mut include_public = false;
        let mut final_tags = BTreeSet::new();
        for tag in &requested {
            let already_present = current_tags.is_some_and(|tags| tags.contains(tag));
            if tag.eq_ignore_ascii_case(PUBLIC_TAG) {
                include_public = true;
                if !already_present && !is_admin {
                    return Err(TreeError::Forbidden(format!(
                        "only admins can apply the {PUBLIC_TAG:?} tag to a node"
                    )));
                }
                continue;
            }
            final_tags.insert(tag.clone());
            if already_present {
                continue;
            }
            if !loaded.tags.contains_key(tag) {
                return Err(TreeError::Unprocessable(format!(
                    "cannot apply tag to node: tag {tag:?} is not defined"
                )));
            }
            let owned = identifier.is_some_and(|id| {
                loaded
                    .owners
                    .get(tag)
                    .is_some_and(|owners| owners.contains(id))
            });
            if !owned && !is_admin {
                return Err(TreeError::Forbidden(format!(
                    "cannot apply tag to node: user {identifier:?} is not an owner of \
                     tag {tag:?}"
                )));
            }
        }
        if include_public {
            final_tags.insert(PUBLIC_TAG.to_string());
        }

        // Tags being removed are subject to the same ownership rules.
        if let Some(current) = current_tags {
            for tag in current.difference(&final_tags) {
                if tag == PUBLIC_TAG {
                    if !is_admin {
                        return Err(TreeError::Forbidden(format!(
                            "only admins can remove the {PUBLIC_TAG:?} tag from a node"
                        )));
                    }
                    continue;
                }
                if !loaded.tags.contains_key(tag) {
                    return Err(TreeError::Unprocessable(format!(
                        "cannot remove tag from node: tag {tag:?} is not defined"
                    )));
                }
                let owned = identifier.is_some_and(|id| {
                    loaded
                        .owners
                        .get(tag)
                        .is_some_and(|owners| owners.contains(id))
                });
                if !owned && !is_admin {
                    return Err(TreeError::Forbidden(format!(
                        "cannot remove tag from node: user {identifier:?} is not an \
                         owner of tag {tag:?}"
                    )));
                }
            }
        }
        Ok(final_tags)
    }

    /// Non-admins must retain the unremovable scopes through any blob they
    /// set, preventing self-lockout.
    fn check_self_lockout(
        &self,
        loaded: &LoadedTags,
        identifier: Option<&str>,
        final_tags: &BTreeSet<String>,
        context: &str,
    ) -> Result<()> {
        let mut granted: BTreeSet<String> = BTreeSet::new();
        if let Some(id) = identifier {
            for tag in final_tags {
                if let Some(users) = loaded.tags.get(tag) {
                    if let Some(user_scopes) = users.get(id) {
                        granted.extend(user_scopes.iter().cloned());
                    }
                }
            }
        }
        if !self.unremovable_scopes.iter().all(|s| granted.contains(s)) {
            return Err(TreeError::Forbidden(format!(
                "{context}: the resulting access_blob would not grant the required \
                 scopes {:?}",
                self.unremovable_scopes
            )));
        }
        Ok(())
    }
}

fn build_reverse_index(
    tags: &BTreeMap<String, UserScopes>,
    reverse_lookup_scopes: &BTreeSet<String>,
) -> BTreeMap<String, BTreeMap<String, BTreeSet<String>>> {
    let mut index: BTreeMap<String, BTreeMap<String, BTreeSet<String>>> = BTreeMap::new();
    for scope in reverse_lookup_scopes {
        index.entry(scope.clone()).or_default();
    }
    for (tag, users) in tags {
        for (user, user_scopes) in users {
            for scope in reverse_lookup_scopes {
                if user_scopes.contains(scope) {
                    index
                        .entry(scope.clone())
                        .or_default()
                        .entry(user.clone())
                        .or_default()
                        .insert(tag.clone());
                }
            }
        }
    }
    index
}

#[async_trait]
impl AccessPolicy for TagBasedAccessPolicy {
    async fn allowed_scopes(
        &self,
        access_blob: Option<&JsonValue>,
        principal: &PolicyPrincipal,
        authn_scopes: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let Some(blob) = access_blob else {
            return self.scope_universe.clone();
        };
        if self.is_admin(authn_scopes) {
            return self.scope_universe.clone();
        }
        let loaded = self.loaded();
        let identifier = principal.identifier(&self.provider);
        let mut allowed = BTreeSet::new();
        if let Some(owner) = blob.get("user").and_then(|v| v.as_str()) {
            if identifier.as_deref() == Some(owner) {
                allowed = self.scope_universe.clone();
            }
        } else if let Some(tags) = blob.get("tags").and_then(|v| v.as_array()) {
            for tag in tags.iter().filter_map(|t| t.as_str()) {
                if loaded.public.contains(tag) {
                    allowed.extend(self.read_scopes.iter().cloned());
                    if tag == PUBLIC_TAG {
                        continue;
                    }
                }
                let Some(users) = loaded.tags.get(tag) else {
                    continue;
                };
                if let Some(id) = &identifier {
                    if let Some(tag_scopes) = users.get(id) {
                        if tag_scopes.is_subset(&self.scope_universe) {
                            allowed.extend(tag_scopes.iter().cloned());
                        }
                    }
                }
            }
        }
        allowed
    }

    async fn filters(
        &self,
        principal: &PolicyPrincipal,
        authn_scopes: &BTreeSet<String>,
        requested_scopes: &BTreeSet<String>,
    ) -> PolicyFilters {
        if !requested_scopes.is_subset(&self.scope_universe) {
            return PolicyFilters::NoAccess;
        }
        if !requested_scopes.is_subset(&self.reverse_lookup_scopes) {
            return PolicyFilters::NoAccess;
        }
        let is_service = matches!(principal, PolicyPrincipal::Service { .. });
        if !is_service && self.is_admin(authn_scopes) {
            return PolicyFilters::Queries(Vec::new());
        }
        let loaded = self.loaded();
        let identifier = principal.identifier(&self.provider).unwrap_or_default();

        // Tags granting *all* requested scopes to this principal.
        let mut tag_list: Option<BTreeSet<String>> = None;
        for scope in requested_scopes {
            let for_scope = loaded
                .scopes
                .get(scope)
                .and_then(|users| users.get(&identifier))
                .cloned()
                .unwrap_or_default();
            tag_list = Some(match tag_list {
                None => for_scope,
                Some(current) => current.intersection(&for_scope).cloned().collect(),
            });
        }
        let mut tag_list = tag_list.unwrap_or_default();

        // Public tags satisfy any all-read-scope request, for every
        // principal including anonymous.
        if requested_scopes
            .iter()
            .all(|scope| self.read_scopes.contains(scope))
        {
            tag_list.extend(loaded.public.iter().cloned());
        }

        PolicyFilters::Queries(vec![Query::AccessBlobFilter {
            user_id: identifier,
            tags: tag_list.into_iter().collect(),
        }])
    }

    async fn init_node(
        &self,
        principal: &PolicyPrincipal,
        authn_scopes: &BTreeSet<String>,
        access_blob: Option<&JsonValue>,
    ) -> Result<(bool, JsonValue)> {
        let identifier = principal.identifier(&self.provider);
        let is_admin = self.is_admin(authn_scopes);
        match access_blob {
            None => {
                let id = identifier.ok_or_else(|| {
                    TreeError::Forbidden(
                        "anonymous principals cannot create nodes".into(),
                    )
                })?;
                let blob = serde_json::json!({ "user": id });
                info!(access_blob = %blob, "node to be initialized");
                Ok((true, blob))
            }
            Some(blob) => {
                let loaded = self.loaded();
                let final_tags = self.check_tags_blob(
                    &loaded,
                    identifier.as_deref(),
                    is_admin,
                    blob,
                    None,
                )?;
                if !is_admin {
                    self.check_self_lockout(
                        &loaded,
                        identifier.as_deref(),
                        &final_tags,
                        "cannot init node with tags",
                    )?;
                }
                let requested: BTreeSet<String> = blob["tags"]
                    .as_array()
                    .map(|tags| {
                        tags.iter()
                            .filter_map(|t| t.as_str().map(|s| s.to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                let modified = requested != final_tags;
                let final_blob = serde_json::json!({
                    "tags": final_tags.into_iter().collect::<Vec<_>>()
                });
                info!(access_blob = %final_blob, "node to be initialized");
                Ok((modified, final_blob))
            }
        }
    }

    async fn modify_node(
        &self,
        current_blob: Option<&JsonValue>,
        principal: &PolicyPrincipal,
        authn_scopes: &BTreeSet<String>,
        access_blob: &JsonValue,
    ) -> Result<(bool, JsonValue)> {
        if Some(access_blob) == current_blob {
            info!("node access_blob not modified; access_blob is identical");
            return Ok((false, access_blob.clone()));
        }
        let identifier = principal.identifier(&self.provider);
        let is_admin = self.is_admin(authn_scopes);
        let loaded = self.loaded();
        let current_tags: BTreeSet<String> = current_blob
            .and_then(|blob| blob.get("tags"))
            .and_then(|tags| tags.as_array())
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let final_tags = self.check_tags_blob(
            &loaded,
            identifier.as_deref(),
            is_admin,
            access_blob,
            Some(&current_tags),
        )?;
        // The post-change scope check also covers converting a user-owned
        // node into a shared (tagged) node.
        if !is_admin {
            self.check_self_lockout(
                &loaded,
                identifier.as_deref(),
                &final_tags,
                "cannot modify tags on node",
            )?;
        }
        let requested: BTreeSet<String> = access_blob["tags"]
            .as_array()
            .map(|tags| {
                tags.iter()
                    .filter_map(|t| t.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let modified = requested != final_tags;
        let final_blob = serde_json::json!({
            "tags": final_tags.into_iter().collect::<Vec<_>>()
        });
        info!(access_blob = %final_blob, "node access_blob to be modified");
        Ok((modified, final_blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn yaml_definitions(source: &str) -> TagDefinitions {
        serde_yaml::from_str(source).unwrap()
    }

    fn simple_definitions() -> TagDefinitions {
        yaml_definitions(
            r#"
roles:
  facility_user:
    scopes: ["read:metadata", "read:data", "write:metadata"]
tags:
  T:
    users:
      - name: alice
        role: facility_user
      - name: bob
        scopes: ["read:metadata"]
tag_owners:
  T:
    users:
      - name: alice
"#,
        )
    }

    fn policy(definitions: TagDefinitions) -> TagBasedAccessPolicy {
        let groups = StaticGroups(BTreeMap::from([(
            "proposal-123".to_string(),
            vec!["carol".to_string(), "dave".to_string()],
        )]));
        TagBasedAccessPolicy::new("toy", definitions, Arc::new(groups), None).unwrap()
    }

    fn user(name: &str) -> PolicyPrincipal {
        PolicyPrincipal::User {
            uuid: Uuid::new_v4(),
            identities: vec![("toy".to_string(), name.to_string())],
        }
    }

    fn admin_scopes() -> BTreeSet<String> {
        scopes::all_scopes()
    }

    fn user_authn_scopes() -> BTreeSet<String> {
        scopes::user_scopes()
    }

    fn read_metadata() -> BTreeSet<String> {
        BTreeSet::from([scopes::READ_METADATA.to_string()])
    }

    #[test]
    fn test_compile_direct_users_and_roles() {
        let policy = policy(simple_definitions());
        let loaded = policy.loaded();
        let t = &loaded.tags["T"];
        assert!(t["alice"].contains("write:metadata"));
        assert_eq!(t["bob"], BTreeSet::from(["read:metadata".to_string()]));
        assert_eq!(
            loaded.owners["T"],
            BTreeSet::from(["alice".to_string()])
        );
        // Reverse index: alice appears under both read scopes.
        assert!(loaded.scopes["read:metadata"]["alice"].contains("T"));
        assert!(loaded.scopes["read:data"]["alice"].contains("T"));
        assert!(!loaded.scopes["read:data"].contains_key("bob"));
    }

    #[test]
    fn test_compile_group_expansion_and_missing_group_skipped() {
        let definitions = yaml_definitions(
            r#"
roles:
  facility_user:
    scopes: ["read:metadata", "read:data"]
tags:
  P:
    groups:
      - name: proposal-123
        role: facility_user
      - name: no-such-group
        role: facility_user
"#,
        );
        let policy = policy(definitions);
        let loaded = policy.loaded();
        assert!(loaded.tags["P"].contains_key("carol"));
        assert!(loaded.tags["P"].contains_key("dave"));
        assert_eq!(loaded.tags["P"].len(), 2);
    }

    #[test]
    fn test_compile_nested_tags_merge_upward_and_public_propagates() {
        let definitions = yaml_definitions(
            r#"
tags:
  inner:
    users:
      - name: alice
        scopes: ["read:metadata"]
    auto_tags:
      - name: public
  outer:
    auto_tags:
      - name: inner
"#,
        );
        let policy = policy(definitions);
        let loaded = policy.loaded();
        assert!(loaded.tags["outer"]["alice"].contains("read:metadata"));
        assert!(loaded.public.contains("inner"));
        assert!(loaded.public.contains("outer"));
        assert!(loaded.public.contains("public"));
    }

    #[test]
    fn test_compile_cycle_is_an_error() {
        let definitions = yaml_definitions(
            r#"
tags:
  a:
    auto_tags:
      - name: b
  b:
    auto_tags:
      - name: a
"#,
        );
        let groups = StaticGroups(BTreeMap::new());
        let err = TagBasedAccessPolicy::new("toy", definitions, Arc::new(groups), None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_compile_depth_limit() {
        // A chain seven tags deep exceeds the bound of five.
        let mut source = String::from("tags:\n");
        for i in 0..7 {
            source.push_str(&format!("  t{i}:\n"));
            if i < 6 {
                source.push_str(&format!("    auto_tags:\n      - name: t{}\n", i + 1));
            } else {
                source.push_str("    users:\n      - name: alice\n        scopes: [\"read:metadata\"]\n");
            }
        }
        let definitions = yaml_definitions(&source);
        let groups = StaticGroups(BTreeMap::new());
        let err = TagBasedAccessPolicy::new("toy", definitions, Arc::new(groups), None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("nesting"));
    }

    #[test]
    fn test_compile_rejects_redefined_public_and_unknown_refs() {
        let redefined = yaml_definitions(
            r#"
tags:
  Public:
    users:
      - name: alice
        scopes: ["read:metadata"]
"#,
        );
        let groups: Arc<dyn GroupResolver> = Arc::new(StaticGroups(BTreeMap::new()));
        assert!(
            TagBasedAccessPolicy::new("toy", redefined, Arc::clone(&groups), None).is_err()
        );

        let dangling = yaml_definitions(
            r#"
tags:
  a:
    auto_tags:
      - name: nowhere
"#,
        );
        assert!(TagBasedAccessPolicy::new("toy", dangling, groups, None).is_err());
    }

    #[test]
    fn test_compile_rejects_role_and_scopes_together() {
        let definitions = yaml_definitions(
            r#"
roles:
  r:
    scopes: ["read:metadata"]
tags:
  t:
    users:
      - name: alice
        role: r
        scopes: ["read:data"]
"#,
        );
        let groups = StaticGroups(BTreeMap::new());
        assert!(TagBasedAccessPolicy::new("toy", definitions, Arc::new(groups), None).is_err());
    }

    #[tokio::test]
    async fn test_allowed_scopes_user_blob() {
        let policy = policy(simple_definitions());
        let blob = json!({"user": "alice"});
        let allowed = policy
            .allowed_scopes(Some(&blob), &user("alice"), &user_authn_scopes())
            .await;
        assert_eq!(allowed, scopes::all_scopes());
        let denied = policy
            .allowed_scopes(Some(&blob), &user("bob"), &user_authn_scopes())
            .await;
        assert!(denied.is_empty());
        // Admins see everything regardless of the blob.
        let via_admin = policy
            .allowed_scopes(Some(&blob), &user("bob"), &admin_scopes())
            .await;
        assert_eq!(via_admin, scopes::all_scopes());
    }

    #[tokio::test]
    async fn test_allowed_scopes_tag_blob_and_public() {
        let policy = policy(simple_definitions());
        let blob = json!({"tags": ["T"]});
        let allowed = policy
            .allowed_scopes(Some(&blob), &user("alice"), &user_authn_scopes())
            .await;
        assert!(allowed.contains("read:metadata"));
        assert!(allowed.contains("write:metadata"));
        let bob = policy
            .allowed_scopes(Some(&blob), &user("bob"), &user_authn_scopes())
            .await;
        assert_eq!(bob, BTreeSet::from(["read:metadata".to_string()]));

        let public_blob = json!({"tags": ["public"]});
        let anonymous = policy
            .allowed_scopes(Some(&public_blob), &PolicyPrincipal::Public, &BTreeSet::new())
            .await;
        assert_eq!(anonymous, scopes::public_scopes());
    }

    #[tokio::test]
    async fn test_no_blob_means_unrestricted() {
        let policy = policy(simple_definitions());
        let allowed = policy
            .allowed_scopes(None, &user("nobody"), &user_authn_scopes())
            .await;
        assert_eq!(allowed, scopes::all_scopes());
    }

    #[tokio::test]
    async fn test_filters_emits_access_blob_filter() {
        let policy = policy(simple_definitions());
        let filters = policy
            .filters(&user("alice"), &user_authn_scopes(), &read_metadata())
            .await;
        match filters {
            PolicyFilters::Queries(queries) => {
                assert_eq!(queries.len(), 1);
                match &queries[0] {
                    Query::AccessBlobFilter { user_id, tags } => {
                        assert_eq!(user_id, "alice");
                        assert!(tags.contains(&"T".to_string()));
                        // Read scopes always admit public tags.
                        assert!(tags.contains(&"public".to_string()));
                    }
                    other => panic!("unexpected query {other:?}"),
                }
            }
            PolicyFilters::NoAccess => panic!("expected queries"),
        }
    }

    #[tokio::test]
    async fn test_filters_admin_is_unfiltered_and_bad_scopes_no_access() {
        let policy = policy(simple_definitions());
        assert_eq!(
            policy
                .filters(&user("alice"), &admin_scopes(), &read_metadata())
                .await,
            PolicyFilters::Queries(vec![])
        );
        // write:metadata is in the universe but not reverse-lookupable.
        let filters = policy
            .filters(
                &user("alice"),
                &user_authn_scopes(),
                &BTreeSet::from(["write:metadata".to_string()]),
            )
            .await;
        assert_eq!(filters, PolicyFilters::NoAccess);
        let filters = policy
            .filters(
                &user("alice"),
                &user_authn_scopes(),
                &BTreeSet::from(["not-a-scope".to_string()]),
            )
            .await;
        assert_eq!(filters, PolicyFilters::NoAccess);
    }

    #[tokio::test]
    async fn test_filters_anonymous_gets_public_only() {
        let policy = policy(simple_definitions());
        let filters = policy
            .filters(&PolicyPrincipal::Public, &BTreeSet::new(), &read_metadata())
            .await;
        match filters {
            PolicyFilters::Queries(queries) => match &queries[0] {
                Query::AccessBlobFilter { user_id, tags } => {
                    assert!(user_id.is_empty());
                    assert_eq!(tags, &vec!["public".to_string()]);
                }
                other => panic!("unexpected query {other:?}"),
            },
            PolicyFilters::NoAccess => panic!("expected queries"),
        }
    }

    #[tokio::test]
    async fn test_init_node_defaults_to_user_blob() {
        let policy = policy(simple_definitions());
        let (modified, blob) = policy
            .init_node(&user("alice"), &user_authn_scopes(), None)
            .await
            .unwrap();
        assert!(modified);
        assert_eq!(blob, json!({"user": "alice"}));
    }

    #[tokio::test]
    async fn test_init_node_tag_ownership_enforced() {
        // alice owns T but holds only its T-granted scopes; bob owns
        // nothing.
        let policy = policy(simple_definitions());
        let blob = json!({"tags": ["T"]});
        let (modified, out) = policy
            .init_node(&user("alice"), &user_authn_scopes(), Some(&blob))
            .await
            .unwrap();
        assert!(!modified);
        assert_eq!(out, json!({"tags": ["T"]}));

        let err = policy
            .init_node(&user("bob"), &user_authn_scopes(), Some(&blob))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::Forbidden(_)));

        // Admins bypass ownership.
        policy
            .init_node(&user("bob"), &admin_scopes(), Some(&blob))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_init_node_public_and_empty_require_admin() {
        let policy = policy(simple_definitions());
        let public = json!({"tags": ["public"]});
        assert!(policy
            .init_node(&user("alice"), &user_authn_scopes(), Some(&public))
            .await
            .is_err());
        policy
            .init_node(&user("alice"), &admin_scopes(), Some(&public))
            .await
            .unwrap();

        let empty = json!({"tags": []});
        assert!(policy
            .init_node(&user("alice"), &user_authn_scopes(), Some(&empty))
            .await
            .is_err());
        policy
            .init_node(&user("alice"), &admin_scopes(), Some(&empty))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_init_node_rejects_self_lockout() {
        // bob only gets read:metadata from T, which lacks write:metadata,
        // so tagging a node with T alone would lock bob out. bob is made
        // an owner so the ownership check passes first.
        let definitions = yaml_definitions(
            r#"
tags:
  T:
    users:
      - name: bob
        scopes: ["read:metadata"]
tag_owners:
  T:
    users:
      - name: bob
"#,
        );
        let policy = policy(definitions);
        let blob = json!({"tags": ["T"]});
        let err = policy
            .init_node(&user("bob"), &user_authn_scopes(), Some(&blob))
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_init_node_rejects_malformed_blob() {
        let policy = policy(simple_definitions());
        let bad = json!({"tags": ["T"], "user": "alice"});
        assert!(policy
            .init_node(&user("alice"), &user_authn_scopes(), Some(&bad))
            .await
            .is_err());
        let bad = json!({"user": "alice"});
        assert!(policy
            .init_node(&user("alice"), &user_authn_scopes(), Some(&bad))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_modify_node_identical_blob_is_noop() {
        let policy = policy(simple_definitions());
        let current = json!({"tags": ["T"]});
        let (modified, out) = policy
            .modify_node(
                Some(&current),
                &user("alice"),
                &user_authn_scopes(),
                &current,
            )
            .await
            .unwrap();
        assert!(!modified);
        assert_eq!(out, current);
    }

    #[tokio::test]
    async fn test_modify_node_removal_requires_ownership() {
        let definitions = yaml_definitions(
            r#"
roles:
  rw:
    scopes: ["read:metadata", "write:metadata"]
tags:
  A:
    users:
      - name: alice
        role: rw
      - name: bob
        role: rw
  B:
    users:
      - name: alice
        role: rw
      - name: bob
        role: rw
tag_owners:
  A:
    users:
      - name: alice
  B:
    users:
      - name: alice
"#,
        );
        let policy = policy(definitions);
        let current = json!({"tags": ["A", "B"]});
        let next = json!({"tags": ["A"]});
        // bob does not own B, so bob cannot remove it.
        let err = policy
            .modify_node(Some(&current), &user("bob"), &user_authn_scopes(), &next)
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::Forbidden(_)));
        // alice owns both and keeps her unremovable scopes through A.
        let (modified, out) = policy
            .modify_node(Some(&current), &user("alice"), &user_authn_scopes(), &next)
            .await
            .unwrap();
        assert!(!modified);
        assert_eq!(out, json!({"tags": ["A"]}));
    }

    #[tokio::test]
    async fn test_partial_update_adds_without_removing() {
        let policy = policy(simple_definitions());
        let extra = yaml_definitions(
            r#"
tags:
  NEW:
    users:
      - name: erin
        scopes: ["read:metadata", "read:data"]
"#,
        );
        assert!(policy.update(extra).await.unwrap());
        let loaded = policy.loaded();
        assert!(loaded.tags.contains_key("T"), "existing tags survive");
        assert!(loaded.tags.contains_key("NEW"));
        assert!(loaded.scopes["read:data"]["erin"].contains("NEW"));
    }

    #[tokio::test]
    async fn test_reload_replaces_state() {
        let policy = policy(simple_definitions());
        let replacement = yaml_definitions(
            r#"
tags:
  ONLY:
    users:
      - name: erin
        scopes: ["read:metadata"]
"#,
        );
        policy.reload(replacement).await.unwrap();
        let loaded = policy.loaded();
        assert!(!loaded.tags.contains_key("T"));
        assert!(loaded.tags.contains_key("ONLY"));
    }

    #[tokio::test]
    async fn test_update_skips_when_lock_contended() {
        let policy = Arc::new(policy(simple_definitions()));
        let guard = policy.compile_lock.lock().await;
        let skipped = policy.update(TagDefinitions::default()).await.unwrap();
        assert!(!skipped);
        drop(guard);
        assert!(policy.update(TagDefinitions::default()).await.unwrap());
    }
}
