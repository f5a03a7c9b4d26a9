// The scope universe. Scopes are named capabilities attached to roles,
// API keys, and access-policy tags.

use std::collections::BTreeSet;

pub const READ_METADATA: &str = "read:metadata";
pub const READ_DATA: &str = "read:data";
pub const WRITE_METADATA: &str = "write:metadata";
pub const WRITE_DATA: &str = "write:data";
pub const CREATE: &str = "create";
pub const REGISTER: &str = "register";
pub const METRICS: &str = "metrics";
pub const APIKEYS: &str = "apikeys";
pub const ADMIN_APIKEYS: &str = "admin:apikeys";
pub const READ_PRINCIPALS: &str = "read:principals";
pub const WRITE_PRINCIPALS: &str = "write:principals";

pub fn all_scopes() -> BTreeSet<String> {
    [
        READ_METADATA,
        READ_DATA,
        WRITE_METADATA,
        WRITE_DATA,
        CREATE,
        REGISTER,
        METRICS,
        APIKEYS,
        ADMIN_APIKEYS,
        READ_PRINCIPALS,
        WRITE_PRINCIPALS,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Scopes granted on public nodes and to anonymous principals.
pub fn public_scopes() -> BTreeSet<String> {
    [READ_METADATA, READ_DATA].iter().map(|s| s.to_string()).collect()
}

/// Scopes granted by the default "user" role.
pub fn user_scopes() -> BTreeSet<String> {
    [
        READ_METADATA,
        READ_DATA,
        WRITE_METADATA,
        WRITE_DATA,
        CREATE,
        REGISTER,
        METRICS,
        APIKEYS,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
