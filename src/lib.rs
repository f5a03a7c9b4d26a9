// Trellis - a structured-data access service for hierarchical scientific
// datasets: a tree of nodes served over HTTP with fine-grained
// authentication, authorization, search, and chunked reads.
// Root library module

pub mod access;
pub mod adapters;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod object_cache;
pub mod observability;
pub mod queries;
pub mod scheduler;
pub mod scopes;
pub mod server;
pub mod structures;

// Re-export logging setup
pub use observability::{init_logging, init_logging_with_level};

// Re-export the error taxonomy
pub use errors::{ErrorBody, Result, TreeError};

// Re-export core tree types
pub use adapters::{
    Adapter, AdapterCore, ArrayAdapter, Asset, BlocksAdapter, ContainerAdapter,
    CsvTableAdapter, JsonLinesTableAdapter, MapAdapter, TableAdapter,
};
pub use catalog::{
    CatalogContext, CatalogNode, CreateNodeRequest, DataSourceRequest, TreeEntry,
};
pub use dispatch::{AdapterInit, AdapterRegistry};
pub use queries::{Operator, Query};
pub use structures::{
    ArrayStructure, DataType, Spec, Structure, StructureFamily, TableStructure,
};

// Re-export the access policy surface
pub use access::tags::{GroupResolver, LoadedTags, StaticGroups, TagBasedAccessPolicy, TagDefinitions};
pub use access::{AccessPolicy, OpenAccessPolicy, PolicyFilters, PolicyPrincipal};

// Re-export the authentication core
pub use auth::{
    ApiKeyInfo, AuthService, Principal, PrincipalContext, PrincipalType, TokenResponse,
};

// Re-export server assembly
pub use config::{AuthConfig, PolicyConfig, ProviderConfig, ProviderMode, ServerConfig};
pub use object_cache::ObjectCache;
pub use server::compression::CompressionSettings;
pub use server::{build_router, build_state, run, AppState};
