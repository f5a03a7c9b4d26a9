// Catalog schema revisions.
//
// The stored revision is stamped in `schema_revisions`; at startup the
// server refuses to run unless the stored revision is either absent (and
// initialization is permitted) or equal to REQUIRED_REVISION.

use sqlx::AnyPool;
use sqlx::Row;
use tracing::info;

use super::translate::Dialect;
use crate::errors::{Result, TreeError};

pub const REQUIRED_REVISION: &str = "0003-auth-tables";

struct Migration {
    id: &'static str,
    sqlite: &'static [&'static str],
    postgres: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        id: "0001-initial",
        sqlite: &[
            "CREATE TABLE nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                \"key\" TEXT NOT NULL,
                ancestors TEXT NOT NULL,
                structure_family TEXT NOT NULL,
                metadata TEXT NOT NULL,
                specs TEXT NOT NULL,
                access_blob TEXT,
                time_created INTEGER NOT NULL,
                time_updated INTEGER NOT NULL,
                UNIQUE (ancestors, \"key\")
            )",
            "CREATE INDEX ix_nodes_ancestors_time_id
                ON nodes (ancestors, time_created, id)",
            "CREATE TABLE data_sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL REFERENCES nodes (id) ON DELETE CASCADE,
                mimetype TEXT NOT NULL,
                structure TEXT,
                parameters TEXT NOT NULL,
                management TEXT NOT NULL
            )",
            "CREATE INDEX ix_data_sources_node_id ON data_sources (node_id)",
            "CREATE TABLE assets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                data_source_id INTEGER NOT NULL
                    REFERENCES data_sources (id) ON DELETE CASCADE,
                data_uri TEXT NOT NULL,
                is_directory INTEGER NOT NULL
            )",
            "CREATE TABLE revisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node_id INTEGER NOT NULL REFERENCES nodes (id) ON DELETE CASCADE,
                revision_number INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                specs TEXT NOT NULL,
                time_created INTEGER NOT NULL,
                UNIQUE (node_id, revision_number)
            )",
        ],
        postgres: &[
            "CREATE TABLE nodes (
                id BIGSERIAL PRIMARY KEY,
                \"key\" TEXT NOT NULL,
                ancestors JSONB NOT NULL,
                structure_family TEXT NOT NULL,
                metadata JSONB NOT NULL,
                specs JSONB NOT NULL,
                access_blob JSONB,
                time_created BIGINT NOT NULL,
                time_updated BIGINT NOT NULL,
                UNIQUE (ancestors, \"key\")
            )",
            "CREATE INDEX ix_nodes_ancestors_time_id
                ON nodes (ancestors, time_created, id)",
            "CREATE INDEX ix_nodes_metadata ON nodes USING gin (metadata)",
            "CREATE TABLE data_sources (
                id BIGSERIAL PRIMARY KEY,
                node_id BIGINT NOT NULL REFERENCES nodes (id) ON DELETE CASCADE,
                mimetype TEXT NOT NULL,
                structure JSONB,
                parameters JSONB NOT NULL,
                management TEXT NOT NULL
            )",
            "CREATE INDEX ix_data_sources_node_id ON data_sources (node_id)",
            "CREATE TABLE assets (
                id BIGSERIAL PRIMARY KEY,
                data_source_id BIGINT NOT NULL
                    REFERENCES data_sources (id) ON DELETE CASCADE,
                data_uri TEXT NOT NULL,
                is_directory BIGINT NOT NULL
            )",
            "CREATE TABLE revisions (
                id BIGSERIAL PRIMARY KEY,
                node_id BIGINT NOT NULL REFERENCES nodes (id) ON DELETE CASCADE,
                revision_number BIGINT NOT NULL,
                metadata JSONB NOT NULL,
                specs JSONB NOT NULL,
                time_created BIGINT NOT NULL,
                UNIQUE (node_id, revision_number)
            )",
        ],
    },
    Migration {
        id: "0002-fulltext",
        sqlite: &[
            "CREATE VIRTUAL TABLE metadata_fts USING fts5 (
                metadata,
                content='nodes',
                content_rowid='id'
            )",
            "CREATE TRIGGER nodes_fts_insert AFTER INSERT ON nodes BEGIN
                INSERT INTO metadata_fts (rowid, metadata)
                VALUES (new.id, new.metadata);
            END",
            "CREATE TRIGGER nodes_fts_delete AFTER DELETE ON nodes BEGIN
                INSERT INTO metadata_fts (metadata_fts, rowid, metadata)
                VALUES ('delete', old.id, old.metadata);
            END",
            "CREATE TRIGGER nodes_fts_update AFTER UPDATE ON nodes BEGIN
                INSERT INTO metadata_fts (metadata_fts, rowid, metadata)
                VALUES ('delete', old.id, old.metadata);
                INSERT INTO metadata_fts (rowid, metadata)
                VALUES (new.id, new.metadata);
            END",
        ],
        // PostgreSQL full text goes through to_tsvector at query time; no
        // mirror table is needed.
        postgres: &[],
    },
    Migration {
        id: "0003-auth-tables",
        sqlite: &[
            "CREATE TABLE principals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                principal_type TEXT NOT NULL,
                time_created INTEGER NOT NULL,
                time_updated INTEGER NOT NULL
            )",
            "CREATE TABLE identities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                provider TEXT NOT NULL,
                external_id TEXT NOT NULL,
                principal_id INTEGER NOT NULL
                    REFERENCES principals (id) ON DELETE CASCADE,
                time_created INTEGER NOT NULL,
                UNIQUE (provider, external_id)
            )",
            "CREATE TABLE roles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                scopes TEXT NOT NULL
            )",
            "CREATE TABLE principal_roles (
                principal_id INTEGER NOT NULL
                    REFERENCES principals (id) ON DELETE CASCADE,
                role_id INTEGER NOT NULL REFERENCES roles (id) ON DELETE CASCADE,
                UNIQUE (principal_id, role_id)
            )",
            "CREATE TABLE sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                principal_id INTEGER NOT NULL
                    REFERENCES principals (id) ON DELETE CASCADE,
                expiration_time INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0,
                refresh_count INTEGER NOT NULL DEFAULT 0,
                time_created INTEGER NOT NULL,
                time_last_refreshed INTEGER
            )",
            "CREATE TABLE api_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                first_eight TEXT NOT NULL,
                hashed_secret TEXT NOT NULL,
                principal_id INTEGER NOT NULL
                    REFERENCES principals (id) ON DELETE CASCADE,
                expiration_time INTEGER,
                latest_activity INTEGER,
                note TEXT,
                scopes TEXT NOT NULL,
                access_tags TEXT,
                time_created INTEGER NOT NULL,
                UNIQUE (first_eight, hashed_secret)
            )",
        ],
        postgres: &[
            "CREATE TABLE principals (
                id BIGSERIAL PRIMARY KEY,
                uuid TEXT NOT NULL UNIQUE,
                principal_type TEXT NOT NULL,
                time_created BIGINT NOT NULL,
                time_updated BIGINT NOT NULL
            )",
            "CREATE TABLE identities (
                id BIGSERIAL PRIMARY KEY,
                provider TEXT NOT NULL,
                external_id TEXT NOT NULL,
                principal_id BIGINT NOT NULL
                    REFERENCES principals (id) ON DELETE CASCADE,
                time_created BIGINT NOT NULL,
                UNIQUE (provider, external_id)
            )",
            "CREATE TABLE roles (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                scopes JSONB NOT NULL
            )",
            "CREATE TABLE principal_roles (
                principal_id BIGINT NOT NULL
                    REFERENCES principals (id) ON DELETE CASCADE,
                role_id BIGINT NOT NULL REFERENCES roles (id) ON DELETE CASCADE,
                UNIQUE (principal_id, role_id)
            )",
            "CREATE TABLE sessions (
                id BIGSERIAL PRIMARY KEY,
                uuid TEXT NOT NULL UNIQUE,
                principal_id BIGINT NOT NULL
                    REFERENCES principals (id) ON DELETE CASCADE,
                expiration_time BIGINT NOT NULL,
                revoked BIGINT NOT NULL DEFAULT 0,
                refresh_count BIGINT NOT NULL DEFAULT 0,
                time_created BIGINT NOT NULL,
                time_last_refreshed BIGINT
            )",
            "CREATE TABLE api_keys (
                id BIGSERIAL PRIMARY KEY,
                first_eight TEXT NOT NULL,
                hashed_secret TEXT NOT NULL,
                principal_id BIGINT NOT NULL
                    REFERENCES principals (id) ON DELETE CASCADE,
                expiration_time BIGINT,
                latest_activity BIGINT,
                note TEXT,
                scopes JSONB NOT NULL,
                access_tags JSONB,
                time_created BIGINT NOT NULL,
                UNIQUE (first_eight, hashed_secret)
            )",
        ],
    },
];

async fn stored_revision(pool: &AnyPool) -> Result<Option<String>> {
    let probe = sqlx::query(
        "SELECT revision FROM schema_revisions ORDER BY applied_at DESC, revision DESC LIMIT 1",
    )
    .fetch_optional(pool)
    .await;
    match probe {
        Ok(Some(row)) => Ok(Some(row.try_get::<String, _>("revision")?)),
        Ok(None) => Ok(None),
        // Table missing entirely: uninitialized database.
        Err(_) => Ok(None),
    }
}

/// Apply all revisions beyond the currently stamped one.
pub async fn initialize_database(pool: &AnyPool, dialect: Dialect) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_revisions (
            revision TEXT PRIMARY KEY,
            applied_at BIGINT NOT NULL
        )",
    )
    .execute(pool)
    .await?;
    let current = stored_revision(pool).await?;
    let mut apply = current.is_none();
    for migration in MIGRATIONS {
        if !apply {
            if Some(migration.id) == current.as_deref() {
                apply = true;
            }
            continue;
        }
        let statements = match dialect {
            Dialect::Sqlite => migration.sqlite,
            Dialect::Postgres => migration.postgres,
        };
        let mut tx = pool.begin().await?;
        for statement in statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        let stamp = match dialect {
            Dialect::Sqlite => "INSERT INTO schema_revisions (revision, applied_at) VALUES (?, ?)",
            Dialect::Postgres => {
                "INSERT INTO schema_revisions (revision, applied_at) VALUES ($1, $2)"
            }
        };
        sqlx::query(stamp)
            .bind(migration.id)
            .bind(chrono::Utc::now().timestamp())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        info!(revision = migration.id, "applied catalog schema revision");
    }
    Ok(())
}

/// Startup gate: pass when the stored revision matches; initialize when
/// absent and permitted; otherwise fail with the appropriate fatal error.
pub async fn check_catalog_database(
    pool: &AnyPool,
    dialect: Dialect,
    init_if_not_exists: bool,
) -> Result<()> {
    match stored_revision(pool).await? {
        Some(revision) if revision == REQUIRED_REVISION => Ok(()),
        Some(revision) => Err(TreeError::DatabaseUpgradeNeeded {
            found: Some(revision),
            required: REQUIRED_REVISION,
        }),
        None if init_if_not_exists => {
            info!("catalog database is new; creating tables and stamping revision");
            initialize_database(pool, dialect).await
        }
        None => Err(TreeError::UninitializedDatabase),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_pool() -> AnyPool {
        sqlx::any::install_default_drivers();
        AnyPool::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_stamps_required_revision() {
        let pool = memory_pool().await;
        initialize_database(&pool, Dialect::Sqlite).await.unwrap();
        let revision = stored_revision(&pool).await.unwrap();
        assert_eq!(revision.as_deref(), Some(REQUIRED_REVISION));
        // Idempotent: checking passes afterwards.
        check_catalog_database(&pool, Dialect::Sqlite, false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_uninitialized_database_is_fatal_without_init() {
        let pool = memory_pool().await;
        let err = check_catalog_database(&pool, Dialect::Sqlite, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::UninitializedDatabase));
    }

    #[tokio::test]
    async fn test_wrong_revision_demands_upgrade() {
        let pool = memory_pool().await;
        sqlx::query(
            "CREATE TABLE schema_revisions (revision TEXT PRIMARY KEY, applied_at BIGINT NOT NULL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO schema_revisions (revision, applied_at) VALUES ('0000-old', 0)")
            .execute(&pool)
            .await
            .unwrap();
        let err = check_catalog_database(&pool, Dialect::Sqlite, true)
            .await
            .unwrap_err();
        assert!(matches!(err, TreeError::DatabaseUpgradeNeeded { .. }));
    }
}
