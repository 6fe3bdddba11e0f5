//! Commit log schema migrations
//!
//! Each migration runs once, in version order, inside its own SQLite
//! transaction, and is recorded in `_migrations`.

use sqlx::SqlitePool;

/// One schema step
struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "commit log",
        sql: r#"
            -- One row per committed transaction, in commit order
            CREATE TABLE IF NOT EXISTS commit_log (
                sequence INTEGER PRIMARY KEY NOT NULL,
                transaction_id TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                committed_at TIMESTAMP NOT NULL,
                payload TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_commit_log_committed_at ON commit_log(committed_at);
        "#,
    },
    Migration {
        version: 2,
        name: "per-node commit index",
        sql: r#"
            CREATE TABLE IF NOT EXISTS commit_log_nodes (
                sequence INTEGER NOT NULL REFERENCES commit_log(sequence) ON DELETE CASCADE,
                node_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('upsert', 'survivor', 'retired', 'edge_endpoint')),
                PRIMARY KEY (sequence, node_id, role)
            );

            CREATE INDEX IF NOT EXISTS idx_commit_log_nodes_node_id ON commit_log_nodes(node_id);

            -- Logs written before the index existed
            INSERT OR IGNORE INTO commit_log_nodes (sequence, node_id, role)
            SELECT c.sequence, json_extract(n.value, '$.id'), 'upsert'
            FROM commit_log c, json_each(json_extract(c.payload, '$.transaction.node_upserts')) n;
        "#,
    },
];

/// Latest schema version
pub const CURRENT_VERSION: i32 = 2;

async fn applied_version(pool: &SqlitePool) -> anyhow::Result<i32> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY NOT NULL,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        );",
    )
    .execute(pool)
    .await?;

    let (version,): (Option<i32>,) = sqlx::query_as("SELECT MAX(version) FROM _migrations")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

/// Bring the commit log schema up to [`CURRENT_VERSION`]
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    let from = applied_version(pool).await?;
    if from >= CURRENT_VERSION {
        tracing::debug!(version = from, "Commit log schema is current");
        return Ok(());
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > from) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying commit log migration"
        );
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(migration.sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO _migrations (version) VALUES (?)")
            .bind(migration.version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }
    Ok(())
}

/// Schema version report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub current_version: i32,
    pub target_version: i32,
    pub needs_migration: bool,
}

pub async fn migration_status(pool: &SqlitePool) -> anyhow::Result<MigrationStatus> {
    let current_version = applied_version(pool).await?;
    Ok(MigrationStatus {
        current_version,
        target_version: CURRENT_VERSION,
        needs_migration: current_version < CURRENT_VERSION,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[test]
    fn test_versions_are_contiguous() {
        for (i, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version, i as i32 + 1);
        }
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(CURRENT_VERSION));
    }

    #[tokio::test]
    async fn test_migrate_from_empty_then_rerun() {
        let pool = pool().await;
        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, 0);
        assert!(status.needs_migration);

        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();

        let status = migration_status(&pool).await.unwrap();
        assert_eq!(status.current_version, CURRENT_VERSION);
        assert!(!status.needs_migration);

        let (rows,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _migrations")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, CURRENT_VERSION as i64);
    }

    #[tokio::test]
    async fn test_v2_backfills_node_index() {
        let pool = pool().await;
        sqlx::raw_sql(MIGRATIONS[0].sql).execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO _migrations (version) VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO commit_log (sequence, transaction_id, committed_at, payload)
             VALUES (1, 't1', CURRENT_TIMESTAMP, ?)",
        )
        .bind(r#"{"transaction": {"node_upserts": [{"id": "n1"}, {"id": "n2"}]}}"#)
        .execute(&pool)
        .await
        .unwrap();

        run_migrations(&pool).await.unwrap();

        let (indexed,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM commit_log_nodes")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(indexed, 2);
    }
}
