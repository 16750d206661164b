//! SQLite schema bootstrap shared by the blob catalog and the metadata index.

use anyhow::Result;
use sqlx::SqlitePool;

const INIT_SQL: &str = include_str!("../migrations/0001_init.sql");

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> Result<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    tracing::info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        tracing::debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// A migrated, private in-memory database for tests.
#[cfg(test)]
pub async fn memory_pool() -> std::sync::Arc<SqlitePool> {
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    run_migrations(&pool).await.expect("apply schema");
    std::sync::Arc::new(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = memory_pool().await;
        run_migrations(&pool).await.unwrap();

        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&*pool)
        .await
        .unwrap();
        assert_eq!(
            tables,
            vec![
                "blob_buckets",
                "blob_objects",
                "index_catalog",
                "index_documents"
            ]
        );
    }
}
