//! Schema migration runner for the SQLite-backed [`super::SqliteStore`].
//!
//! Mirrors a hand-tracked `_migrations` table rather than an external
//! migration framework: each migration is a named SQL file executed as one
//! batch via `raw_sql` (splitting on semicolons would break the multi-table
//! schema files), and its version is recorded once applied so restarts are
//! idempotent.

use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

pub struct Migrator {
    pool: SqlitePool,
}

impl Migrator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_migration_table(&self) -> crate::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn applied_versions(&self) -> crate::Result<Vec<i64>> {
        let rows = sqlx::query("SELECT version FROM _migrations ORDER BY version").fetch_all(&self.pool).await?;
        rows.iter().map(|r| r.try_get::<i64, _>("version").map_err(crate::Error::from)).collect()
    }

    async fn record(&self, version: i64, name: &str) -> crate::Result<()> {
        sqlx::query("INSERT INTO _migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(version)
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Run all pending migrations, in order, skipping ones already recorded.
    pub async fn migrate(&self) -> crate::Result<()> {
        self.init_migration_table().await?;
        let applied = self.applied_versions().await?;

        let migrations: &[(i64, &str, &str)] =
            &[(1, "initial_schema", include_str!("../../migrations/001_initial_schema.sql"))];

        for (version, name, sql) in migrations {
            if applied.contains(version) {
                info!(version, name, "migration already applied, skipping");
                continue;
            }
            info!(version, name, "applying migration");
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            self.record(*version, name).await?;
        }

        Ok(())
    }

    pub async fn status(&self) -> crate::Result<DbStatus> {
        self.init_migration_table().await?;
        let applied = self.applied_versions().await?;

        let job_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs").fetch_one(&self.pool).await.unwrap_or(0);
        let scheduled_job_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_jobs").fetch_one(&self.pool).await.unwrap_or(0);

        Ok(DbStatus {
            applied_migrations: applied.len() as i64,
            job_count,
            scheduled_job_count,
        })
    }

    /// Drops every table this crate owns and re-runs migrations from scratch.
    /// Intended for operator tooling, never called by the daemon itself.
    pub async fn reset(&self) -> crate::Result<()> {
        warn!("resetting store: dropping all tables");
        for table in ["schedule_executions", "scheduled_jobs", "job_history", "jobs", "_migrations"] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", table)).execute(&self.pool).await?;
        }
        self.migrate().await
    }
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub applied_migrations: i64,
    pub job_count: i64,
    pub scheduled_job_count: i64,
}

/// Convenience wrapper used at daemon startup.
pub async fn auto_migrate(pool: &SqlitePool) -> crate::Result<()> {
    Migrator::new(pool.clone()).migrate().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await.unwrap();
        let migrator = Migrator::new(pool.clone());
        migrator.migrate().await.unwrap();
        migrator.migrate().await.unwrap();

        let status = migrator.status().await.unwrap();
        assert_eq!(status.applied_migrations, 1);
        assert_eq!(status.job_count, 0);
    }
}
