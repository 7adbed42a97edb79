use anyhow::{Context, Result};
use sqlx::PgPool;

/// Embedded SQL migration with version, direction, and content.
struct Migration {
    version: u32,
    up_sql: &'static str,
    down_sql: &'static str,
}

/// All embedded migrations, ordered by version.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    up_sql: include_str!("sql/001_sessions.up.sql"),
    down_sql: include_str!("sql/001_sessions.down.sql"),
}];

/// Manages session store schema migrations.
///
/// Compatible with golang-migrate's Postgres `schema_migrations` table
/// (a single row holding `version` and `dirty`).
pub trait Migrator: Send {
    /// Applies all pending forward migrations.
    fn up(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Rolls back the last applied migration.
    fn down(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Returns the current migration version and dirty flag.
    fn status(&self) -> impl std::future::Future<Output = Result<(u32, bool)>> + Send;
}

/// Postgres migration runner.
pub struct PostgresMigrator {
    pool: PgPool,
}

impl PostgresMigrator {
    /// Creates a new migrator using the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Ensures the schema_migrations tracking table exists.
    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT NOT NULL PRIMARY KEY,
                dirty BOOLEAN NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating schema_migrations table")?;

        Ok(())
    }

    /// Returns the current migration version and dirty state.
    async fn current_version(&self) -> Result<(u32, bool)> {
        let row: Option<(i64, bool)> =
            sqlx::query_as("SELECT version, dirty FROM schema_migrations LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .context("querying migration version")?;

        match row {
            Some((version, dirty)) => {
                let version = u32::try_from(version)
                    .with_context(|| format!("migration version {version} out of range"))?;
                Ok((version, dirty))
            }
            None => Ok((0, false)),
        }
    }

    /// Replaces the tracked version. Version 0 clears the table.
    async fn set_version(&self, version: u32, dirty: bool) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("starting migration version transaction")?;

        sqlx::query("DELETE FROM schema_migrations")
            .execute(&mut *tx)
            .await
            .context("clearing schema_migrations")?;

        if version > 0 {
            sqlx::query("INSERT INTO schema_migrations (version, dirty) VALUES ($1, $2)")
                .bind(i64::from(version))
                .bind(dirty)
                .execute(&mut *tx)
                .await
                .context("inserting migration version")?;
        }

        tx.commit().await.context("committing migration version")?;

        Ok(())
    }

    /// Splits a SQL string into individual statements and executes each.
    async fn execute_sql(&self, sql: &str) -> Result<()> {
        for statement in split_statements(sql) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .with_context(|| {
                    let preview: String = statement.chars().take(80).collect();
                    format!("executing migration statement: {preview}...")
                })?;
        }

        Ok(())
    }
}

impl Migrator for PostgresMigrator {
    async fn up(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, dirty) = self.current_version().await?;

        if dirty {
            anyhow::bail!(
                "migration version {current_version} is dirty, manual intervention required"
            );
        }

        tracing::info!(current_version, "running migrations");

        let mut applied = 0u32;

        for migration in pending(current_version) {
            tracing::info!(version = migration.version, "applying migration");

            self.set_version(migration.version, true).await?;

            self.execute_sql(migration.up_sql)
                .await
                .with_context(|| format!("applying migration version {}", migration.version))?;

            self.set_version(migration.version, false).await?;

            applied += 1;
        }

        if applied == 0 {
            tracing::info!("no pending migrations");
        } else {
            let (final_version, _) = self.current_version().await?;
            tracing::info!(version = final_version, applied, "migrations completed");
        }

        Ok(())
    }

    async fn down(&self) -> Result<()> {
        self.ensure_migrations_table().await?;

        let (current_version, _) = self.current_version().await?;

        if current_version == 0 {
            tracing::info!("no migrations to roll back");
            return Ok(());
        }

        let migration = MIGRATIONS
            .iter()
            .find(|m| m.version == current_version)
            .with_context(|| format!("migration version {current_version} not found"))?;

        tracing::info!(version = current_version, "rolling back migration");

        self.set_version(current_version, true).await?;

        self.execute_sql(migration.down_sql)
            .await
            .with_context(|| format!("rolling back migration version {current_version}"))?;

        let prev_version = previous_version(current_version);
        self.set_version(prev_version, false).await?;

        tracing::info!(version = prev_version, "rollback completed");

        Ok(())
    }

    async fn status(&self) -> Result<(u32, bool)> {
        self.ensure_migrations_table().await?;
        self.current_version().await
    }
}

/// Migrations newer than `current`, in apply order.
fn pending(current: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > current)
}

/// Highest embedded version below `current`, or 0.
fn previous_version(current: u32) -> u32 {
    MIGRATIONS
        .iter()
        .filter(|m| m.version < current)
        .map(|m| m.version)
        .max()
        .unwrap_or(0)
}

/// Splits SQL text into individual statements by semicolons.
///
/// Handles empty lines and whitespace-only segments.
fn split_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_statements_basic() {
        let sql = "CREATE TABLE foo (id BIGINT); CREATE INDEX foo_idx ON foo (id);";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE foo"));
        assert!(stmts[1].starts_with("CREATE INDEX foo_idx"));
    }

    #[test]
    fn test_split_statements_empty_and_trailing() {
        assert!(split_statements("").is_empty());
        assert_eq!(split_statements("SELECT 1;;;").len(), 1);
    }

    #[test]
    fn test_sessions_migration_shape() {
        let stmts = split_statements(MIGRATIONS[0].up_sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("CREATE TABLE IF NOT EXISTS sessions"));
        assert!(stmts[1].contains("WHERE end_time IS NULL"));

        let down = split_statements(MIGRATIONS[0].down_sql);
        assert_eq!(down.last().copied(), Some("DROP TABLE IF EXISTS sessions"));
    }

    #[test]
    fn test_migrations_ordered_and_non_empty() {
        for m in MIGRATIONS {
            assert!(m.version > 0);
            assert!(!m.up_sql.trim().is_empty(), "migration {} up SQL is empty", m.version);
            assert!(!m.down_sql.trim().is_empty(), "migration {} down SQL is empty", m.version);
        }
        for window in MIGRATIONS.windows(2) {
            assert!(window[0].version < window[1].version);
        }
    }

    #[test]
    fn test_pending_and_previous_version() {
        assert_eq!(pending(0).count(), MIGRATIONS.len());
        assert_eq!(pending(1).count(), MIGRATIONS.len() - 1);
        assert_eq!(previous_version(1), 0);
    }
}
