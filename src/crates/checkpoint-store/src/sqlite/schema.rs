//! SQLite schema migrations
//!
//! Built-in migrations are embedded SQL files under `migrations/`. Each one runs
//! inside the transaction that records it in `checkpoint_migrations`, so a
//! failing statement leaves neither schema changes nor a version row behind.

use crate::error::Result;
use crate::traits::Migration;
use async_trait::async_trait;
use sqlx::SqliteConnection;

/// Version bookkeeping table; created on connect, outside the numbered sequence
pub(crate) const MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS checkpoint_migrations (
    version INTEGER PRIMARY KEY NOT NULL,
    description TEXT NOT NULL,
    applied_at INTEGER NOT NULL
)";

/// Migration made of plain SQL statements
#[derive(Debug, Clone)]
pub struct SqlMigration {
    description: String,
    sql: String,
}

impl SqlMigration {
    pub fn new(description: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            sql: sql.into(),
        }
    }

    /// Individual statements, `--` comment lines removed
    pub fn statements(&self) -> Vec<String> {
        let stripped: String = self
            .sql
            .lines()
            .filter(|line| !line.trim_start().starts_with("--"))
            .collect::<Vec<_>>()
            .join("\n");
        stripped
            .split(';')
            .map(str::trim)
            .filter(|statement| !statement.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl Migration<SqliteConnection> for SqlMigration {
    fn description(&self) -> &str {
        &self.description
    }

    async fn up(&self, conn: &mut SqliteConnection) -> Result<()> {
        for statement in self.statements() {
            sqlx::query(&statement).execute(&mut *conn).await?;
        }
        Ok(())
    }
}

/// Built-in migrations, version 1 first
pub fn builtin_migrations() -> Vec<Box<dyn Migration<SqliteConnection>>> {
    [
        (
            "create checkpoint tables",
            include_str!("../../migrations/0001_checkpoint_tables.sql"),
        ),
        (
            "index parents, pending writes and blob producers",
            include_str!("../../migrations/0002_indexes.sql"),
        ),
        (
            "add blob content digest",
            include_str!("../../migrations/0003_blob_digest.sql"),
        ),
    ]
    .into_iter()
    .map(|(description, sql)| {
        Box::new(SqlMigration::new(description, sql)) as Box<dyn Migration<SqliteConnection>>
    })
    .collect()
}
