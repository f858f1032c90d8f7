//! Custom versioned migration runner (spec §4.5, §9 ambient note).
//!
//! The spec's migration contract — scripts named `db/*_v<MAJOR.MINOR.PATCH>.sql`,
//! each content-hashed into an append-only `migration_history` table — is
//! not what `sqlx::migrate!` implements (that macro uses its own
//! sequential-integer versioning), so this is a small hand-rolled runner
//! in the same spirit as the teacher's `db.rs` (one connection, one
//! transaction per script, WAL-friendly).

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tracing::info;

use crate::error::StorageError;

struct MigrationScript {
    version: &'static str,
    description: &'static str,
    sql: &'static str,
}

/// Every migration script, embedded at compile time from `db/`, in
/// application order. Ordering here is authoritative — it does not rely on
/// lexicographic sort of the version strings.
const MIGRATIONS: &[MigrationScript] = &[
    MigrationScript {
        version: "0.1.0",
        description: "initial schema: zones, measurements, weather_records, settings",
        sql: include_str!("../../db/0001_init_v0.1.0.sql"),
    },
    MigrationScript {
        version: "0.1.1",
        description: "indexes for trend and weather-window queries",
        sql: include_str!("../../db/0002_indexes_v0.1.1.sql"),
    },
];

#[derive(Debug, PartialEq, Eq)]
pub enum MigrateOutcome {
    AlreadyInitialized,
    Applied(Vec<String>),
}

fn checksum_of(sql: &str) -> String {
    let digest = Sha256::digest(sql.as_bytes());
    format!("{digest:x}")
}

/// Split a script into individual statements, dropping blank lines and
/// full-line `--` comments. Good enough for the simple DDL the store ships.
fn split_statements(sql: &str) -> Vec<String> {
    sql.lines()
        .filter(|line| !line.trim_start().starts_with("--") && !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
        .split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

async fn table_exists(pool: &SqlitePool, name: &str) -> Result<bool, sqlx::Error> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(row.is_some())
}

fn now_millis() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as i64 / 1_000_000
}

/// Apply every unapplied migration, in order, each under one atomic
/// transaction. A checksum mismatch against an already-applied version is
/// fatal (spec §7: "Migration failures are fatal").
pub async fn migrate(pool: &SqlitePool) -> Result<MigrateOutcome, StorageError> {
    let mut applied = Vec::new();
    let history_table_exists = table_exists(pool, "migration_history").await?;

    for script in MIGRATIONS {
        let checksum = checksum_of(script.sql);

        let recorded: Option<(String,)> = if history_table_exists {
            sqlx::query_as("SELECT checksum FROM migration_history WHERE version = ?")
                .bind(script.version)
                .fetch_optional(pool)
                .await?
        } else {
            None
        };

        match recorded {
            Some((found,)) if found == checksum => continue,
            Some((found,)) => {
                return Err(StorageError::ChecksumMismatch {
                    version: script.version.to_string(),
                    expected: found,
                    found: checksum,
                });
            }
            None => {
                let mut tx = pool.begin().await?;
                for statement in split_statements(script.sql) {
                    sqlx::query(&statement).execute(&mut *tx).await?;
                }
                sqlx::query(
                    "INSERT INTO migration_history(version, description, checksum, applied_at_utc_millis) \
                     VALUES (?, ?, ?, ?)",
                )
                .bind(script.version)
                .bind(script.description)
                .bind(&checksum)
                .bind(now_millis())
                .execute(&mut *tx)
                .await?;
                tx.commit().await?;
                info!(version = script.version, "applied migration");
                applied.push(script.version.to_string());
            }
        }
    }

    if applied.is_empty() {
        Ok(MigrateOutcome::AlreadyInitialized)
    } else {
        Ok(MigrateOutcome::Applied(applied))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn first_run_applies_all_scripts() {
        let pool = memory_pool().await;
        let outcome = migrate(&pool).await.unwrap();
        assert_eq!(
            outcome,
            MigrateOutcome::Applied(vec!["0.1.0".to_string(), "0.1.1".to_string()])
        );
        assert!(table_exists(&pool, "zones").await.unwrap());
        assert!(table_exists(&pool, "measurements").await.unwrap());
    }

    #[tokio::test]
    async fn rerun_on_up_to_date_db_is_a_no_op() {
        let pool = memory_pool().await;
        migrate(&pool).await.unwrap();
        let second = migrate(&pool).await.unwrap();
        assert_eq!(second, MigrateOutcome::AlreadyInitialized);
    }

    #[tokio::test]
    async fn checksum_mismatch_is_fatal() {
        let pool = memory_pool().await;
        migrate(&pool).await.unwrap();
        sqlx::query("UPDATE migration_history SET checksum = 'tampered' WHERE version = '0.1.0'")
            .execute(&pool)
            .await
            .unwrap();
        let err = migrate(&pool).await.unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
    }

    #[test]
    fn statement_splitting_skips_comments_and_blanks() {
        let sql = "-- a comment\nCREATE TABLE t (a INTEGER);\n\nCREATE TABLE u (b INTEGER);\n";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE t"));
    }
}
