//! Shared SQLite plumbing for the three store files.
//!
//! Each store (queue, catalog, registry) owns its own database file and
//! runs its own additive migration step at construction.  Queries use the
//! runtime-verified `sqlx::query` form so no `DATABASE_URL` is needed at
//! compile time.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

/// Open (or create) the SQLite database at `path`.
///
/// WAL mode keeps readers unblocked while a writer commits; the busy
/// timeout absorbs the brief storage-level serialization between
/// concurrent store operations.
pub(crate) async fn open_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
}

/// Add `column` to `table` when it is not present yet.
///
/// This is the additive half of the migration policy: columns are only
/// ever added, never altered or dropped.  Safe to run on every startup.
pub(crate) async fn ensure_column(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    ddl: &str,
) -> Result<(), sqlx::Error> {
    let (present,): (i64,) = sqlx::query_as(&format!(
        "SELECT COUNT(*) FROM pragma_table_info('{table}') WHERE name = ?1"
    ))
    .bind(column)
    .fetch_one(pool)
    .await?;

    if present == 0 {
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {ddl}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}

/// Current time as a fixed-width RFC 3339 string.
///
/// Fixed fractional width so that lexicographic order of stored
/// timestamps matches chronological order (the claim query sorts on the
/// raw column).
pub(crate) fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Render a timestamp the same way [`now_str`] does.
pub(crate) fn ts_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, falling back to now on corruption.
pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        tracing::warn!(raw = %raw, error = %e, "failed to parse stored timestamp; using now");
        Utc::now()
    })
}
