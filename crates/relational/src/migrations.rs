use sqlx::PgPool;

use crate::config::RelationalConfig;

/// Create the locks table if it does not already exist.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if the DDL statement fails.
pub async fn run_migrations(pool: &PgPool, config: &RelationalConfig) -> Result<(), sqlx::Error> {
    let table = config.locks_table();

    let create_locks = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            name TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            expires_at TIMESTAMPTZ NOT NULL
        )"
    );

    sqlx::query(&create_locks).execute(pool).await?;
    Ok(())
}
