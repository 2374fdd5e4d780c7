//! Budget database schema: idempotent creation plus additive migrations.
//!
//! Every statement in [`create_schema`] is create-if-missing, so running it
//! against an existing database is a no-op. Migrations are additive column
//! changes; a "duplicate column name" error means the migration was already
//! applied and is skipped, any other error is a genuine failure and
//! propagates.

use crate::error::Result;
use tokio_rusqlite::Connection;

/// Additive migrations, applied in order after schema creation. Each entry is
/// (name, statement); the statement must be a single `ALTER TABLE ... ADD
/// COLUMN` so that re-running it can only fail with "duplicate column name".
const ADDITIVE_MIGRATIONS: &[(&str, &str)] = &[
    (
        "transactions_cleared_flag",
        "ALTER TABLE transactions ADD COLUMN cleared INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "transactions_transfer_account",
        "ALTER TABLE transactions ADD COLUMN transfer_account_id TEXT",
    ),
    (
        "categories_hidden_flag",
        "ALTER TABLE categories ADD COLUMN hidden INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "schedules_next_date",
        "ALTER TABLE schedules ADD COLUMN next_date TEXT",
    ),
    (
        "accounts_closed_flag",
        "ALTER TABLE accounts ADD COLUMN closed INTEGER NOT NULL DEFAULT 0",
    ),
];

/// Create the budgeting schema if it does not exist yet.
pub async fn create_schema(conn: &Connection) -> Result<()> {
    conn.call(|conn: &mut rusqlite::Connection| -> tokio_rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                offbudget INTEGER NOT NULL DEFAULT 0,
                sort_order REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS category_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_income INTEGER NOT NULL DEFAULT 0,
                sort_order REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS categories (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                group_id TEXT NOT NULL,
                sort_order REAL NOT NULL DEFAULT 0,
                FOREIGN KEY (group_id) REFERENCES category_groups(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS payees (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS transactions (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                payee_id TEXT,
                category_id TEXT,
                amount INTEGER NOT NULL,
                date TEXT NOT NULL,
                notes TEXT,
                parent_id TEXT,
                FOREIGN KEY (account_id) REFERENCES accounts(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_transactions_account_date
                ON transactions(account_id, date);

            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                payee_id TEXT,
                account_id TEXT,
                amount INTEGER,
                frequency TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    })
    .await?;

    Ok(())
}

/// Apply additive migrations on top of an existing schema.
///
/// "Duplicate column name" means already applied and is skipped at debug
/// level; any other failure propagates so it is never silently masked.
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    for (name, statement) in ADDITIVE_MIGRATIONS {
        let result = conn
            .call({
                let statement = statement.to_string();
                move |conn: &mut rusqlite::Connection| -> tokio_rusqlite::Result<()> {
                    conn.execute(&statement, [])?;
                    Ok(())
                }
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!("Applied migration '{}'", name);
            }
            Err(e) if is_already_applied(&e) => {
                tracing::debug!("Migration '{}' already applied, skipping", name);
            }
            Err(e) => {
                tracing::warn!("Migration '{}' failed: {}", name, e);
                return Err(e.into());
            }
        }
    }
    Ok(())
}

/// String matching is unavoidable here: tokio_rusqlite wraps the underlying
/// rusqlite error opaquely, so we can't match on error codes.
fn is_already_applied(e: &tokio_rusqlite::Error) -> bool {
    e.to_string().contains("duplicate column name")
}
