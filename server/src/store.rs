//! User store collaborator
//!
//! The relay owns no persisted data; users, contact links, and presence
//! flags live in the application database. This module is the boundary to
//! it: contact lookup for presence fan-out, the online flag, and the
//! last-seen stamp. Everything else (user CRUD, messages, attachments) is
//! the REST layer's business.

use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Pool, Sqlite};
use tracing::info;

/// SQLite-backed user store.
pub struct UserStore {
    pool: Pool<Sqlite>,
}

impl UserStore {
    /// Open (creating if necessary) the database and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self> {
        if !Sqlite::database_exists(database_url).await.unwrap_or(false) {
            info!("Creating database at {}", database_url);
            Sqlite::create_database(database_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Wrap an existing pool (tests use `:memory:` pools).
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create the tables this store reads and writes.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running user store migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                is_online INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                user_id INTEGER NOT NULL,
                contact_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now')),
                PRIMARY KEY (user_id, contact_id),
                FOREIGN KEY (user_id) REFERENCES users(id),
                FOREIGN KEY (contact_id) REFERENCES users(id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_contacts_user
            ON contacts(user_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Ids of every contact of `user_id`. The relay routes by id only;
    /// profile data stays with the REST layer.
    pub async fn get_contacts(&self, user_id: i64) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT contact_id FROM contacts WHERE user_id = ?1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Persist the online flag for `user_id`.
    pub async fn set_online(&self, user_id: i64, online: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_online = ?2 WHERE id = ?1")
            .bind(user_id)
            .bind(online)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stamp `user_id`'s last-seen time with the current clock.
    pub async fn touch_last_seen(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen = strftime('%s', 'now') WHERE id = ?1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Current `(is_online, last_seen)` for `user_id`, if the user exists.
    pub async fn online_state(&self, user_id: i64) -> Result<Option<(bool, i64)>> {
        let row: Option<(bool, i64)> =
            sqlx::query_as("SELECT is_online, last_seen FROM users WHERE id = ?1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }
}
