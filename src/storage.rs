use crate::config::{self, KEY_SESSION};
use crate::models::{Session, Settings};
use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;

// Everything the app persists is a named string value
const MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

#[derive(Debug)]
pub struct StorageManager {
    pool: SqlitePool,
}

impl StorageManager {
    /// Opens (creating if needed) the database file at `db_path` and runs migrations.
    pub async fn open(db_path: &Path) -> Result<Self, anyhow::Error> {
        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context("Failed to create database directory")?;
            }
        }

        log::info!("Connecting to database: {}", db_path.display());
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// A private in-memory database. A single connection that never expires,
    /// otherwise each pooled connection would see its own empty database.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;

        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::debug!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        log::debug!("Reading stored value: {}", key);
        sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to read '{}' from database", key))
    }

    pub async fn set_value(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        log::debug!("Writing stored value: {} ({} bytes)", key, value.len());
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context(format!("Failed to write '{}' to database", key))?;
        Ok(())
    }

    /// All stored key/value pairs, ordered by key.
    pub async fn list_values(&self) -> Result<Vec<(String, String)>, anyhow::Error> {
        sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings ORDER BY key ASC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list stored values")
    }

    /// Writes every settings field, overwriting what was there.
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), anyhow::Error> {
        for (key, value) in config::settings_fields(settings) {
            self.set_value(key, value).await?;
        }
        log::info!("Settings saved");
        Ok(())
    }

    /// Reads every settings field, falling back to the default for missing ones.
    pub async fn load_settings(&self) -> Result<Settings, anyhow::Error> {
        let mut settings = config::default_settings();
        let keys = config::settings_fields(&config::default_settings()).map(|(key, _)| key);
        for key in keys {
            let Some(value) = self.get_value(key).await? else {
                continue;
            };
            let slot = match key {
                config::KEY_API_KEY => &mut settings.api_key,
                config::KEY_MODEL => &mut settings.model,
                config::KEY_API_BASE => &mut settings.api_base,
                config::KEY_USER_PERSONA => &mut settings.user_persona,
                config::KEY_USER_NOTE => &mut settings.user_note,
                config::KEY_SYSTEM_PROMPT => &mut settings.system_prompt,
                config::KEY_CONTEXT_SIZE => &mut settings.context_size,
                _ => continue,
            };
            *slot = value;
        }
        Ok(settings)
    }

    /// Overwrites the persisted session with the whole in-memory one.
    pub async fn save_session(&self, session: &Session) -> Result<(), anyhow::Error> {
        let json = serde_json::to_string(session).context("Failed to serialize session")?;
        self.set_value(KEY_SESSION, &json).await?;
        log::debug!("Persisted session with {} messages", session.messages.len());
        Ok(())
    }

    /// The raw persisted session, unparsed. Parsing is the caller's business
    /// since a corrupt value is reported differently from a storage failure.
    pub async fn load_session_json(&self) -> Result<Option<String>, anyhow::Error> {
        self.get_value(KEY_SESSION).await
    }
}
