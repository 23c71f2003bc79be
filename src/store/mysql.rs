use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlSslMode};
use sqlx::FromRow;

use super::Store;
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::models::{ChatMessage, User, UserProfile, UserStatus};

const MAX_CONNECTIONS: u32 = 5;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

const CREATE_USERS: &str = "CREATE TABLE IF NOT EXISTS users (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    username VARCHAR(64) NOT NULL UNIQUE,
    password VARCHAR(255) NOT NULL,
    avatar_url MEDIUMTEXT NULL,
    status VARCHAR(16) NOT NULL DEFAULT 'online'
)";

const CREATE_MESSAGES: &str = "CREATE TABLE IF NOT EXISTS messages (
    id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY,
    user_id BIGINT NULL,
    username VARCHAR(64) NOT NULL,
    content TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    INDEX idx_messages_created_at (created_at)
)";

const MESSAGE_COLUMNS: &str = "id, user_id, username, content, created_at";

#[derive(FromRow)]
struct UserRow {
    id: i64,
    username: String,
    password: String,
    avatar_url: Option<String>,
    status: Option<String>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            username: row.username,
            password_hash: row.password,
            avatar_url: row.avatar_url,
            status: parse_status(row.status.as_deref()),
        }
    }
}

#[derive(FromRow)]
struct ProfileRow {
    username: String,
    avatar_url: Option<String>,
    status: Option<String>,
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    user_id: Option<i64>,
    username: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        ChatMessage {
            id: row.id,
            user_id: row.user_id,
            username: row.username,
            content: row.content,
            created_at: row.created_at,
            persisted: true,
        }
    }
}

fn parse_status(raw: Option<&str>) -> UserStatus {
    match raw.map(str::parse::<UserStatus>) {
        Some(Ok(status)) => status,
        Some(Err(e)) => {
            warn!("Stored status unreadable, treating as online: {e}");
            UserStatus::Online
        }
        None => UserStatus::Online,
    }
}

fn map_insert_error(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
        _ => StoreError::Database(err),
    }
}

fn to_row_id(raw: u64) -> Result<i64, StoreError> {
    i64::try_from(raw)
        .map_err(|_| StoreError::Database(sqlx::Error::Protocol(format!("row id {raw} out of range"))))
}

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let ssl_mode = if config.wants_tls() {
            MySqlSslMode::Preferred
        } else {
            MySqlSslMode::Disabled
        };

        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.name)
            .ssl_mode(ssl_mode);

        let pool = MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await?;

        info!("MySQL connected to {}:{}/{}", config.host, config.port, config.name);
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_USERS).execute(&self.pool).await?;
        sqlx::query(CREATE_MESSAGES).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for MySqlStore {
    async fn find_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password, avatar_url, status FROM users WHERE BINARY username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(User::from))
    }

    async fn username_taken(&self, username: &str) -> Result<bool, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE LOWER(username) = LOWER(?)")
                .bind(username)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<i64, StoreError> {
        let result = sqlx::query("INSERT INTO users (username, password) VALUES (?, ?)")
            .bind(username)
            .bind(password_hash)
            .execute(&self.pool)
            .await
            .map_err(map_insert_error)?;
        to_row_id(result.last_insert_id())
    }

    async fn list_users(&self) -> Result<Vec<UserProfile>, StoreError> {
        let rows = sqlx::query_as::<_, ProfileRow>(
            "SELECT username, avatar_url, status FROM users ORDER BY username",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| UserProfile {
                status: parse_status(row.status.as_deref()),
                username: row.username,
                avatar_url: row.avatar_url,
            })
            .collect())
    }

    async fn update_status(&self, username: &str, status: UserStatus) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET status = ? WHERE BINARY username = ?")
            .bind(status.as_str())
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_avatar(&self, username: &str, avatar_url: Option<&str>) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET avatar_url = ? WHERE BINARY username = ?")
            .bind(avatar_url)
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_message(
        &self,
        user_id: i64,
        username: &str,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        let result = sqlx::query("INSERT INTO messages (user_id, username, content) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(username)
            .bind(content)
            .execute(&self.pool)
            .await?;

        let id = to_row_id(result.last_insert_id())?;
        self.find_message(id)
            .await?
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))
    }

    async fn recent_messages(
        &self,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let query = format!(
            "SELECT * FROM (SELECT {MESSAGE_COLUMNS} FROM messages WHERE id < ? ORDER BY id DESC LIMIT ?) recent ORDER BY id ASC"
        );
        let rows = sqlx::query_as::<_, MessageRow>(&query)
            .bind(before.unwrap_or(i64::MAX))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(ChatMessage::from).collect())
    }

    async fn find_message(&self, id: i64) -> Result<Option<ChatMessage>, StoreError> {
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?");
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(ChatMessage::from))
    }

    async fn delete_message(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear_messages(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM messages").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
