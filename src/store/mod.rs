//! Persistence for users and chat history.
//!
//! The hub and the HTTP routes only ever see [`Store`]; production runs on
//! [`MySqlStore`], tests on the in-memory double.

#[cfg(test)]
pub mod memory;
mod mysql;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{ChatMessage, User, UserProfile, UserStatus};

pub use mysql::MySqlStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Exact, case-sensitive lookup.
    async fn find_user(&self, username: &str) -> Result<Option<User>, StoreError>;

    /// Case-insensitive check, matching the collation of the unique index.
    async fn username_taken(&self, username: &str) -> Result<bool, StoreError>;

    /// Fails with [`StoreError::Duplicate`] when the unique index rejects the name.
    async fn create_user(&self, username: &str, password_hash: &str) -> Result<i64, StoreError>;

    async fn list_users(&self) -> Result<Vec<UserProfile>, StoreError>;

    async fn update_status(&self, username: &str, status: UserStatus) -> Result<(), StoreError>;

    async fn update_avatar(&self, username: &str, avatar_url: Option<&str>) -> Result<(), StoreError>;

    async fn insert_message(
        &self,
        user_id: i64,
        username: &str,
        content: &str,
    ) -> Result<ChatMessage, StoreError>;

    /// Newest `limit` messages with an id below `before`, returned oldest first.
    async fn recent_messages(
        &self,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    async fn find_message(&self, id: i64) -> Result<Option<ChatMessage>, StoreError>;

    async fn delete_message(&self, id: i64) -> Result<bool, StoreError>;

    async fn clear_messages(&self) -> Result<u64, StoreError>;
}
