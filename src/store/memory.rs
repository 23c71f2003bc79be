use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::Store;
use crate::error::StoreError;
use crate::models::{ChatMessage, User, UserProfile, UserStatus};

#[derive(Default)]
struct Tables {
    users: Vec<User>,
    messages: Vec<ChatMessage>,
    next_user_id: i64,
    next_message_id: i64,
}

/// Test double mirroring the MySQL semantics the rest of the crate relies on.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent call fails with [`StoreError::Unavailable`] while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn message_count(&self) -> usize {
        self.tables.read().await.messages.len()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, username: &str) -> Result<Option<User>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.users.iter().find(|u| u.username == username).cloned())
    }

    async fn username_taken(&self, username: &str) -> Result<bool, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables
            .users
            .iter()
            .any(|u| u.username.eq_ignore_ascii_case(username)))
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> Result<i64, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if tables
            .users
            .iter()
            .any(|u| u.username.eq_ignore_ascii_case(username))
        {
            return Err(StoreError::Duplicate);
        }
        tables.next_user_id += 1;
        let id = tables.next_user_id;
        tables.users.push(User {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            avatar_url: None,
            status: UserStatus::Online,
        });
        Ok(id)
    }

    async fn list_users(&self) -> Result<Vec<UserProfile>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        let mut users: Vec<UserProfile> = tables
            .users
            .iter()
            .map(|u| UserProfile {
                username: u.username.clone(),
                avatar_url: u.avatar_url.clone(),
                status: u.status,
            })
            .collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn update_status(&self, username: &str, status: UserStatus) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if let Some(user) = tables.users.iter_mut().find(|u| u.username == username) {
            user.status = status;
        }
        Ok(())
    }

    async fn update_avatar(&self, username: &str, avatar_url: Option<&str>) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        if let Some(user) = tables.users.iter_mut().find(|u| u.username == username) {
            user.avatar_url = avatar_url.map(str::to_string);
        }
        Ok(())
    }

    async fn insert_message(
        &self,
        user_id: i64,
        username: &str,
        content: &str,
    ) -> Result<ChatMessage, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        tables.next_message_id += 1;
        let message = ChatMessage {
            id: tables.next_message_id,
            user_id: Some(user_id),
            username: username.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            persisted: true,
        };
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn recent_messages(
        &self,
        limit: u32,
        before: Option<i64>,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        let bound = before.unwrap_or(i64::MAX);
        let mut recent: Vec<ChatMessage> = tables
            .messages
            .iter()
            .rev()
            .filter(|m| m.id < bound)
            .take(limit as usize)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn find_message(&self, id: i64) -> Result<Option<ChatMessage>, StoreError> {
        self.check()?;
        let tables = self.tables.read().await;
        Ok(tables.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn delete_message(&self, id: i64) -> Result<bool, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let before = tables.messages.len();
        tables.messages.retain(|m| m.id != id);
        Ok(tables.messages.len() < before)
    }

    async fn clear_messages(&self) -> Result<u64, StoreError> {
        self.check()?;
        let mut tables = self.tables.write().await;
        let removed = tables.messages.len() as u64;
        tables.messages.clear();
        Ok(removed)
    }
}
