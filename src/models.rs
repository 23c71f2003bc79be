use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ADMIN_USERNAME: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    #[default]
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Online => "online",
            UserStatus::Idle => "idle",
            UserStatus::Dnd => "dnd",
            UserStatus::Invisible => "invisible",
            UserStatus::Offline => "offline",
        }
    }

    /// Statuses a user may pick for themselves. `Offline` is only ever set by a disconnect.
    pub fn is_selectable(self) -> bool {
        self != UserStatus::Offline
    }
}

impl fmt::Display for UserStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UserStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(UserStatus::Online),
            "idle" => Ok(UserStatus::Idle),
            "dnd" => Ok(UserStatus::Dnd),
            "invisible" => Ok(UserStatus::Invisible),
            "offline" => Ok(UserStatus::Offline),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub avatar_url: Option<String>,
    pub status: UserStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub username: String,
    pub avatar_url: Option<String>,
    pub status: UserStatus,
}

/// A chat line as clients see it, both over the socket and from `/api/messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub user_id: Option<i64>,
    pub username: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub persisted: bool,
}

impl ChatMessage {
    pub fn can_be_deleted_by(&self, username: &str) -> bool {
        self.username == username || username == ADMIN_USERNAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            UserStatus::Online,
            UserStatus::Idle,
            UserStatus::Dnd,
            UserStatus::Invisible,
            UserStatus::Offline,
        ] {
            assert_eq!(status.as_str().parse::<UserStatus>(), Ok(status));
        }
        assert!("away".parse::<UserStatus>().is_err());
        assert!(!UserStatus::Offline.is_selectable());
    }

    #[test]
    fn only_author_or_admin_may_delete() {
        let message = ChatMessage {
            id: 1,
            user_id: Some(7),
            username: "alice".into(),
            content: "hi".into(),
            created_at: Utc::now(),
            persisted: true,
        };
        assert!(message.can_be_deleted_by("alice"));
        assert!(message.can_be_deleted_by(ADMIN_USERNAME));
        assert!(!message.can_be_deleted_by("bob"));
    }
}
