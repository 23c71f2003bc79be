//! In-memory presence: who is online, in voice, typing or sharing a screen.
//!
//! None of this is persisted. A restart starts from empty maps and clients
//! rebuild it by reconnecting.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use crate::messages::VoiceMember;
use crate::models::UserStatus;

pub const TYPING_TTL: Duration = Duration::from_secs(6);

/// What a socket left behind when it went away.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Departure {
    pub username: String,
    pub was_in_voice: bool,
    pub was_typing: bool,
    pub ended_share: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ShareOutcome {
    /// The actor now owns the slot. Carries the peer ids of the other voice members.
    Started { viewers: Vec<String> },
    Denied { sharer: String },
}

#[derive(Debug, PartialEq, Eq)]
pub struct ReactionState {
    pub active: bool,
    pub count: usize,
}

#[derive(Default)]
pub struct PresenceStore {
    active_users: HashMap<String, String>,
    voice_users: BTreeMap<String, String>,
    user_status: HashMap<String, UserStatus>,
    typing_users: HashMap<String, Instant>,
    screen_share: Option<VoiceMember>,
    reactions: HashMap<i64, BTreeMap<String, BTreeSet<String>>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `socket_id` to `username`, dropping any stale socket the user had.
    /// Returns the socket ids that were replaced.
    pub fn join(&mut self, socket_id: &str, username: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .active_users
            .iter()
            .filter(|(id, name)| name.as_str() == username && id.as_str() != socket_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.active_users.remove(id);
        }
        self.active_users
            .insert(socket_id.to_string(), username.to_string());
        stale
    }

    pub fn username_of(&self, socket_id: &str) -> Option<&str> {
        self.active_users.get(socket_id).map(String::as_str)
    }

    pub fn socket_of(&self, username: &str) -> Option<&str> {
        self.active_users
            .iter()
            .find(|(_, name)| name.as_str() == username)
            .map(|(id, _)| id.as_str())
    }

    /// Sorted, de-duplicated list of connected usernames.
    pub fn online_users(&self) -> Vec<String> {
        let names: BTreeSet<&String> = self.active_users.values().collect();
        names.into_iter().cloned().collect()
    }

    /// Removes every trace of the socket's user. `None` when the socket never
    /// joined or was superseded by a newer socket of the same user.
    pub fn leave(&mut self, socket_id: &str) -> Option<Departure> {
        let username = self.active_users.remove(socket_id)?;
        let was_in_voice = self.voice_users.remove(&username).is_some();
        let was_typing = self.typing_users.remove(&username).is_some();
        let ended_share = self.end_share_of(&username);
        self.user_status.remove(&username);
        Some(Departure {
            username,
            was_in_voice,
            was_typing,
            ended_share,
        })
    }

    pub fn set_status(&mut self, username: &str, status: UserStatus) {
        self.user_status.insert(username.to_string(), status);
    }

    pub fn statuses(&self) -> BTreeMap<String, UserStatus> {
        self.user_status
            .iter()
            .map(|(name, status)| (name.clone(), *status))
            .collect()
    }

    pub fn start_typing(&mut self, username: &str, now: Instant) {
        self.typing_users.insert(username.to_string(), now);
    }

    pub fn stop_typing(&mut self, username: &str) -> bool {
        self.typing_users.remove(username).is_some()
    }

    /// Drops typing entries older than `ttl`, returning whose they were.
    pub fn expire_typing(&mut self, now: Instant, ttl: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .typing_users
            .iter()
            .filter(|(_, started)| now.duration_since(**started) >= ttl)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &expired {
            self.typing_users.remove(name);
        }
        expired
    }

    pub fn join_voice(&mut self, username: &str, peer_id: &str) {
        self.voice_users
            .insert(username.to_string(), peer_id.to_string());
    }

    /// Returns `(was_in_voice, ended_share)`.
    pub fn leave_voice(&mut self, username: &str) -> (bool, bool) {
        let was_in_voice = self.voice_users.remove(username).is_some();
        let ended_share = self.end_share_of(username);
        (was_in_voice, ended_share)
    }

    pub fn in_voice(&self, username: &str) -> bool {
        self.voice_users.contains_key(username)
    }

    pub fn peer_id_of(&self, username: &str) -> Option<&str> {
        self.voice_users.get(username).map(String::as_str)
    }

    pub fn voice_members(&self) -> Vec<VoiceMember> {
        self.voice_users
            .iter()
            .map(|(username, peer_id)| VoiceMember {
                username: username.clone(),
                peer_id: peer_id.clone(),
            })
            .collect()
    }

    pub fn screen_share(&self) -> Option<&VoiceMember> {
        self.screen_share.as_ref()
    }

    /// Claims the single screen-share slot. A second user is denied and the slot
    /// is left untouched; the current owner may re-announce with a new peer id.
    pub fn start_screen_share(&mut self, username: &str, peer_id: &str) -> ShareOutcome {
        if let Some(current) = &self.screen_share {
            if current.username != username {
                return ShareOutcome::Denied {
                    sharer: current.username.clone(),
                };
            }
        }

        self.screen_share = Some(VoiceMember {
            username: username.to_string(),
            peer_id: peer_id.to_string(),
        });

        let viewers = self
            .voice_users
            .iter()
            .filter(|(name, _)| name.as_str() != username)
            .map(|(_, peer)| peer.clone())
            .collect();
        ShareOutcome::Started { viewers }
    }

    /// Clears the slot only if `username` owns it.
    pub fn stop_screen_share(&mut self, username: &str) -> bool {
        self.end_share_of(username)
    }

    fn end_share_of(&mut self, username: &str) -> bool {
        if self
            .screen_share
            .as_ref()
            .is_some_and(|share| share.username == username)
        {
            self.screen_share = None;
            true
        } else {
            false
        }
    }

    pub fn toggle_reaction(&mut self, message_id: i64, emoji: &str, username: &str) -> ReactionState {
        let by_emoji = self.reactions.entry(message_id).or_default();
        let users = by_emoji.entry(emoji.to_string()).or_default();

        let active = if users.remove(username) {
            false
        } else {
            users.insert(username.to_string());
            true
        };
        let count = users.len();

        if users.is_empty() {
            by_emoji.remove(emoji);
        }
        if by_emoji.is_empty() {
            self.reactions.remove(&message_id);
        }
        ReactionState { active, count }
    }

    pub fn forget_reactions(&mut self, message_id: i64) {
        self.reactions.remove(&message_id);
    }

    pub fn clear_reactions(&mut self) {
        self.reactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejoin_replaces_stale_socket() {
        let mut presence = PresenceStore::new();
        assert!(presence.join("s1", "alice").is_empty());
        assert_eq!(presence.join("s2", "alice"), vec!["s1".to_string()]);
        assert_eq!(presence.online_users(), vec!["alice".to_string()]);
        assert_eq!(presence.socket_of("alice"), Some("s2"));

        // The superseded socket disconnecting later changes nothing.
        assert!(presence.leave("s1").is_none());
        assert_eq!(presence.online_users(), vec!["alice".to_string()]);
    }

    #[test]
    fn leave_clears_voice_typing_and_share() {
        let mut presence = PresenceStore::new();
        presence.join("s1", "alice");
        presence.set_status("alice", UserStatus::Dnd);
        presence.join_voice("alice", "peer-a");
        presence.start_typing("alice", Instant::now());
        presence.start_screen_share("alice", "peer-a-screen");

        let departure = presence.leave("s1").unwrap();
        assert_eq!(
            departure,
            Departure {
                username: "alice".into(),
                was_in_voice: true,
                was_typing: true,
                ended_share: true,
            }
        );
        assert!(presence.online_users().is_empty());
        assert!(presence.voice_members().is_empty());
        assert!(presence.screen_share().is_none());
        assert!(presence.statuses().is_empty());
    }

    #[test]
    fn second_sharer_is_denied_without_state_change() {
        let mut presence = PresenceStore::new();
        presence.join_voice("alice", "peer-a");
        presence.join_voice("bob", "peer-b");
        presence.join_voice("carol", "peer-c");

        assert_eq!(
            presence.start_screen_share("alice", "screen-a"),
            ShareOutcome::Started {
                viewers: vec!["peer-b".into(), "peer-c".into()]
            }
        );
        assert_eq!(
            presence.start_screen_share("bob", "screen-b"),
            ShareOutcome::Denied {
                sharer: "alice".into()
            }
        );
        assert_eq!(presence.screen_share().unwrap().peer_id, "screen-a");

        assert!(!presence.stop_screen_share("bob"));
        assert!(presence.stop_screen_share("alice"));
        assert!(matches!(
            presence.start_screen_share("bob", "screen-b"),
            ShareOutcome::Started { .. }
        ));
    }

    #[test]
    fn leaving_voice_ends_own_share() {
        let mut presence = PresenceStore::new();
        presence.join_voice("alice", "peer-a");
        presence.start_screen_share("alice", "screen-a");
        assert_eq!(presence.leave_voice("alice"), (true, true));
        assert_eq!(presence.leave_voice("alice"), (false, false));
    }

    #[test]
    fn typing_expires_after_ttl() {
        let mut presence = PresenceStore::new();
        let start = Instant::now();
        presence.start_typing("alice", start);
        presence.start_typing("bob", start + Duration::from_secs(5));

        let expired = presence.expire_typing(start + TYPING_TTL, TYPING_TTL);
        assert_eq!(expired, vec!["alice".to_string()]);
        assert!(!presence.stop_typing("alice"));
        assert!(presence.stop_typing("bob"));
    }

    #[test]
    fn reactions_toggle_per_user() {
        let mut presence = PresenceStore::new();
        assert_eq!(
            presence.toggle_reaction(1, "👍", "alice"),
            ReactionState { active: true, count: 1 }
        );
        assert_eq!(
            presence.toggle_reaction(1, "👍", "bob"),
            ReactionState { active: true, count: 2 }
        );
        assert_eq!(
            presence.toggle_reaction(1, "👍", "alice"),
            ReactionState { active: false, count: 1 }
        );
        presence.forget_reactions(1);
        assert_eq!(
            presence.toggle_reaction(1, "👍", "bob"),
            ReactionState { active: true, count: 1 }
        );
    }
}
