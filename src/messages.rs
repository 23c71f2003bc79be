use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::models::{ChatMessage, UserStatus};

/// Every frame on the realtime socket is `{ "event": ..., "data": ... }`.
#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChatPayload {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StatusPayload {
    pub status: UserStatus,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SpeakingPayload {
    pub speaking: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionPayload {
    pub message_id: i64,
    pub emoji: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    ClearChat,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdminPayload {
    pub action: AdminAction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoicePayload {
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    UserJoined { username: String },
    ChatMessage(ChatPayload),
    TypingStart,
    TypingStop,
    StatusChange(StatusPayload),
    VoiceSpeaking(SpeakingPayload),
    ToggleReaction(ReactionPayload),
    DeleteMessage(MessageRef),
    AdminAction(AdminPayload),
    JoinVoice(VoicePayload),
    LeaveVoice,
    StartScreenShare(VoicePayload),
    StopScreenShare,
    ScreenShareRequest,
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, ProtocolError> {
    Ok(serde_json::from_value(data)?)
}

impl ClientEvent {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let Envelope { event, data } = serde_json::from_str(text)?;

        let parsed = match event.as_str() {
            // Older clients send the bare username, newer ones an object.
            "user_joined" => match data {
                Value::String(username) => ClientEvent::UserJoined { username },
                other => {
                    #[derive(Deserialize)]
                    struct Joined {
                        username: String,
                    }
                    let Joined { username } = payload(other)?;
                    ClientEvent::UserJoined { username }
                }
            },
            "chat_message" => ClientEvent::ChatMessage(payload(data)?),
            "typing_start" => ClientEvent::TypingStart,
            "typing_stop" => ClientEvent::TypingStop,
            "status_change" => ClientEvent::StatusChange(payload(data)?),
            "voice_speaking" => ClientEvent::VoiceSpeaking(payload(data)?),
            "toggle_reaction" => ClientEvent::ToggleReaction(payload(data)?),
            "delete_message" => ClientEvent::DeleteMessage(payload(data)?),
            "admin_action" => ClientEvent::AdminAction(payload(data)?),
            "join-voice" => ClientEvent::JoinVoice(payload(data)?),
            "leave-voice" => ClientEvent::LeaveVoice,
            "start-screenshare" => ClientEvent::StartScreenShare(payload(data)?),
            "stop-screenshare" => ClientEvent::StopScreenShare,
            "screenshare-request" => ClientEvent::ScreenShareRequest,
            _ => return Err(ProtocolError::UnknownEvent(event)),
        };
        Ok(parsed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceMember {
    pub username: String,
    pub peer_id: String,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "update_user_list")]
    UpdateUserList(Vec<String>),
    #[serde(rename = "current_voice_users")]
    CurrentVoiceUsers(Vec<VoiceMember>),
    #[serde(rename = "all_user_status")]
    AllUserStatus(BTreeMap<String, UserStatus>),
    #[serde(rename = "user_status_update")]
    UserStatusUpdate { username: String, status: UserStatus },
    #[serde(rename = "new_message")]
    NewMessage(ChatMessage),
    #[serde(rename = "user_typing")]
    UserTyping { username: String, typing: bool },
    #[serde(rename = "user_speaking")]
    UserSpeaking { username: String, speaking: bool },
    #[serde(rename = "reaction_toggled", rename_all = "camelCase")]
    ReactionToggled {
        message_id: i64,
        emoji: String,
        username: String,
        active: bool,
        count: usize,
    },
    #[serde(rename = "message_deleted", rename_all = "camelCase")]
    MessageDeleted { message_id: i64 },
    #[serde(rename = "chat_cleared")]
    ChatCleared,
    #[serde(rename = "user-joined-voice")]
    UserJoinedVoice(VoiceMember),
    #[serde(rename = "user-voice-status", rename_all = "camelCase")]
    UserVoiceStatus { username: String, in_voice: bool },
    #[serde(rename = "current-screenshare")]
    CurrentScreenShare(VoiceMember),
    #[serde(rename = "new-viewer-for-screenshare")]
    NewViewerForScreenShare(VoiceMember),
    #[serde(rename = "user-started-screenshare")]
    UserStartedScreenShare(VoiceMember),
    #[serde(rename = "user-stopped-screenshare")]
    UserStoppedScreenShare { username: String },
    #[serde(rename = "voice-users-for-screenshare")]
    VoiceUsersForScreenShare(Vec<String>),
    #[serde(rename = "screenshare-denied")]
    ScreenShareDenied { sharer: String, message: String },
    #[serde(rename = "screenshare-request-notify")]
    ScreenShareRequestNotify(VoiceMember),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UpdateUserList(_) => "update_user_list",
            ServerEvent::CurrentVoiceUsers(_) => "current_voice_users",
            ServerEvent::AllUserStatus(_) => "all_user_status",
            ServerEvent::UserStatusUpdate { .. } => "user_status_update",
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::UserSpeaking { .. } => "user_speaking",
            ServerEvent::ReactionToggled { .. } => "reaction_toggled",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::ChatCleared => "chat_cleared",
            ServerEvent::UserJoinedVoice(_) => "user-joined-voice",
            ServerEvent::UserVoiceStatus { .. } => "user-voice-status",
            ServerEvent::CurrentScreenShare(_) => "current-screenshare",
            ServerEvent::NewViewerForScreenShare(_) => "new-viewer-for-screenshare",
            ServerEvent::UserStartedScreenShare(_) => "user-started-screenshare",
            ServerEvent::UserStoppedScreenShare { .. } => "user-stopped-screenshare",
            ServerEvent::VoiceUsersForScreenShare(_) => "voice-users-for-screenshare",
            ServerEvent::ScreenShareDenied { .. } => "screenshare-denied",
            ServerEvent::ScreenShareRequestNotify(_) => "screenshare-request-notify",
        }
    }
}
