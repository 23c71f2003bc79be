use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::messages::{
    AdminAction, ChatPayload, ClientEvent, ReactionPayload, ServerEvent, VoiceMember,
};
use crate::models::{ChatMessage, UserStatus, ADMIN_USERNAME};
use crate::presence::{PresenceStore, ShareOutcome, TYPING_TTL};
use crate::store::Store;

pub const MAX_MESSAGE_CHARS: usize = 2000;
pub const MAX_EMOJI_CHARS: usize = 16;
pub const MAX_PEER_ID_CHARS: usize = 128;
const TYPING_SWEEP_INTERVAL: Duration = Duration::from_secs(2);

struct Connection {
    username: String,
    tx: mpsc::UnboundedSender<Message>,
}

type Connections = Arc<RwLock<HashMap<String, Connection>>>;

enum Target {
    All,
    AllExcept(String),
    One(String),
}

type Outbox = Vec<(Target, ServerEvent)>;

/// The realtime hub: one entry per open socket plus the shared presence state.
pub struct Server {
    connections: Connections,
    presence: Mutex<PresenceStore>,
    store: Arc<dyn Store>,
    fallback_ids: AtomicI64,
}

impl Server {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Server {
            connections: Arc::new(RwLock::new(HashMap::new())),
            presence: Mutex::new(PresenceStore::new()),
            store,
            fallback_ids: AtomicI64::new(0),
        }
    }

    pub fn spawn_typing_sweeper(self: &Arc<Self>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(TYPING_SWEEP_INTERVAL).await;
                server.expire_typing(Instant::now()).await;
            }
        });
    }

    pub async fn handle_connection(self: Arc<Self>, ws: WebSocket, username: String) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let socket_id = self.register(&username, tx).await;
        info!("Socket {socket_id} opened for {username}");

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    warn!("Failed to send WebSocket message: {e}");
                    break;
                }
            }
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) if msg.is_close() => break,
                Ok(msg) => {
                    if let Ok(text) = msg.to_str() {
                        self.handle_text(&socket_id, text).await;
                    }
                }
                Err(e) => {
                    warn!("WebSocket error on {socket_id}: {e}");
                    break;
                }
            }
        }

        self.handle_disconnect(&socket_id).await;
    }

    async fn register(&self, username: &str, tx: mpsc::UnboundedSender<Message>) -> String {
        let socket_id = Uuid::new_v4().to_string();
        let mut connections = self.connections.write().await;
        connections.insert(
            socket_id.clone(),
            Connection {
                username: username.to_string(),
                tx,
            },
        );
        socket_id
    }

    async fn handle_text(&self, socket_id: &str, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle_event(socket_id, event).await,
            Err(e) => warn!("Dropping frame from {socket_id}: {e}"),
        }
    }

    pub async fn handle_event(&self, socket_id: &str, event: ClientEvent) {
        if let ClientEvent::UserJoined { username } = event {
            self.user_joined(socket_id, &username).await;
            return;
        }

        let Some(actor) = self.actor(socket_id).await else {
            warn!("Ignoring event from {socket_id} before user_joined");
            return;
        };

        match event {
            ClientEvent::UserJoined { .. } => {}
            ClientEvent::ChatMessage(payload) => self.chat_message(&actor, payload).await,
            ClientEvent::TypingStart => self.typing(socket_id, &actor, true).await,
            ClientEvent::TypingStop => self.typing(socket_id, &actor, false).await,
            ClientEvent::StatusChange(payload) => self.status_change(&actor, payload.status).await,
            ClientEvent::VoiceSpeaking(payload) => {
                self.voice_speaking(socket_id, &actor, payload.speaking).await;
            }
            ClientEvent::ToggleReaction(payload) => self.toggle_reaction(&actor, payload).await,
            ClientEvent::DeleteMessage(payload) => self.delete_message(&actor, payload.message_id).await,
            ClientEvent::AdminAction(payload) => self.admin_action(&actor, payload.action).await,
            ClientEvent::JoinVoice(payload) => self.join_voice(socket_id, &actor, &payload.peer_id).await,
            ClientEvent::LeaveVoice => self.leave_voice(socket_id, &actor).await,
            ClientEvent::StartScreenShare(payload) => {
                self.start_screen_share(socket_id, &actor, &payload.peer_id).await;
            }
            ClientEvent::StopScreenShare => self.stop_screen_share(&actor).await,
            ClientEvent::ScreenShareRequest => self.screen_share_request(&actor).await,
        }
    }

    async fn actor(&self, socket_id: &str) -> Option<String> {
        let presence = self.presence.lock().await;
        presence.username_of(socket_id).map(str::to_string)
    }

    async fn session_user(&self, socket_id: &str) -> Option<String> {
        let connections = self.connections.read().await;
        connections.get(socket_id).map(|c| c.username.clone())
    }

    async fn user_joined(&self, socket_id: &str, claimed: &str) {
        let Some(username) = self.session_user(socket_id).await else {
            return;
        };
        if claimed != username {
            warn!("Socket {socket_id} of {username} claimed to be {claimed}, ignoring");
            return;
        }

        let status = match self.store.find_user(&username).await {
            Ok(Some(user)) if user.status.is_selectable() => user.status,
            Ok(_) => UserStatus::Online,
            Err(e) => {
                error!("Could not load status for {username}: {e}");
                UserStatus::Online
            }
        };

        let mut presence = self.presence.lock().await;
        let stale = presence.join(socket_id, &username);
        if !stale.is_empty() {
            debug!("{username} replaced stale sockets {stale:?}");
        }
        presence.set_status(&username, status);
        info!("A user connected: {username} (Socket ID: {socket_id})");

        let mut outbox: Outbox = vec![
            (
                Target::One(socket_id.to_string()),
                ServerEvent::CurrentVoiceUsers(presence.voice_members()),
            ),
            (
                Target::One(socket_id.to_string()),
                ServerEvent::AllUserStatus(presence.statuses()),
            ),
        ];
        if let Some(share) = presence.screen_share() {
            outbox.push((
                Target::One(socket_id.to_string()),
                ServerEvent::CurrentScreenShare(share.clone()),
            ));
        }
        outbox.push((
            Target::All,
            ServerEvent::UserStatusUpdate {
                username: username.clone(),
                status,
            },
        ));
        push_presence_lists(&mut outbox, &presence);
        self.deliver(outbox).await;
    }

    async fn chat_message(&self, actor: &str, payload: ChatPayload) {
        let content = payload.content.trim();
        if content.is_empty() || content.chars().count() > MAX_MESSAGE_CHARS {
            warn!("Rejected chat message from {actor}: empty or too long");
            return;
        }

        let message = match self.persist_message(actor, content).await {
            Ok(message) => message,
            Err(reason) => {
                error!("Relaying unsaved message from {actor}: {reason}");
                ChatMessage {
                    id: self.fallback_ids.fetch_sub(1, Ordering::SeqCst) - 1,
                    user_id: None,
                    username: actor.to_string(),
                    content: content.to_string(),
                    created_at: Utc::now(),
                    persisted: false,
                }
            }
        };

        self.deliver(vec![(Target::All, ServerEvent::NewMessage(message))])
            .await;
    }

    async fn persist_message(&self, actor: &str, content: &str) -> Result<ChatMessage, String> {
        let user = self
            .store
            .find_user(actor)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no user row for {actor}"))?;
        self.store
            .insert_message(user.id, &user.username, content)
            .await
            .map_err(|e| e.to_string())
    }

    async fn typing(&self, socket_id: &str, actor: &str, typing: bool) {
        let mut presence = self.presence.lock().await;
        let changed = if typing {
            presence.start_typing(actor, Instant::now());
            true
        } else {
            presence.stop_typing(actor)
        };
        if changed {
            self.deliver(vec![(
                Target::AllExcept(socket_id.to_string()),
                ServerEvent::UserTyping {
                    username: actor.to_string(),
                    typing,
                },
            )])
            .await;
        }
    }

    pub async fn expire_typing(&self, now: Instant) {
        let mut presence = self.presence.lock().await;
        let outbox: Outbox = presence
            .expire_typing(now, TYPING_TTL)
            .into_iter()
            .map(|username| {
                (
                    Target::All,
                    ServerEvent::UserTyping {
                        username,
                        typing: false,
                    },
                )
            })
            .collect();
        if !outbox.is_empty() {
            self.deliver(outbox).await;
        }
    }

    async fn status_change(&self, actor: &str, status: UserStatus) {
        if !status.is_selectable() {
            warn!("{actor} tried to set status {status}");
            return;
        }

        {
            let mut presence = self.presence.lock().await;
            presence.set_status(actor, status);
            self.deliver(vec![(
                Target::All,
                ServerEvent::UserStatusUpdate {
                    username: actor.to_string(),
                    status,
                },
            )])
            .await;
        }

        if let Err(e) = self.store.update_status(actor, status).await {
            error!("Could not persist status of {actor}: {e}");
        }
    }

    async fn voice_speaking(&self, socket_id: &str, actor: &str, speaking: bool) {
        let presence = self.presence.lock().await;
        if !presence.in_voice(actor) {
            return;
        }
        self.deliver(vec![(
            Target::AllExcept(socket_id.to_string()),
            ServerEvent::UserSpeaking {
                username: actor.to_string(),
                speaking,
            },
        )])
        .await;
    }

    async fn toggle_reaction(&self, actor: &str, payload: ReactionPayload) {
        let emoji = payload.emoji.trim();
        let len = emoji.chars().count();
        if len == 0 || len > MAX_EMOJI_CHARS {
            warn!("Rejected reaction from {actor}: bad emoji");
            return;
        }

        match self.store.find_message(payload.message_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("{actor} reacted to missing message {}", payload.message_id);
                return;
            }
            Err(e) => {
                error!("Could not load message {}: {e}", payload.message_id);
                return;
            }
        }

        let mut presence = self.presence.lock().await;
        let state = presence.toggle_reaction(payload.message_id, emoji, actor);
        self.deliver(vec![(
            Target::All,
            ServerEvent::ReactionToggled {
                message_id: payload.message_id,
                emoji: emoji.to_string(),
                username: actor.to_string(),
                active: state.active,
                count: state.count,
            },
        )])
        .await;
    }

    async fn delete_message(&self, actor: &str, message_id: i64) {
        let message = match self.store.find_message(message_id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                warn!("{actor} tried to delete missing message {message_id}");
                return;
            }
            Err(e) => {
                error!("Could not load message {message_id}: {e}");
                return;
            }
        };

        if !message.can_be_deleted_by(actor) {
            warn!("Rejected deletion of message {message_id} by {actor}");
            return;
        }

        match self.store.delete_message(message_id).await {
            Ok(true) => {
                let mut presence = self.presence.lock().await;
                presence.forget_reactions(message_id);
                info!("{actor} deleted message {message_id}");
                self.deliver(vec![(Target::All, ServerEvent::MessageDeleted { message_id })])
                    .await;
            }
            Ok(false) => debug!("Message {message_id} already gone"),
            Err(e) => error!("Could not delete message {message_id}: {e}"),
        }
    }

    async fn admin_action(&self, actor: &str, action: AdminAction) {
        if actor != ADMIN_USERNAME {
            warn!("Rejected admin action {action:?} by {actor}");
            return;
        }

        match action {
            AdminAction::ClearChat => match self.store.clear_messages().await {
                Ok(removed) => {
                    let mut presence = self.presence.lock().await;
                    presence.clear_reactions();
                    info!("Admin cleared the chat ({removed} messages)");
                    self.deliver(vec![(Target::All, ServerEvent::ChatCleared)])
                        .await;
                }
                Err(e) => error!("Could not clear chat: {e}"),
            },
        }
    }

    async fn join_voice(&self, socket_id: &str, actor: &str, peer_id: &str) {
        if peer_id.is_empty() || peer_id.chars().count() > MAX_PEER_ID_CHARS {
            warn!("Rejected join-voice from {actor}: bad peer id");
            return;
        }

        let mut presence = self.presence.lock().await;
        presence.join_voice(actor, peer_id);
        info!("{actor} joined Voice Channel");

        let member = VoiceMember {
            username: actor.to_string(),
            peer_id: peer_id.to_string(),
        };
        let mut outbox: Outbox = vec![
            (
                Target::AllExcept(socket_id.to_string()),
                ServerEvent::UserJoinedVoice(member.clone()),
            ),
            (
                Target::AllExcept(socket_id.to_string()),
                ServerEvent::UserVoiceStatus {
                    username: actor.to_string(),
                    in_voice: true,
                },
            ),
            (
                Target::All,
                ServerEvent::CurrentVoiceUsers(presence.voice_members()),
            ),
        ];

        if let Some(share) = presence.screen_share().filter(|s| s.username != actor) {
            outbox.push((
                Target::One(socket_id.to_string()),
                ServerEvent::CurrentScreenShare(share.clone()),
            ));
            if let Some(sharer_socket) = presence.socket_of(&share.username) {
                outbox.push((
                    Target::One(sharer_socket.to_string()),
                    ServerEvent::NewViewerForScreenShare(member),
                ));
            }
        }
        self.deliver(outbox).await;
    }

    async fn leave_voice(&self, socket_id: &str, actor: &str) {
        let mut presence = self.presence.lock().await;
        let (was_in_voice, ended_share) = presence.leave_voice(actor);
        if !was_in_voice {
            return;
        }
        info!("{actor} left Voice Channel");

        let mut outbox: Outbox = vec![
            (
                Target::AllExcept(socket_id.to_string()),
                ServerEvent::UserVoiceStatus {
                    username: actor.to_string(),
                    in_voice: false,
                },
            ),
            (
                Target::All,
                ServerEvent::CurrentVoiceUsers(presence.voice_members()),
            ),
        ];
        if ended_share {
            outbox.push((
                Target::All,
                ServerEvent::UserStoppedScreenShare {
                    username: actor.to_string(),
                },
            ));
        }
        self.deliver(outbox).await;
    }

    async fn start_screen_share(&self, socket_id: &str, actor: &str, peer_id: &str) {
        if peer_id.is_empty() || peer_id.chars().count() > MAX_PEER_ID_CHARS {
            warn!("Rejected start-screenshare from {actor}: bad peer id");
            return;
        }

        let mut presence = self.presence.lock().await;
        let outbox: Outbox = match presence.start_screen_share(actor, peer_id) {
            ShareOutcome::Denied { sharer } => {
                info!("Screen share by {actor} denied, {sharer} is sharing");
                vec![(
                    Target::One(socket_id.to_string()),
                    ServerEvent::ScreenShareDenied {
                        message: format!("{sharer} is already sharing their screen."),
                        sharer,
                    },
                )]
            }
            ShareOutcome::Started { viewers } => {
                info!("{actor} started sharing their screen");
                vec![
                    (
                        Target::One(socket_id.to_string()),
                        ServerEvent::VoiceUsersForScreenShare(viewers),
                    ),
                    (
                        Target::AllExcept(socket_id.to_string()),
                        ServerEvent::UserStartedScreenShare(VoiceMember {
                            username: actor.to_string(),
                            peer_id: peer_id.to_string(),
                        }),
                    ),
                ]
            }
        };
        self.deliver(outbox).await;
    }

    async fn stop_screen_share(&self, actor: &str) {
        let mut presence = self.presence.lock().await;
        if presence.stop_screen_share(actor) {
            info!("{actor} stopped sharing their screen");
            self.deliver(vec![(
                Target::All,
                ServerEvent::UserStoppedScreenShare {
                    username: actor.to_string(),
                },
            )])
            .await;
        }
    }

    async fn screen_share_request(&self, actor: &str) {
        let presence = self.presence.lock().await;
        let Some(share) = presence.screen_share().filter(|s| s.username != actor) else {
            return;
        };
        let (Some(peer_id), Some(sharer_socket)) =
            (presence.peer_id_of(actor), presence.socket_of(&share.username))
        else {
            return;
        };

        self.deliver(vec![(
            Target::One(sharer_socket.to_string()),
            ServerEvent::ScreenShareRequestNotify(VoiceMember {
                username: actor.to_string(),
                peer_id: peer_id.to_string(),
            }),
        )])
        .await;
    }

    pub async fn handle_disconnect(&self, socket_id: &str) {
        {
            let mut connections = self.connections.write().await;
            connections.remove(socket_id);
        }

        let mut presence = self.presence.lock().await;
        let Some(departure) = presence.leave(socket_id) else {
            debug!("Socket {socket_id} closed without an active user");
            return;
        };
        let username = departure.username;
        info!("{username} left (Disconnected)");

        let mut outbox = Outbox::new();
        if departure.was_in_voice {
            outbox.push((
                Target::All,
                ServerEvent::UserVoiceStatus {
                    username: username.clone(),
                    in_voice: false,
                },
            ));
        }
        if departure.was_typing {
            outbox.push((
                Target::All,
                ServerEvent::UserTyping {
                    username: username.clone(),
                    typing: false,
                },
            ));
        }
        if departure.ended_share {
            outbox.push((
                Target::All,
                ServerEvent::UserStoppedScreenShare {
                    username: username.clone(),
                },
            ));
        }
        outbox.push((
            Target::All,
            ServerEvent::UserStatusUpdate {
                username,
                status: UserStatus::Offline,
            },
        ));
        push_presence_lists(&mut outbox, &presence);
        self.deliver(outbox).await;
    }

    async fn deliver(&self, outbox: Outbox) {
        let connections = self.connections.read().await;
        for (target, event) in outbox {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("Could not encode {}: {e}", event.name());
                    continue;
                }
            };

            match target {
                Target::All => {
                    for connection in connections.values() {
                        let _ = connection.tx.send(Message::text(text.clone()));
                    }
                }
                Target::AllExcept(except) => {
                    for (id, connection) in connections.iter() {
                        if *id != except {
                            let _ = connection.tx.send(Message::text(text.clone()));
                        }
                    }
                }
                Target::One(id) => {
                    if let Some(connection) = connections.get(&id) {
                        let _ = connection.tx.send(Message::text(text));
                    }
                }
            }
        }
    }
}

fn push_presence_lists(outbox: &mut Outbox, presence: &PresenceStore) {
    outbox.push((Target::All, ServerEvent::UpdateUserList(presence.online_users())));
    outbox.push((
        Target::All,
        ServerEvent::CurrentVoiceUsers(presence.voice_members()),
    ));
}
