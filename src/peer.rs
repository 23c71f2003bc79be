//! PeerJS-compatible signaling relay mounted under `/peerjs`.
//!
//! Browsers exchange WebRTC offers, answers and ICE candidates through here;
//! audio, video and screen frames flow peer to peer and never reach the server.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

pub const PEER_KEY: &str = "peerjs";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING-KEBAB-CASE")]
pub enum PeerMessageType {
    Open,
    Error,
    IdTaken,
    Heartbeat,
    Offer,
    Answer,
    Candidate,
    Leave,
    Expire,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerMessage {
    #[serde(rename = "type")]
    pub kind: PeerMessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl PeerMessage {
    fn bare(kind: PeerMessageType) -> Self {
        Self {
            kind,
            src: None,
            dst: None,
            payload: None,
        }
    }

    fn error(kind: PeerMessageType, msg: &str) -> Self {
        Self {
            payload: Some(json!({ "msg": msg })),
            ..Self::bare(kind)
        }
    }

    fn to_message(&self) -> Option<Message> {
        serde_json::to_string(self).ok().map(Message::text)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PeerQuery {
    pub key: Option<String>,
    pub id: Option<String>,
    pub token: Option<String>,
}

struct PeerClient {
    token: String,
    tx: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
pub struct PeerRelay {
    clients: RwLock<HashMap<String, PeerClient>>,
}

impl PeerRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Checks the handshake parameters and claims the id for this token.
    async fn connect(
        &self,
        query: &PeerQuery,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<String, PeerMessage> {
        if query.key.as_deref() != Some(PEER_KEY) {
            return Err(PeerMessage::error(
                PeerMessageType::Error,
                "Invalid key provided",
            ));
        }
        let (Some(id), Some(token)) = (query.id.clone(), query.token.clone()) else {
            return Err(PeerMessage::error(
                PeerMessageType::Error,
                "No id, token, or key supplied to websocket server",
            ));
        };

        let mut clients = self.clients.write().await;
        if clients.get(&id).is_some_and(|existing| existing.token != token) {
            return Err(PeerMessage::error(PeerMessageType::IdTaken, "ID is taken"));
        }
        clients.insert(id.clone(), PeerClient { token, tx });
        Ok(id)
    }

    async fn send_to(&self, id: &str, message: &PeerMessage) -> bool {
        let clients = self.clients.read().await;
        match (clients.get(id), message.to_message()) {
            (Some(client), Some(frame)) => client.tx.send(frame).is_ok(),
            _ => false,
        }
    }

    /// Routes one frame from `src` to its destination.
    async fn relay(&self, src: &str, text: &str) {
        let mut message: PeerMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed signaling frame from {src}: {e}");
                return;
            }
        };

        match message.kind {
            PeerMessageType::Heartbeat => return,
            PeerMessageType::Offer
            | PeerMessageType::Answer
            | PeerMessageType::Candidate
            | PeerMessageType::Leave
            | PeerMessageType::Expire => {}
            other => {
                warn!("Peer {src} sent unexpected {other:?} frame");
                return;
            }
        }

        let Some(dst) = message.dst.clone() else {
            warn!("Peer {src} sent {:?} without a destination", message.kind);
            return;
        };
        message.src = Some(src.to_string());

        if self.send_to(&dst, &message).await {
            debug!("Relayed {:?} {src} -> {dst}", message.kind);
            return;
        }

        if matches!(
            message.kind,
            PeerMessageType::Offer | PeerMessageType::Answer | PeerMessageType::Candidate
        ) {
            let expire = PeerMessage {
                src: Some(dst),
                dst: Some(src.to_string()),
                ..PeerMessage::bare(PeerMessageType::Expire)
            };
            self.send_to(src, &expire).await;
        }
    }

    /// Releases `id` only while it is still bound to this socket's channel.
    async fn disconnect(&self, id: &str, tx: &mpsc::UnboundedSender<Message>) {
        let mut clients = self.clients.write().await;
        if clients.get(id).is_some_and(|client| client.tx.same_channel(tx)) {
            clients.remove(id);
            info!("Peer {id} disconnected");
        }
    }

    pub async fn handle_connection(self: Arc<Self>, ws: WebSocket, query: PeerQuery) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = match self.connect(&query, tx.clone()).await {
            Ok(claimed) => claimed,
            Err(refusal) => {
                warn!("Refused peer connection: {:?}", refusal.kind);
                if let Some(frame) = refusal.to_message() {
                    let _ = ws_tx.send(frame).await;
                }
                let _ = ws_tx.close().await;
                return;
            }
        };
        info!("Peer {id} connected");

        if let Some(open) = PeerMessage::bare(PeerMessageType::Open).to_message() {
            let _ = tx.send(open);
        }

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = ws_tx.send(message).await {
                    warn!("Failed to send signaling frame: {e}");
                    break;
                }
            }
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) if msg.is_close() => break,
                Ok(msg) => {
                    if let Ok(text) = msg.to_str() {
                        self.relay(&id, text).await;
                    }
                }
                Err(e) => {
                    warn!("Signaling socket error for {id}: {e}");
                    break;
                }
            }
        }

        self.disconnect(&id, &tx).await;
    }
}
