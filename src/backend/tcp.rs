//! Line-delimited JSON transport to the chat service.
//!
//! One TCP connection carries every request. Requests are
//! `{"id", "action", "data"}`, replies echo the `id` with a `status` of
//! `"success"` or `"error"`, and pushes arrive as
//! `{"event": "receive_message", "target"?, "groupName", "message"}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, warn};

use super::{ChatBackend, PushEvent, PushSink, PushTarget};
use crate::error::BackendError;
use crate::protocol::{IncomingMessage, MessageKind};

/// Audio frames are base64 inside a single line.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

type Reply = Result<Value, BackendError>;
type Pending = Arc<Mutex<HashMap<u64, (&'static str, oneshot::Sender<Reply>)>>>;

/// One TCP connection. Requests in flight belong to the link they were
/// written on and fail with it.
struct Link {
    writer: tokio::sync::Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    pending: Pending,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

/// Removes a request's pending entry unless its reply already did.
struct PendingGuard {
    pending: Pending,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let _ = self.pending.lock().remove(&self.id);
    }
}

pub struct TcpChatBackend {
    addr: String,
    link: Mutex<Option<Arc<Link>>>,
    reconnect: tokio::sync::Mutex<()>,
    sink: Arc<Mutex<Option<PushSink>>>,
    attached: Arc<AtomicBool>,
    next_id: AtomicU64,
    epoch: AtomicU64,
}

#[derive(Deserialize)]
struct ReplyFrame {
    id: u64,
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushFrame {
    event: String,
    #[serde(default)]
    target: Option<String>,
    group_name: String,
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    sender: String,
    content: String,
    #[serde(rename = "type", default)]
    kind: MessageKind,
    #[serde(default)]
    date: String,
}

impl WireMessage {
    fn into_incoming(self, group_name: String) -> IncomingMessage {
        IncomingMessage {
            sender: self.sender,
            content: self.content,
            kind: self.kind,
            date: self.date,
            group_name,
        }
    }
}

impl TcpChatBackend {
    /// Open the shared connection. Fails when the service is unreachable.
    pub async fn connect(addr: &str) -> Result<Self, BackendError> {
        let backend = Self {
            addr: addr.to_string(),
            link: Mutex::new(None),
            reconnect: tokio::sync::Mutex::new(()),
            sink: Arc::new(Mutex::new(None)),
            attached: Arc::new(AtomicBool::new(false)),
            next_id: AtomicU64::new(1),
            epoch: AtomicU64::new(0),
        };
        backend.open_link().await?;
        Ok(backend)
    }

    /// Connect and complete one `PING` round trip within `limit`.
    pub async fn connect_checked(addr: &str, limit: Duration) -> Result<Self, BackendError> {
        let attempt = async {
            let backend = Self::connect(addr).await?;
            let _ = backend.request("PING", json!({})).await?;
            Ok::<_, BackendError>(backend)
        };
        match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                action: "PING",
                millis: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Requests on the current link still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.link
            .lock()
            .as_ref()
            .map_or(0, |link| link.pending.lock().len())
    }

    async fn open_link(&self) -> Result<(), BackendError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| BackendError::Unavailable(format!("{}: {e}", self.addr)))?;
        let (read, write) = stream.into_split();
        let alive = Arc::new(AtomicBool::new(true));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let reader = tokio::spawn(read_loop(
            FramedRead::new(read, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
            pending.clone(),
            self.sink.clone(),
            alive.clone(),
            self.attached.clone(),
        ));

        let link = Link {
            writer: tokio::sync::Mutex::new(FramedWrite::new(write, LinesCodec::new())),
            pending,
            alive,
            reader,
        };
        self.attached.store(false, Ordering::Release);
        let previous = self.link.lock().replace(Arc::new(link));
        if let Some(old) = previous {
            old.reader.abort();
            fail_pending(&old.pending, "connection replaced");
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            info!(addr = %self.addr, epoch, "reconnected to chat backend");
        } else {
            info!(addr = %self.addr, "connected to chat backend");
        }
        Ok(())
    }

    fn live_link(&self) -> Option<Arc<Link>> {
        self.link
            .lock()
            .as_ref()
            .filter(|link| link.alive.load(Ordering::Acquire))
            .cloned()
    }

    async fn request(&self, action: &'static str, data: Value) -> Reply {
        let link = self
            .live_link()
            .ok_or_else(|| BackendError::Unavailable("connection closed".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let _ = link.pending.lock().insert(id, (action, tx));
        let _guard = PendingGuard {
            pending: link.pending.clone(),
            id,
        };

        let frame = json!({ "id": id, "action": action, "data": data }).to_string();
        let sent = link.writer.lock().await.send(frame).await;
        if let Err(e) = sent {
            link.alive.store(false, Ordering::Release);
            return Err(BackendError::Unavailable(format!("write failed: {e}")));
        }
        debug!(id, action, "backend request sent");

        rx.await
            .unwrap_or_else(|_| Err(BackendError::Unavailable("connection closed".into())))
    }

    /// Requests whose negative answer is a normal `false`, not an error.
    async fn request_flag(&self, action: &'static str, data: Value) -> Result<bool, BackendError> {
        match self.request(action, data).await {
            Ok(_) => Ok(true),
            Err(BackendError::Rejected { message, .. }) => {
                debug!(action, %message, "backend answered negatively");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn request_list(
        &self,
        action: &'static str,
        key: &str,
    ) -> Result<Vec<String>, BackendError> {
        let data = self.request(action, json!({})).await?;
        serde_json::from_value(data.get(key).cloned().unwrap_or(Value::Array(vec![])))
            .map_err(|e| BackendError::Protocol(format!("{action}: {e}")))
    }
}

async fn read_loop(
    mut lines: FramedRead<OwnedReadHalf, LinesCodec>,
    pending: Pending,
    sink: Arc<Mutex<Option<PushSink>>>,
    alive: Arc<AtomicBool>,
    attached: Arc<AtomicBool>,
) {
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "backend read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "unparseable frame from backend");
                continue;
            }
        };

        if value.get("event").is_some() {
            dispatch_push(value, &sink);
        } else {
            complete_request(value, &pending);
        }
    }

    alive.store(false, Ordering::Release);
    attached.store(false, Ordering::Release);
    fail_pending(&pending, "connection lost");
    warn!("chat backend connection closed");
}

fn fail_pending(pending: &Pending, reason: &str) {
    let orphaned: Vec<_> = pending.lock().drain().collect();
    for (_, (_, tx)) in orphaned {
        let _ = tx.send(Err(BackendError::Unavailable(reason.to_string())));
    }
}

fn dispatch_push(value: Value, sink: &Mutex<Option<PushSink>>) {
    let frame: PushFrame = match serde_json::from_value(value) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "malformed push from backend");
            return;
        }
    };
    if frame.event != "receive_message" {
        debug!(event = %frame.event, "ignoring unknown push");
        return;
    }
    let push = PushEvent {
        target: frame.target,
        message: frame.message.into_incoming(frame.group_name),
    };
    match sink.lock().as_ref() {
        Some(sink) => {
            let _ = sink.send(push);
        }
        None => debug!("push received before channel attached"),
    }
}

fn complete_request(value: Value, pending: &Pending) {
    let frame: ReplyFrame = match serde_json::from_value(value) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "malformed reply from backend");
            return;
        }
    };
    let Some((action, tx)) = pending.lock().remove(&frame.id) else {
        debug!(id = frame.id, "reply for unknown request");
        return;
    };
    let reply = if frame.status == "success" {
        Ok(frame.data)
    } else {
        Err(BackendError::Rejected {
            action,
            message: frame.message.unwrap_or_else(|| "unknown error".into()),
        })
    };
    let _ = tx.send(reply);
}

#[async_trait]
impl ChatBackend for TcpChatBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        if self.live_link().is_none() {
            let _guard = self.reconnect.lock().await;
            if self.live_link().is_none() {
                warn!(addr = %self.addr, "backend connection down, reconnecting");
                self.open_link().await?;
            }
        }
        self.request("PING", json!({})).await.map(|_| ())
    }

    fn link_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn is_push_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    async fn attach_push_channel(&self, sink: PushSink) -> Result<(), BackendError> {
        *self.sink.lock() = Some(sink);
        let _ = self.request("BIND_CALLBACK", json!({})).await?;
        self.attached.store(true, Ordering::Release);
        Ok(())
    }

    async fn login(
        &self,
        identity: &str,
        credentials: &str,
        target: Option<&PushTarget>,
    ) -> Result<bool, BackendError> {
        self.request_flag(
            "LOGIN",
            json!({
                "username": identity,
                "password": credentials,
                "callback": target.map(|t| t.token.as_str()),
            }),
        )
        .await
    }

    async fn logout(&self, identity: &str) -> Result<(), BackendError> {
        self.request("LOGOUT", json!({ "username": identity }))
            .await
            .map(|_| ())
    }

    async fn join_group(&self, group: &str, identity: &str) -> Result<bool, BackendError> {
        self.request_flag(
            "JOIN_GROUP",
            json!({ "groupName": group, "username": identity }),
        )
        .await
    }

    async fn create_group(&self, name: &str, creator: &str) -> Result<bool, BackendError> {
        self.request_flag(
            "CREATE_GROUP",
            json!({ "groupName": name, "creatorUsername": creator }),
        )
        .await
    }

    async fn send_message(
        &self,
        content: &str,
        sender: &str,
        group: &str,
        kind: MessageKind,
    ) -> Result<(), BackendError> {
        self.request(
            "SEND_MESSAGE_TO_GROUP",
            json!({
                "groupName": group,
                "sender": sender,
                "message": content,
                "type": kind.as_str(),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn send_audio(
        &self,
        data: &[u8],
        sender: &str,
        group: &str,
        extension: &str,
    ) -> Result<(), BackendError> {
        self.request(
            "SEND_AUDIO_TO_GROUP",
            json!({
                "groupName": group,
                "sender": sender,
                "audioFileName": format!("audio{extension}"),
                "audioData": STANDARD.encode(data),
            }),
        )
        .await
        .map(|_| ())
    }

    async fn get_groups(&self) -> Result<Vec<String>, BackendError> {
        self.request_list("GET_AVAILABLE_GROUPS", "groups").await
    }

    async fn get_connected_users(&self) -> Result<Vec<String>, BackendError> {
        self.request_list("GET_ACTIVE_USERS", "users").await
    }

    async fn get_history(&self, group: &str) -> Result<Vec<IncomingMessage>, BackendError> {
        let data = self
            .request("GET_GROUP_HISTORY", json!({ "groupName": group }))
            .await?;
        let messages: Vec<WireMessage> =
            serde_json::from_value(data.get("messages").cloned().unwrap_or(Value::Array(vec![])))
                .map_err(|e| BackendError::Protocol(format!("GET_GROUP_HISTORY: {e}")))?;
        Ok(messages
            .into_iter()
            .map(|m| m.into_incoming(group.to_string()))
            .collect())
    }

    async fn shutdown(&self) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            link.alive.store(false, Ordering::Release);
            link.reader.abort();
            fail_pending(&link.pending, "session shut down");
        }
        self.attached.store(false, Ordering::Release);
        info!("chat backend connection closed");
    }
}
