//! Client-facing relay: turns browser events into backend calls and routes
//! backend pushes back to the right connections.

pub mod call;

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::backend::{BackendSession, PushTarget};
use crate::backend::memory::DEFAULT_GROUP;
use crate::connection::ClientConnection;
use crate::error::RelayError;
use crate::protocol::{ClientEvent, IncomingMessage, MessageKind, ServerEvent};
use crate::registry::ConnectionRegistry;

pub use call::{CallRelay, CallSignal, PendingCall};

const PRIVATE_ROOM_PREFIX: &str = "user:";

/// Room a connection joins for conversations addressed to its identity.
pub fn private_room(identity: &str) -> String {
    format!("{PRIVATE_ROOM_PREFIX}{identity}")
}

/// Group names seen through joins, creations and listings.
type KnownGroups = Arc<RwLock<HashSet<String>>>;

pub struct SignalingRelay {
    registry: Arc<ConnectionRegistry>,
    session: Arc<BackendSession>,
    calls: CallRelay,
    groups: KnownGroups,
}

impl SignalingRelay {
    /// Build the relay and install the session's single push handler.
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        session: Arc<BackendSession>,
    ) -> Result<Self, RelayError> {
        let groups: KnownGroups = Arc::new(RwLock::new(HashSet::from([DEFAULT_GROUP.to_string()])));
        let routes = registry.clone();
        let rooms = groups.clone();
        session.set_push_handler(Arc::new(
            move |target: Option<PushTarget>, message: IncomingMessage| {
                deliver_push(&routes, &rooms, target, message);
            },
        ))?;
        Ok(Self {
            calls: CallRelay::new(registry.clone()),
            registry,
            session,
            groups,
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &Arc<BackendSession> {
        &self.session
    }

    /// Create a group on the chat service. `false` when it already exists.
    pub async fn create_group(&self, name: &str, creator: &str) -> Result<bool, RelayError> {
        let created = self.session.create_group(name, creator).await?;
        self.note_groups([name]);
        Ok(created)
    }

    fn note_groups<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        let mut groups = self.groups.write();
        for name in names {
            if !groups.contains(name) {
                let _ = groups.insert(name.to_string());
            }
        }
    }

    /// Parse one text frame and dispatch it. Malformed frames get an `error` reply.
    pub async fn handle_frame(&self, conn: &Arc<ClientConnection>, text: &str) {
        match ClientEvent::parse(text) {
            Ok(event) => self.handle(conn, event).await,
            Err(err) => {
                warn!(conn_id = %conn.id, error = %err, "rejected client frame");
                let _ = conn.send(ServerEvent::error(&err, None));
            }
        }
    }

    pub async fn handle(&self, conn: &Arc<ClientConnection>, event: ClientEvent) {
        let action = event.name();
        debug!(conn_id = %conn.id, action, "client event");

        let result = match event {
            ClientEvent::Login { username, password } => {
                self.login(conn, &username, &password).await;
                Ok(())
            }
            ClientEvent::JoinGroup {
                group_name,
                username,
            } => self.join_group(conn, &group_name, &username).await,
            ClientEvent::SendMessage {
                content,
                sender,
                group_name,
                kind,
            } => {
                self.send_message(conn, &content, &sender, &group_name, kind)
                    .await
            }
            ClientEvent::GetGroups => self
                .session
                .get_groups()
                .await
                .map(|groups| {
                    self.note_groups(groups.iter().map(String::as_str));
                    let _ = conn.send(ServerEvent::GroupsList(groups));
                }),
            ClientEvent::GetUsers => self
                .session
                .get_connected_users()
                .await
                .map(|users| {
                    let _ = conn.send(ServerEvent::UsersList(users));
                }),
            ClientEvent::GetHistory { group_name } => self
                .session
                .get_history(&group_name)
                .await
                .map(|messages| {
                    let _ = conn.send(ServerEvent::History {
                        group_name,
                        messages,
                    });
                }),
            ClientEvent::Logout => {
                self.release(conn).await;
                Ok(())
            }
            ClientEvent::CallRequest { to, from, offer } => self
                .calls
                .forward(conn, PendingCall::new(to, from, CallSignal::Request { offer })),
            ClientEvent::CallAccept { to, from, answer } => self
                .calls
                .forward(conn, PendingCall::new(to, from, CallSignal::Accept { answer })),
            ClientEvent::CallReject { to, from } => {
                self.calls
                    .forward(conn, PendingCall::new(to, from, CallSignal::Reject))
            }
            ClientEvent::IceCandidate {
                to,
                from,
                candidate,
            } => self
                .calls
                .forward(conn, PendingCall::new(to, from, CallSignal::Ice { candidate })),
            ClientEvent::CallEnd { to, from } => {
                self.calls
                    .forward(conn, PendingCall::new(to, from, CallSignal::End))
            }
        };

        match result {
            Ok(()) => {}
            // The caller already received `call_failed`.
            Err(RelayError::TargetUnavailable(to)) => {
                debug!(conn_id = %conn.id, action, %to, "call target unavailable");
            }
            Err(err) => {
                warn!(conn_id = %conn.id, action, error = %err, "client action failed");
                let _ = conn.send(ServerEvent::error(&err, Some(action)));
            }
        }
    }

    async fn login(&self, conn: &Arc<ClientConnection>, username: &str, password: &str) {
        if conn.identity().is_some() {
            self.release(conn).await;
        }

        let target = match self.session.login(username, password).await {
            Ok(target) => target,
            Err(err) => {
                let _ = conn.send(ServerEvent::LoginResponse {
                    success: false,
                    username: Some(username.to_string()),
                    message: Some(err.to_string()),
                });
                return;
            }
        };

        if !conn.is_open() {
            info!(conn_id = %conn.id, identity = username, "connection closed during login, logging out");
            if let Err(err) = self.session.logout(&target).await {
                warn!(identity = username, error = %err, "logout after aborted login failed");
            }
            return;
        }

        conn.bind_identity(target);
        conn.join_room(DEFAULT_GROUP);
        conn.join_room(&private_room(username));

        if let Some(previous) = self.registry.bind(username, conn.clone()) {
            if previous.id != conn.id {
                let _ = previous.detach();
                let _ = previous.send(ServerEvent::SessionReplaced {
                    username: username.to_string(),
                });
                info!(identity = username, old_conn = %previous.id, new_conn = %conn.id, "identity moved to newer connection");
            }
        }

        // Lost a race with disconnect: undo the binding made above.
        if !conn.is_open() {
            let _ = self.registry.unbind(username, &conn.id);
            self.release(conn).await;
            return;
        }

        info!(conn_id = %conn.id, identity = username, "client logged in");
        let _ = conn.send(ServerEvent::LoginResponse {
            success: true,
            username: Some(username.to_string()),
            message: None,
        });
        self.broadcast_presence().await;
    }

    async fn join_group(
        &self,
        conn: &ClientConnection,
        group: &str,
        claimed: &str,
    ) -> Result<(), RelayError> {
        let identity = bound_identity(conn, "join_group", claimed)?;
        if !self.session.join_group(group, &identity).await? {
            return Err(RelayError::Relay(format!("group `{group}` does not exist")));
        }
        self.note_groups([group]);
        conn.join_room(group);
        debug!(conn_id = %conn.id, %identity, group, "joined group");
        Ok(())
    }

    async fn send_message(
        &self,
        conn: &ClientConnection,
        content: &str,
        claimed: &str,
        group: &str,
        kind: MessageKind,
    ) -> Result<(), RelayError> {
        let sender = bound_identity(conn, "send_message", claimed)?;
        self.session
            .send_message(content, &sender, group, kind)
            .await
    }

    /// Handle a closed socket. Only the first call per connection does any work.
    pub async fn disconnect(&self, conn: &Arc<ClientConnection>) {
        if !conn.close() {
            return;
        }
        info!(conn_id = %conn.id, identity = ?conn.identity(), age_ms = conn.age().as_millis() as u64, "client disconnected");
        self.release(conn).await;
    }

    /// Drop the connection's identity: unbind, log out, announce presence.
    async fn release(&self, conn: &ClientConnection) {
        let Some(target) = conn.detach() else {
            return;
        };
        if !self.registry.unbind(&target.identity, &conn.id) {
            debug!(conn_id = %conn.id, identity = %target.identity, "registry entry already moved on");
        }
        if let Err(err) = self.session.logout(&target).await {
            warn!(identity = %target.identity, error = %err, "backend logout failed");
        }
        info!(conn_id = %conn.id, identity = %target.identity, "identity released");
        self.broadcast_presence().await;
    }

    /// Send the current user list to every bound connection.
    pub async fn broadcast_presence(&self) {
        let users = match self.session.get_connected_users().await {
            Ok(users) => users,
            Err(err) => {
                warn!(error = %err, "user list unavailable, announcing local identities");
                let mut local = self.registry.identities();
                local.sort();
                local
            }
        };
        let delivered = self
            .registry
            .broadcast(|_| true, &ServerEvent::UsersList(users));
        debug!(delivered, "presence broadcast");
    }
}

/// The identity a connection acts as. A differing payload identity is logged and ignored.
fn bound_identity(
    conn: &ClientConnection,
    action: &'static str,
    claimed: &str,
) -> Result<String, RelayError> {
    let identity = conn.identity().ok_or(RelayError::NotLoggedIn(action))?;
    if identity != claimed {
        warn!(conn_id = %conn.id, %identity, claimed, action, "payload identity mismatch, using bound identity");
    }
    Ok(identity)
}

/// Route one backend push.
///
/// A push naming a target goes to the connection holding that target and
/// nowhere else. An untargeted push fans out to the group room, or to the
/// peer's private room when `groupName` is not a known group.
fn deliver_push(
    registry: &ConnectionRegistry,
    groups: &RwLock<HashSet<String>>,
    target: Option<PushTarget>,
    message: IncomingMessage,
) {
    let group = message.group_name.clone();
    let sender = message.sender.clone();

    if let Some(target) = target {
        match registry.lookup(&target.identity) {
            Some(conn) if conn.holds_token(&target.token) => {
                let delivered = conn.send(ServerEvent::ReceiveMessage(message));
                debug!(%group, %sender, identity = %target.identity, delivered, "push delivered to target");
            }
            _ => debug!(%group, identity = %target.identity, "push target has no live connection"),
        }
        return;
    }

    let room = if groups.read().contains(&group) {
        group.clone()
    } else {
        private_room(&group)
    };
    let delivered = registry.broadcast(
        |conn| conn.in_room(&room),
        &ServerEvent::ReceiveMessage(message),
    );
    debug!(%group, %room, %sender, delivered, "push delivered");
}
