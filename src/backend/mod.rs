//! The external chat service and the single shared session in front of it.
//!
//! [`ChatBackend`] is the transport seam: [`TcpChatBackend`] talks to the real
//! service over line-delimited JSON, [`InMemoryBackend`] runs the same
//! contract in process. [`BackendSession`] owns whichever one is configured
//! and adds timeouts, the login setup routine and push dispatch.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BackendError;
use crate::protocol::{IncomingMessage, MessageKind};

pub mod memory;
pub mod session;
pub mod tcp;

pub use memory::InMemoryBackend;
pub use session::{BackendSession, IdentityState, PushHandler};
pub use tcp::TcpChatBackend;

/// Channel the backend uses to hand asynchronous pushes to this process.
pub type PushSink = mpsc::UnboundedSender<PushEvent>;

/// A push received from the chat service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    /// Token of the push target the backend addressed, when it names one.
    pub target: Option<String>,
    pub message: IncomingMessage,
}

/// Per-identity endpoint handed to the backend at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTarget {
    pub identity: String,
    pub token: String,
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Check the shared connection, re-establishing it once if it dropped.
    async fn ping(&self) -> Result<(), BackendError>;

    /// Counts re-established connections. A change means push targets
    /// registered earlier are unknown to the service.
    fn link_epoch(&self) -> u64 {
        0
    }

    /// Whether pushes are currently wired to a sink on the live connection.
    fn is_push_attached(&self) -> bool;

    /// Route the connection's pushes into `sink`.
    async fn attach_push_channel(&self, sink: PushSink) -> Result<(), BackendError>;

    /// Authenticate `identity`. `target` is `None` for push-less REST logins.
    async fn login(
        &self,
        identity: &str,
        credentials: &str,
        target: Option<&PushTarget>,
    ) -> Result<bool, BackendError>;

    async fn logout(&self, identity: &str) -> Result<(), BackendError>;

    async fn join_group(&self, group: &str, identity: &str) -> Result<bool, BackendError>;

    async fn create_group(&self, name: &str, creator: &str) -> Result<bool, BackendError>;

    async fn send_message(
        &self,
        content: &str,
        sender: &str,
        group: &str,
        kind: MessageKind,
    ) -> Result<(), BackendError>;

    async fn send_audio(
        &self,
        data: &[u8],
        sender: &str,
        group: &str,
        extension: &str,
    ) -> Result<(), BackendError>;

    async fn get_groups(&self) -> Result<Vec<String>, BackendError>;

    async fn get_connected_users(&self) -> Result<Vec<String>, BackendError>;

    async fn get_history(&self, group: &str) -> Result<Vec<IncomingMessage>, BackendError>;

    /// Best-effort teardown of the shared connection.
    async fn shutdown(&self);
}
