//! The process-wide session every client request multiplexes through.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{ChatBackend, PushEvent, PushSink, PushTarget};
use crate::error::{BackendError, RelayError};
use crate::protocol::{IncomingMessage, MessageKind};

/// Callback receiving every push that survives target validation, with the
/// live push target it was addressed to.
pub type PushHandler = Arc<dyn Fn(Option<PushTarget>, IncomingMessage) + Send + Sync>;

/// Login progress of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityState {
    Disconnected,
    /// Login started; backend liveness and push channel being checked.
    Authenticating,
    /// Push target registered, login call in flight.
    Bound,
    Active,
}

struct IdentityEntry {
    state: IdentityState,
    target: PushTarget,
}

pub struct BackendSession {
    backend: Arc<dyn ChatBackend>,
    call_timeout: Duration,
    identities: Arc<Mutex<HashMap<String, IdentityEntry>>>,
    push_tx: PushSink,
    push_rx: Mutex<Option<mpsc::UnboundedReceiver<PushEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// Backend link epoch the registered targets belong to.
    seen_epoch: AtomicU64,
}

impl BackendSession {
    pub fn new(backend: Arc<dyn ChatBackend>, call_timeout: Duration) -> Self {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        Self {
            seen_epoch: AtomicU64::new(backend.link_epoch()),
            backend,
            call_timeout,
            identities: Arc::new(Mutex::new(HashMap::new())),
            push_tx,
            push_rx: Mutex::new(Some(push_rx)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Install the single push handler. Fails if one is already installed.
    pub fn set_push_handler(&self, handler: PushHandler) -> Result<(), RelayError> {
        let Some(mut rx) = self.push_rx.lock().take() else {
            return Err(RelayError::Relay("push handler already installed".into()));
        };
        let identities = self.identities.clone();
        let task = tokio::spawn(async move {
            while let Some(push) = rx.recv().await {
                let target = match &push.target {
                    Some(token) => {
                        let live = identities
                            .lock()
                            .values()
                            .find(|entry| {
                                &entry.target.token == token
                                    && matches!(
                                        entry.state,
                                        IdentityState::Bound | IdentityState::Active
                                    )
                            })
                            .map(|entry| entry.target.clone());
                        if live.is_none() {
                            debug!(%token, group = %push.message.group_name, "push for stale target dropped");
                            continue;
                        }
                        live
                    }
                    None => None,
                };
                handler(target, push.message);
            }
            debug!("push dispatcher ended");
        });
        *self.dispatcher.lock() = Some(task);
        Ok(())
    }

    pub fn state(&self, identity: &str) -> IdentityState {
        self.identities
            .lock()
            .get(identity)
            .map_or(IdentityState::Disconnected, |entry| entry.state)
    }

    /// Run the login setup routine for `identity`.
    ///
    /// Order: verify the backend, attach the push channel, register a fresh
    /// push target, call login. Any failure deregisters the target this
    /// attempt registered.
    #[instrument(skip(self, credentials))]
    pub async fn login(&self, identity: &str, credentials: &str) -> Result<PushTarget, RelayError> {
        let target = PushTarget {
            identity: identity.to_string(),
            token: Uuid::new_v4().to_string(),
        };
        let _ = self.identities.lock().insert(
            identity.to_string(),
            IdentityEntry {
                state: IdentityState::Authenticating,
                target: target.clone(),
            },
        );

        match self.login_steps(&target, credentials).await {
            Ok(()) => {
                info!(identity, "login succeeded");
                Ok(target)
            }
            Err(err) => {
                self.deregister(&target);
                warn!(identity, error = %err, "login failed, push target removed");
                match err {
                    RelayError::LoginFailed(_) => Err(err),
                    other => Err(RelayError::LoginFailed(other.to_string())),
                }
            }
        }
    }

    async fn login_steps(&self, target: &PushTarget, credentials: &str) -> Result<(), RelayError> {
        self.call("PING", self.backend.ping()).await?;

        if !self.backend.is_push_attached() {
            self.call(
                "BIND_CALLBACK",
                self.backend.attach_push_channel(self.push_tx.clone()),
            )
            .await?;
            debug!("push channel attached to backend connection");
        }

        let epoch = self.backend.link_epoch();
        if self.seen_epoch.swap(epoch, Ordering::AcqRel) != epoch {
            self.restore_identities(&target.identity).await;
        }

        self.advance(target, IdentityState::Bound)?;

        let accepted = self
            .call(
                "LOGIN",
                self.backend.login(&target.identity, credentials, Some(target)),
            )
            .await?;
        if !accepted {
            return Err(RelayError::LoginFailed("rejected by chat service".into()));
        }

        self.advance(target, IdentityState::Active)
    }

    /// Move this attempt's entry forward, unless a newer attempt replaced it.
    fn advance(&self, target: &PushTarget, state: IdentityState) -> Result<(), RelayError> {
        let mut identities = self.identities.lock();
        match identities.get_mut(&target.identity) {
            Some(entry) if entry.target.token == target.token => {
                entry.state = state;
                Ok(())
            }
            _ => Err(RelayError::LoginFailed(
                "superseded by a newer login".into(),
            )),
        }
    }

    /// Re-register every active push target after the backend connection
    /// was re-established. Targets the service refuses are dropped.
    async fn restore_identities(&self, skip: &str) {
        let targets: Vec<PushTarget> = self
            .identities
            .lock()
            .values()
            .filter(|entry| entry.state == IdentityState::Active && entry.target.identity != skip)
            .map(|entry| entry.target.clone())
            .collect();
        if targets.is_empty() {
            return;
        }
        warn!(count = targets.len(), "backend connection was re-established, restoring logins");
        for target in targets {
            let restored = self
                .call("LOGIN", self.backend.login(&target.identity, "", Some(&target)))
                .await;
            if !matches!(restored, Ok(true)) {
                warn!(identity = %target.identity, "login not restored, push target removed");
                self.deregister(&target);
            }
        }
    }

    fn deregister(&self, target: &PushTarget) {
        let mut identities = self.identities.lock();
        if identities
            .get(&target.identity)
            .is_some_and(|entry| entry.target.token == target.token)
        {
            let _ = identities.remove(&target.identity);
        }
    }

    /// Login without a push target, for the stateless HTTP surface.
    pub async fn rest_login(&self, identity: &str) -> Result<(), RelayError> {
        let accepted = self
            .call("LOGIN", self.backend.login(identity, "", None))
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(RelayError::LoginFailed("rejected by chat service".into()))
        }
    }

    /// Log `target` out, unless a newer login already owns its identity.
    pub async fn logout(&self, target: &PushTarget) -> Result<(), RelayError> {
        let identity = target.identity.as_str();
        let superseded = {
            let mut identities = self.identities.lock();
            let superseded = identities
                .get(identity)
                .is_some_and(|entry| entry.target.token != target.token);
            if !superseded {
                let _ = identities.remove(identity);
            }
            superseded
        };
        if superseded {
            debug!(identity, "newer login owns identity, backend logout skipped");
            return Ok(());
        }
        self.call("LOGOUT", self.backend.logout(identity)).await?;
        info!(identity, "logged out");
        Ok(())
    }

    pub async fn join_group(&self, group: &str, identity: &str) -> Result<bool, RelayError> {
        Ok(self
            .call("JOIN_GROUP", self.backend.join_group(group, identity))
            .await?)
    }

    pub async fn create_group(&self, name: &str, creator: &str) -> Result<bool, RelayError> {
        Ok(self
            .call("CREATE_GROUP", self.backend.create_group(name, creator))
            .await?)
    }

    pub async fn send_message(
        &self,
        content: &str,
        sender: &str,
        group: &str,
        kind: MessageKind,
    ) -> Result<(), RelayError> {
        Ok(self
            .call(
                "SEND_MESSAGE_TO_GROUP",
                self.backend.send_message(content, sender, group, kind),
            )
            .await?)
    }

    pub async fn send_audio(
        &self,
        data: &[u8],
        sender: &str,
        group: &str,
        extension: &str,
    ) -> Result<(), RelayError> {
        Ok(self
            .call(
                "SEND_AUDIO_TO_GROUP",
                self.backend.send_audio(data, sender, group, extension),
            )
            .await?)
    }

    pub async fn get_groups(&self) -> Result<Vec<String>, RelayError> {
        Ok(self
            .call("GET_AVAILABLE_GROUPS", self.backend.get_groups())
            .await?)
    }

    pub async fn get_connected_users(&self) -> Result<Vec<String>, RelayError> {
        Ok(self
            .call("GET_ACTIVE_USERS", self.backend.get_connected_users())
            .await?)
    }

    pub async fn get_history(&self, group: &str) -> Result<Vec<IncomingMessage>, RelayError> {
        Ok(self
            .call("GET_GROUP_HISTORY", self.backend.get_history(group))
            .await?)
    }

    /// Tear down the backend connection and stop push dispatch.
    pub async fn shutdown(&self) {
        info!("shutting down backend session");
        self.backend.shutdown().await;
        if let Some(task) = self.dispatcher.lock().take() {
            task.abort();
        }
        self.identities.lock().clear();
    }

    async fn call<T>(
        &self,
        action: &'static str,
        fut: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                action,
                millis: u64::try_from(self.call_timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}
