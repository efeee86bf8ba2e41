//! In-process chat service.
//!
//! Mirrors the behaviour of the external service closely enough to run the
//! relay standalone: a `general` group exists from the start, joining an
//! unknown group fails, creating an existing one fails, and every message is
//! kept in its group's history. Each recipient's push target gets one push:
//! everyone logged in for `general`, the members of an existing group, or
//! the named peer otherwise.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use parking_lot::Mutex;
use tracing::debug;

use super::{ChatBackend, PushEvent, PushSink, PushTarget};
use crate::error::BackendError;
use crate::protocol::{IncomingMessage, MessageKind};

pub const DEFAULT_GROUP: &str = "general";

#[derive(Default)]
struct State {
    users: BTreeSet<String>,
    /// Push target token per identity logged in with one.
    callbacks: HashMap<String, String>,
    groups: BTreeMap<String, BTreeSet<String>>,
    history: HashMap<String, Vec<IncomingMessage>>,
}

pub struct InMemoryBackend {
    state: Mutex<State>,
    sink: Mutex<Option<PushSink>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let mut state = State::default();
        let _ = state
            .groups
            .insert(DEFAULT_GROUP.to_string(), BTreeSet::new());
        Self {
            state: Mutex::new(state),
            sink: Mutex::new(None),
        }
    }

    fn record_and_push(&self, message: IncomingMessage) {
        let tokens = {
            let mut state = self.state.lock();
            state
                .history
                .entry(message.group_name.clone())
                .or_default()
                .push(message.clone());
            state.recipient_tokens(&message.group_name)
        };

        let Some(sink) = self.sink.lock().clone() else {
            debug!(group = %message.group_name, "no push channel attached, message stored only");
            return;
        };
        debug!(group = %message.group_name, recipients = tokens.len(), "pushing message");
        for token in tokens {
            let _ = sink.send(PushEvent {
                target: Some(token),
                message: message.clone(),
            });
        }
    }
}

impl State {
    fn recipient_tokens(&self, room: &str) -> Vec<String> {
        if room == DEFAULT_GROUP {
            return self.callbacks.values().cloned().collect();
        }
        match self.groups.get(room) {
            Some(members) => members
                .iter()
                .filter_map(|member| self.callbacks.get(member).cloned())
                .collect(),
            None => self.callbacks.get(room).cloned().into_iter().collect(),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

#[async_trait]
impl ChatBackend for InMemoryBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn is_push_attached(&self) -> bool {
        self.sink.lock().as_ref().is_some_and(|sink| !sink.is_closed())
    }

    async fn attach_push_channel(&self, sink: PushSink) -> Result<(), BackendError> {
        *self.sink.lock() = Some(sink);
        Ok(())
    }

    async fn login(
        &self,
        identity: &str,
        _credentials: &str,
        target: Option<&PushTarget>,
    ) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        let _ = state.users.insert(identity.to_string());
        if let Some(target) = target {
            let _ = state
                .callbacks
                .insert(identity.to_string(), target.token.clone());
        }
        Ok(true)
    }

    async fn logout(&self, identity: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        let _ = state.users.remove(identity);
        let _ = state.callbacks.remove(identity);
        Ok(())
    }

    async fn join_group(&self, group: &str, identity: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        match state.groups.get_mut(group) {
            Some(members) => {
                let _ = members.insert(identity.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn create_group(&self, name: &str, creator: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock();
        if state.groups.contains_key(name) {
            return Ok(false);
        }
        let _ = state
            .groups
            .insert(name.to_string(), BTreeSet::from([creator.to_string()]));
        Ok(true)
    }

    async fn send_message(
        &self,
        content: &str,
        sender: &str,
        group: &str,
        kind: MessageKind,
    ) -> Result<(), BackendError> {
        self.record_and_push(IncomingMessage {
            sender: sender.to_string(),
            content: content.to_string(),
            kind,
            date: timestamp(),
            group_name: group.to_string(),
        });
        Ok(())
    }

    async fn send_audio(
        &self,
        data: &[u8],
        sender: &str,
        group: &str,
        _extension: &str,
    ) -> Result<(), BackendError> {
        self.record_and_push(IncomingMessage {
            sender: sender.to_string(),
            content: STANDARD.encode(data),
            kind: MessageKind::Audio,
            date: timestamp(),
            group_name: group.to_string(),
        });
        Ok(())
    }

    async fn get_groups(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.state.lock().groups.keys().cloned().collect())
    }

    async fn get_connected_users(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.state.lock().users.iter().cloned().collect())
    }

    async fn get_history(&self, group: &str) -> Result<Vec<IncomingMessage>, BackendError> {
        Ok(self
            .state
            .lock()
            .history
            .get(group)
            .cloned()
            .unwrap_or_default())
    }

    async fn shutdown(&self) {
        let _ = self.sink.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn general_group_exists() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.get_groups().await.unwrap(), vec!["general"]);
    }

    #[tokio::test]
    async fn join_unknown_group_fails() {
        let backend = InMemoryBackend::new();
        assert!(!backend.join_group("nope", "ana").await.unwrap());
        assert!(backend.join_group("general", "ana").await.unwrap());
    }

    #[tokio::test]
    async fn create_existing_group_fails() {
        let backend = InMemoryBackend::new();
        assert!(backend.create_group("dev", "ana").await.unwrap());
        assert!(!backend.create_group("dev", "beto").await.unwrap());
        assert_eq!(backend.get_groups().await.unwrap(), vec!["dev", "general"]);
    }

    #[tokio::test]
    async fn users_are_unique() {
        let backend = InMemoryBackend::new();
        assert!(backend.login("ana", "", None).await.unwrap());
        assert!(backend.login("ana", "", None).await.unwrap());
        assert_eq!(backend.get_connected_users().await.unwrap(), vec!["ana"]);
        backend.logout("ana").await.unwrap();
        assert!(backend.get_connected_users().await.unwrap().is_empty());
    }

    fn target(identity: &str) -> PushTarget {
        PushTarget {
            identity: identity.into(),
            token: format!("tok-{identity}"),
        }
    }

    async fn logged_in(names: &[&str]) -> (InMemoryBackend, mpsc::UnboundedReceiver<PushEvent>) {
        let backend = InMemoryBackend::new();
        let (tx, rx) = mpsc::unbounded_channel();
        backend.attach_push_channel(tx).await.unwrap();
        for name in names {
            assert!(backend.login(name, "", Some(&target(name))).await.unwrap());
        }
        (backend, rx)
    }

    fn drain_targets(rx: &mut mpsc::UnboundedReceiver<PushEvent>) -> Vec<String> {
        let mut targets = Vec::new();
        while let Ok(push) = rx.try_recv() {
            targets.extend(push.target);
        }
        targets.sort();
        targets
    }

    #[tokio::test]
    async fn messages_are_pushed_and_kept() {
        let (backend, mut rx) = logged_in(&["ana"]).await;
        assert!(backend.is_push_attached());

        backend
            .send_message("hola", "ana", "general", MessageKind::Text)
            .await
            .unwrap();
        let push = rx.recv().await.unwrap();
        assert_eq!(push.target.as_deref(), Some("tok-ana"));
        assert_eq!(push.message.sender, "ana");
        assert_eq!(push.message.kind, MessageKind::Text);

        let history = backend.get_history("general").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hola");
    }

    #[tokio::test]
    async fn audio_is_base64_encoded() {
        let backend = InMemoryBackend::new();
        backend
            .send_audio(b"RIFF", "ana", "general", ".webm")
            .await
            .unwrap();
        let history = backend.get_history("general").await.unwrap();
        assert_eq!(history[0].kind, MessageKind::Audio);
        assert_eq!(history[0].content, STANDARD.encode(b"RIFF"));
    }

    #[tokio::test]
    async fn general_reaches_every_logged_in_user_once() {
        let (backend, mut rx) = logged_in(&["ana", "beto"]).await;
        assert!(backend.login("rest", "", None).await.unwrap());
        backend
            .send_message("hola", "ana", "general", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(drain_targets(&mut rx), vec!["tok-ana", "tok-beto"]);
    }

    #[tokio::test]
    async fn group_membership_wins_over_peer_name() {
        let (backend, mut rx) = logged_in(&["ana", "dev"]).await;
        assert!(backend.create_group("dev", "ana").await.unwrap());
        backend
            .send_message("secreto", "ana", "dev", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(drain_targets(&mut rx), vec!["tok-ana"]);
    }

    #[tokio::test]
    async fn private_message_reaches_only_the_peer() {
        let (backend, mut rx) = logged_in(&["ana", "beto", "caro"]).await;
        backend
            .send_message("solo para ti", "ana", "beto", MessageKind::Text)
            .await
            .unwrap();
        assert_eq!(drain_targets(&mut rx), vec!["tok-beto"]);

        backend.logout("beto").await.unwrap();
        backend
            .send_message("sigues?", "ana", "beto", MessageKind::Text)
            .await
            .unwrap();
        assert!(drain_targets(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn closed_sink_counts_as_detached() {
        let backend = InMemoryBackend::new();
        let (tx, rx) = mpsc::unbounded_channel();
        backend.attach_push_channel(tx).await.unwrap();
        drop(rx);
        assert!(!backend.is_push_attached());
    }
}
