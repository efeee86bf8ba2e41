//! Wire events exchanged with browser clients.
//!
//! Every frame is a JSON envelope `{"event": "<name>", "data": <payload>}`.
//! Inbound frames are validated here; handlers only ever see typed events.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[default]
    #[serde(rename = "TEXT", alias = "text")]
    Text,
    #[serde(rename = "AUDIO", alias = "audio")]
    Audio,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

/// A chat message pushed by the backend for a group (or private peer) room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingMessage {
    pub sender: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub date: String,
    pub group_name: String,
}

/// Events a browser may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Login {
        username: String,
        #[serde(default)]
        password: String,
    },
    #[serde(rename_all = "camelCase")]
    JoinGroup { group_name: String, username: String },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        content: String,
        sender: String,
        group_name: String,
        #[serde(rename = "type", default)]
        kind: MessageKind,
    },
    GetGroups,
    GetUsers,
    #[serde(rename_all = "camelCase")]
    GetHistory { group_name: String },
    Logout,
    CallRequest {
        to: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        offer: Value,
    },
    CallAccept {
        to: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        answer: Value,
    },
    CallReject {
        to: String,
        #[serde(default)]
        from: Option<String>,
    },
    IceCandidate {
        to: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        candidate: Value,
    },
    CallEnd {
        to: String,
        #[serde(default)]
        from: Option<String>,
    },
}

impl ClientEvent {
    /// Parse and validate a raw text frame.
    pub fn parse(text: &str) -> Result<Self, RelayError> {
        let event: Self =
            serde_json::from_str(text).map_err(|e| RelayError::InvalidPayload(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Wire name of the event, used for logging and error replies.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Login { .. } => "login",
            Self::JoinGroup { .. } => "join_group",
            Self::SendMessage { .. } => "send_message",
            Self::GetGroups => "get_groups",
            Self::GetUsers => "get_users",
            Self::GetHistory { .. } => "get_history",
            Self::Logout => "logout",
            Self::CallRequest { .. } => "call_request",
            Self::CallAccept { .. } => "call_accept",
            Self::CallReject { .. } => "call_reject",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::CallEnd { .. } => "call_end",
        }
    }

    fn validate(&self) -> Result<(), RelayError> {
        let required: Vec<(&str, &str)> = match self {
            Self::Login { username, .. } => vec![("username", username.as_str())],
            Self::JoinGroup {
                group_name,
                username,
            } => vec![("groupName", group_name.as_str()), ("username", username.as_str())],
            Self::SendMessage {
                sender, group_name, ..
            } => vec![("sender", sender.as_str()), ("groupName", group_name.as_str())],
            Self::GetHistory { group_name } => vec![("groupName", group_name.as_str())],
            Self::CallRequest { to, .. }
            | Self::CallAccept { to, .. }
            | Self::CallReject { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::CallEnd { to, .. } => vec![("to", to.as_str())],
            Self::GetGroups | Self::GetUsers | Self::Logout => Vec::new(),
        };
        match required.into_iter().find(|(_, value)| value.trim().is_empty()) {
            Some((field, _)) => Err(RelayError::InvalidPayload(format!(
                "`{field}` must not be empty"
            ))),
            None => Ok(()),
        }
    }
}

/// Events the relay sends to a browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: String },
    LoginResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    ReceiveMessage(IncomingMessage),
    UsersList(Vec<String>),
    GroupsList(Vec<String>),
    #[serde(rename_all = "camelCase")]
    History {
        group_name: String,
        messages: Vec<IncomingMessage>,
    },
    IncomingCall { from: String, offer: Value },
    CallAccepted { from: String, answer: Value },
    CallRejected { from: String },
    IceCandidate { from: String, candidate: Value },
    CallEnded { from: String },
    CallFailed { to: String, reason: String },
    /// Sent to a connection whose identity was taken over by a newer login.
    SessionReplaced { username: String },
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        action: Option<String>,
    },
}

impl ServerEvent {
    pub fn error(err: &RelayError, action: Option<&str>) -> Self {
        Self::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            action: action.map(str::to_string),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::LoginResponse { .. } => "login_response",
            Self::ReceiveMessage(_) => "receive_message",
            Self::UsersList(_) => "users_list",
            Self::GroupsList(_) => "groups_list",
            Self::History { .. } => "history",
            Self::IncomingCall { .. } => "incoming_call",
            Self::CallAccepted { .. } => "call_accepted",
            Self::CallRejected { .. } => "call_rejected",
            Self::IceCandidate { .. } => "ice_candidate",
            Self::CallEnded { .. } => "call_ended",
            Self::CallFailed { .. } => "call_failed",
            Self::SessionReplaced { .. } => "session_replaced",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_login() {
        let event = ClientEvent::parse(r#"{"event":"login","data":{"username":"ana"}}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::Login {
                username: "ana".into(),
                password: String::new()
            }
        );
    }

    #[test]
    fn parse_send_message_with_type() {
        let text = r#"{"event":"send_message","data":{"content":"hola","sender":"ana","groupName":"general","type":"TEXT"}}"#;
        match ClientEvent::parse(text).unwrap() {
            ClientEvent::SendMessage {
                content,
                group_name,
                kind,
                ..
            } => {
                assert_eq!(content, "hola");
                assert_eq!(group_name, "general");
                assert_eq!(kind, MessageKind::Text);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn send_message_type_defaults_to_text() {
        let text = r#"{"event":"send_message","data":{"content":"x","sender":"ana","groupName":"g"}}"#;
        assert!(matches!(
            ClientEvent::parse(text).unwrap(),
            ClientEvent::SendMessage {
                kind: MessageKind::Text,
                ..
            }
        ));
    }

    #[test]
    fn unit_events_without_data() {
        assert_eq!(
            ClientEvent::parse(r#"{"event":"get_groups"}"#).unwrap(),
            ClientEvent::GetGroups
        );
        assert_eq!(
            ClientEvent::parse(r#"{"event":"get_users"}"#).unwrap(),
            ClientEvent::GetUsers
        );
    }

    #[test]
    fn unknown_event_is_invalid_payload() {
        let err = ClientEvent::parse(r#"{"event":"format_disk","data":{}}"#).unwrap_err();
        assert!(matches!(err, RelayError::InvalidPayload(_)));
    }

    #[test]
    fn missing_field_is_invalid_payload() {
        let err = ClientEvent::parse(r#"{"event":"join_group","data":{"groupName":"g"}}"#)
            .unwrap_err();
        assert!(matches!(err, RelayError::InvalidPayload(_)));
    }

    #[test]
    fn blank_username_is_rejected() {
        let err = ClientEvent::parse(r#"{"event":"login","data":{"username":"  "}}"#).unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn call_request_keeps_offer_verbatim() {
        let text = r#"{"event":"call_request","data":{"to":"beto","from":"ana","offer":{"type":"offer","sdp":"v=0"}}}"#;
        match ClientEvent::parse(text).unwrap() {
            ClientEvent::CallRequest { to, from, offer } => {
                assert_eq!(to, "beto");
                assert_eq!(from.as_deref(), Some("ana"));
                assert_eq!(offer, json!({"type": "offer", "sdp": "v=0"}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn receive_message_wire_shape() {
        let event = ServerEvent::ReceiveMessage(IncomingMessage {
            sender: "ana".into(),
            content: "hola".into(),
            kind: MessageKind::Text,
            date: "2026-10-18 10:00:00".into(),
            group_name: "general".into(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "receive_message");
        assert_eq!(value["data"]["sender"], "ana");
        assert_eq!(value["data"]["type"], "TEXT");
        assert_eq!(value["data"]["groupName"], "general");
    }

    #[test]
    fn lists_serialize_as_arrays() {
        let value = serde_json::to_value(ServerEvent::GroupsList(vec!["general".into()])).unwrap();
        assert_eq!(value, json!({"event": "groups_list", "data": ["general"]}));
    }

    #[test]
    fn login_failure_omits_username() {
        let value = serde_json::to_value(ServerEvent::LoginResponse {
            success: false,
            username: None,
            message: Some("rejected".into()),
        })
        .unwrap();
        assert_eq!(value["data"], json!({"success": false, "message": "rejected"}));
    }

    #[test]
    fn audio_kind_accepts_lowercase() {
        let msg: IncomingMessage = serde_json::from_value(json!({
            "sender": "ana", "content": "/audios/a.webm", "type": "audio", "groupName": "g"
        }))
        .unwrap();
        assert_eq!(msg.kind, MessageKind::Audio);
        assert!(msg.date.is_empty());
    }
}
