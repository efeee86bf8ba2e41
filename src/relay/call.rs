//! Point-to-point relay of WebRTC call setup between two logged-in users.
//!
//! The relay never looks inside SDP offers, answers or ICE candidates; they
//! are forwarded as opaque JSON to whichever connection the callee's
//! identity is bound to.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::error::RelayError;
use crate::protocol::ServerEvent;
use crate::registry::ConnectionRegistry;

pub const CALLEE_UNAVAILABLE: &str = "callee unavailable";

/// One step of call setup, stripped of its addressing.
#[derive(Debug, Clone, PartialEq)]
pub enum CallSignal {
    Request { offer: Value },
    Accept { answer: Value },
    Reject,
    Ice { candidate: Value },
    End,
}

impl CallSignal {
    fn name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "call_request",
            Self::Accept { .. } => "call_accept",
            Self::Reject => "call_reject",
            Self::Ice { .. } => "ice_candidate",
            Self::End => "call_end",
        }
    }

    /// The event the callee receives, tagged with the caller's identity.
    fn into_event(self, from: String) -> ServerEvent {
        match self {
            Self::Request { offer } => ServerEvent::IncomingCall { from, offer },
            Self::Accept { answer } => ServerEvent::CallAccepted { from, answer },
            Self::Reject => ServerEvent::CallRejected { from },
            Self::Ice { candidate } => ServerEvent::IceCandidate { from, candidate },
            Self::End => ServerEvent::CallEnded { from },
        }
    }
}

/// A call signal addressed to `to`, as sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub to: String,
    /// Sender identity as claimed in the payload.
    pub claimed_from: Option<String>,
    pub signal: CallSignal,
}

impl PendingCall {
    pub fn new(to: String, claimed_from: Option<String>, signal: CallSignal) -> Self {
        Self {
            to,
            claimed_from,
            signal,
        }
    }
}

pub struct CallRelay {
    registry: Arc<ConnectionRegistry>,
}

impl CallRelay {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward `call` from `caller` to the connection bound to `call.to`.
    ///
    /// When nobody is bound to the callee the caller gets `call_failed`
    /// and the error is returned for logging only.
    pub fn forward(&self, caller: &ClientConnection, call: PendingCall) -> Result<(), RelayError> {
        let action = call.signal.name();
        let Some(from) = caller.identity() else {
            return Err(RelayError::NotLoggedIn(action));
        };
        if let Some(claimed) = call.claimed_from.as_deref() {
            if claimed != from {
                warn!(conn_id = %caller.id, identity = %from, claimed, action, "call sender mismatch, using bound identity");
            }
        }

        let delivered = self
            .registry
            .lookup(&call.to)
            .is_some_and(|callee| callee.send(call.signal.into_event(from.clone())));

        if delivered {
            debug!(from = %from, to = %call.to, action, "call signal forwarded");
            return Ok(());
        }

        debug!(from = %from, to = %call.to, action, "callee not bound, notifying caller");
        let _ = caller.send(ServerEvent::CallFailed {
            to: call.to.clone(),
            reason: CALLEE_UNAVAILABLE.to_string(),
        });
        Err(RelayError::TargetUnavailable(call.to))
    }
}
