//! # cumbia-relay
//!
//! Real-time relay between browser chat clients and the Cumbia chat service.
//!
//! - `WebSocket` gateway: login, groups, messages, history, presence
//! - Push routing from the chat service to the addressed connection, or by room
//! - WebRTC call setup relay between logged-in users (SDP/ICE passed through)
//! - Audio upload bridge over HTTP multipart
//! - One shared backend session with per-call timeouts

#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod signaling_server;
pub mod upload;
