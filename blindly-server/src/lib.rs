//! Blindly development chat server.
//!
//! Exposes the chat server for use in tests and embedding. The server
//! accepts one WebSocket per (conversation, user), assigns authoritative
//! message ids, and fans frames out to conversation participants.

pub mod config;
pub mod hub;
pub mod server;
