//! Client-side real-time chat synchronization for the Blindly dating app.
//!
//! One [`session::ChatSession`] per open conversation owns the live
//! connection, reconciles optimistic sends with server echoes and history
//! pages on a [`timeline::Timeline`], keeps a [`cache::MessageCache`]
//! consistent, and debounces typing state via [`typing::TypingCoordinator`].

pub mod cache;
pub mod config;
pub mod connection;
pub mod session;
pub mod timeline;
pub mod typing;
