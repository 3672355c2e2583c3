//! WebSocket endpoints.

pub mod chat;
