//! Real-time collaboration server.
//!
//! Clients join a room over WebSocket, receive the shared document and push
//! edits that are fanned out to every other member. Each room runs as one
//! actor task; each connection runs a read pump and a write pump.

pub mod api;
pub mod config;
pub mod room;
pub mod storage;
pub mod sync;
