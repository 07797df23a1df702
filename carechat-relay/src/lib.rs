//! `CareChat` development relay library.
//!
//! Exposes the relay server for use in tests and embedding. The relay
//! accepts WebSocket connections, authenticates parties, keeps room
//! membership, and routes chat events between connections.

pub mod config;
pub mod relay;
