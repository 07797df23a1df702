//! Shared protocol definitions for CareChat: party references,
//! conversation identifiers, the canonical message model and its codec,
//! contact resolution, and the socket event contract.

pub mod codec;
pub mod contact;
pub mod conversation;
pub mod event;
pub mod identity;
pub mod message;
pub mod party;
