//! `CareChat`: real-time chat and notification client for the caregiver
//! marketplace.

pub mod app;
pub mod chat;
pub mod config;
pub mod connection;
pub mod history;
pub mod notify;
pub mod storage;
