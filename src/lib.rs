//! Nighthound backend library.
//!
//! Core components of the security-hunting orchestrator: the typed event
//! bus, SSH session runtime, hunt scheduler, AI analysis pipeline,
//! intelligence store, and the HTTP/WebSocket gateway.

pub mod ai;
pub mod api;
pub mod assets;
pub mod auth;
pub mod db;
pub mod events;
pub mod hunt;
pub mod intelligence;
pub mod security;
pub mod session;
pub mod ssh;
pub mod users;
pub mod ws;
