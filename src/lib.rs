//! Webhook relay between a conversational voice agent and a GitHub repository.
//!
//! The agent calls a small fixed set of tools (browse the tree, read a file,
//! file an issue, log a status line). Progress is pushed to browsers over
//! server-sent events.

pub mod dispatch;
pub mod error;
pub mod events;
pub mod host;
pub mod server;
pub mod tools;
