//! Chatstream Client Library Crate
//!
//! Runs conversational query sessions against a streaming query service:
//! the transport adapters, the outgoing queue, the conversation store and the
//! session runtime that drives the state machine from `chatstream-core`. The
//! `chatstream` binary is a thin interactive wrapper around this library.

pub mod config;
pub mod queue;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;
