//! Shared Session Resources
//!
//! Everything a session runtime needs from the outside world, created once
//! and handed to [`crate::session::SessionHandle::spawn`].

use crate::{
    config::{Config, TransportKind},
    store::ConversationStore,
    transport::{
        Connector, duplex::WsConnector, push::HttpPushConnector,
    },
};
use chatstream_core::backoff::BackoffPolicy;
use std::sync::Arc;

#[derive(Clone)]
pub struct SessionContext {
    pub caller_id: String,
    pub connector: Connector,
    pub backoff: BackoffPolicy,
    pub store: Arc<dyn ConversationStore>,
}

impl SessionContext {
    /// Wires the configured transport to `store`.
    pub fn from_config(config: &Config, store: Arc<dyn ConversationStore>) -> Self {
        let connector = match config.transport {
            TransportKind::Duplex => Connector::Duplex(Arc::new(WsConnector::new(
                config.ws_url.clone().unwrap_or_default(),
            ))),
            TransportKind::Push => Connector::Push(Arc::new(HttpPushConnector::new(
                config.http_url.clone().unwrap_or_default(),
            ))),
        };
        Self {
            caller_id: config.caller_id.clone(),
            connector,
            backoff: config.backoff,
            store,
        }
    }
}
