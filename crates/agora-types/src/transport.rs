//! Peer transport collaborator
//!
//! The market only needs three things from the network: topic broadcast,
//! topic subscription and a request/response exchange with a named agent.
//! Payloads are opaque bytes; callers encode them as JSON.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::identity::AgentId;

/// Errors surfaced by a transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Request to {target} timed out after {timeout_ms}ms")]
    Timeout { target: String, timeout_ms: u64 },

    #[error("Peer unreachable: {target}")]
    PeerUnreachable { target: String },

    #[error("Payload encoding error: {message}")]
    Encoding { message: String },

    #[error("Remote handler failed: {message}")]
    Handler { message: String },
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Receives messages published on a subscribed topic
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, topic: &str, payload: Vec<u8>);
}

/// Answers direct requests addressed to one agent
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, payload: Vec<u8>) -> TransportResult<Vec<u8>>;
}

/// Transport abstraction between marketplace parties
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a payload to every subscriber of `topic`
    async fn broadcast(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()>;

    /// Send a payload to one agent and wait for its reply
    async fn send_request(
        &self,
        target: &AgentId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> TransportResult<Vec<u8>>;

    /// Register a handler for a topic
    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> TransportResult<()>;
}

/// Encode a message as a JSON payload
pub fn encode<T: Serialize>(message: &T) -> TransportResult<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| TransportError::Encoding {
        message: e.to_string(),
    })
}

/// Decode a JSON payload
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> TransportResult<T> {
    serde_json::from_slice(payload).map_err(|e| TransportError::Encoding {
        message: e.to_string(),
    })
}

/// Broadcasts remembered by [`InMemoryTransport`] unless configured otherwise
pub const DEFAULT_PUBLISH_HISTORY: usize = 1024;

/// In-process transport used by simulations and tests
///
/// Broadcast awaits every subscriber in registration order before returning,
/// so a publish is fully processed by the time the call completes. No lock is
/// held while handlers run.
///
/// The most recent broadcasts are kept for inspection, up to a fixed limit;
/// older ones are dropped.
pub struct InMemoryTransport {
    subscribers: RwLock<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
    responders: RwLock<HashMap<AgentId, Arc<dyn RequestHandler>>>,
    published: RwLock<VecDeque<(String, Vec<u8>)>>,
    history_limit: usize,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_PUBLISH_HISTORY)
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` broadcasts; zero disables the history
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            responders: RwLock::new(HashMap::new()),
            published: RwLock::new(VecDeque::new()),
            history_limit: limit,
        }
    }

    /// Register the agent that answers requests sent to `agent`
    pub fn register_responder(&self, agent: AgentId, handler: Arc<dyn RequestHandler>) {
        self.responders.write().insert(agent, handler);
    }

    /// Retained payloads published on a topic, oldest first
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .read()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.read().get(topic).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn broadcast(&self, topic: &str, payload: Vec<u8>) -> TransportResult<()> {
        if self.history_limit > 0 {
            let mut published = self.published.write();
            if published.len() == self.history_limit {
                published.pop_front();
            }
            published.push_back((topic.to_string(), payload.clone()));
        }

        let handlers = self
            .subscribers
            .read()
            .get(topic)
            .cloned()
            .unwrap_or_default();

        debug!(topic, subscribers = handlers.len(), "broadcast");
        for handler in handlers {
            handler.handle(topic, payload.clone()).await;
        }
        Ok(())
    }

    async fn send_request(
        &self,
        target: &AgentId,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> TransportResult<Vec<u8>> {
        let responder = self.responders.read().get(target).cloned().ok_or_else(|| {
            TransportError::PeerUnreachable {
                target: target.to_string(),
            }
        })?;

        tokio::time::timeout(timeout, responder.handle(payload))
            .await
            .map_err(|_| TransportError::Timeout {
                target: target.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>) -> TransportResult<()> {
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }
}
