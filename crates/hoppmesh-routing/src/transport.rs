//! Collaborators the router delivers through
//!
//! The router never touches radios, gateways or disks itself. Each of those
//! sits behind a trait so the daemon can plug in real links or simulations
//! and tests can plug in scripted doubles.

use async_trait::async_trait;
use hoppmesh_protocol::{Message, NodeId, Route};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{Result, RoutingError};

/// Moves a message along a route
#[async_trait]
pub trait Transport: Send + Sync {
    /// Attempt delivery over `route`; `Ok` means the far end accepted it
    async fn send(&self, route: &Route, message: &Message) -> Result<()>;
}

/// Hands a message to the internet once it reaches a gateway
#[async_trait]
pub trait InternetForwarder: Send + Sync {
    async fn forward(&self, gateway: &NodeId, message: &Message) -> Result<()>;
}

/// Holds messages that cannot be delivered yet
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn store(&self, message: &Message) -> Result<()>;

    /// Remove and return everything held
    async fn take_stored(&self) -> Result<Vec<Message>>;
}

/// Run a collaborator call under a deadline; expiry becomes [`RoutingError::Timeout`]
pub(crate) async fn bounded<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RoutingError::Timeout(limit.as_millis() as u64)),
    }
}

/// The three collaborators as one bundle
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub forwarder: Arc<dyn InternetForwarder>,
    pub store: Arc<dyn MessageStore>,
}

/// Volatile store, lost on restart
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    messages: Mutex<Vec<Message>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.lock().await.is_empty()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn store(&self, message: &Message) -> Result<()> {
        self.messages.lock().await.push(message.clone());
        Ok(())
    }

    async fn take_stored(&self) -> Result<Vec<Message>> {
        Ok(std::mem::take(&mut *self.messages.lock().await))
    }
}
