//! In-process transport for tests: routes requests straight to the
//! handler registered under the target address.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{PeerTransport, RequestHandler};
use crate::error::{Error, Result};
use crate::protocol::Message;

#[derive(Default)]
pub(crate) struct LoopbackTransport {
    handlers: RwLock<HashMap<String, Arc<dyn RequestHandler>>>,
    down: RwLock<HashSet<String>>,
    sent: RwLock<Vec<(String, Message)>>,
}

impl LoopbackTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) async fn attach(&self, address: &str, handler: Arc<dyn RequestHandler>) {
        self.handlers.write().await.insert(address.to_string(), handler);
    }

    /// Make every call to `address` fail as unreachable
    pub(crate) async fn take_down(&self, address: &str) {
        self.down.write().await.insert(address.to_string());
    }

    /// Everything sent so far, in order
    pub(crate) async fn sent(&self) -> Vec<(String, Message)> {
        self.sent.read().await.clone()
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn request(&self, address: &str, message: Message) -> Result<Message> {
        if self.down.read().await.contains(address) {
            return Err(Error::unreachable(address, "connection refused"));
        }
        self.sent.write().await.push((address.to_string(), message.clone()));

        let handler = self.handlers.read().await.get(address).cloned();
        match handler {
            Some(handler) => Ok(handler.handle("loopback", message).await),
            None => Err(Error::unreachable(address, "no such node")),
        }
    }
}
