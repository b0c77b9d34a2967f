//! In-process network
//!
//! Delivers requests straight to the registered handler of the target
//! member. Members can be taken down and brought back to simulate crashes
//! and partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{MessageHandler, Transport};
use crate::replication::Message;
use crate::error::{Error, Result};

/// Registry of in-process members, keyed by host
#[derive(Default)]
pub struct LocalNetwork {
    handlers: RwLock<HashMap<String, Weak<dyn MessageHandler>>>,
    down: RwLock<HashSet<String>>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route requests for `host` to `handler`
    pub async fn register(&self, host: &str, handler: &Arc<dyn MessageHandler>) {
        self.handlers
            .write()
            .await
            .insert(host.to_string(), Arc::downgrade(handler));
    }

    /// Transport used by the member at `host`
    pub fn transport(self: &Arc<Self>, host: &str) -> LocalTransport {
        LocalTransport {
            network: Arc::clone(self),
            from: host.to_string(),
        }
    }

    /// Cut `host` off: requests to and from it fail
    pub async fn take_down(&self, host: &str) {
        tracing::info!("Local network: {} is down", host);
        self.down.write().await.insert(host.to_string());
    }

    /// Reconnect `host`
    pub async fn bring_up(&self, host: &str) {
        tracing::info!("Local network: {} is up", host);
        self.down.write().await.remove(host);
    }

    /// Whether `host` is cut off
    pub async fn is_down(&self, host: &str) -> bool {
        self.down.read().await.contains(host)
    }

    async fn deliver(&self, from: &str, target: &str, message: Message) -> Result<Message> {
        {
            let down = self.down.read().await;
            if down.contains(from) || down.contains(target) {
                return Err(Error::ConnectionFailed {
                    address: target.to_string(),
                    reason: "member is down".into(),
                });
            }
        }

        let handler = self
            .handlers
            .read()
            .await
            .get(target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::ConnectionFailed {
                address: target.to_string(),
                reason: "no member registered".into(),
            })?;

        tracing::trace!("Local network: {} -> {}: {}", from, target, message.type_name());
        let response = handler.handle(message).await;

        // The target may have gone down while handling the request
        if self.down.read().await.contains(target) {
            return Err(Error::ConnectionFailed {
                address: target.to_string(),
                reason: "member is down".into(),
            });
        }
        Ok(response)
    }
}

/// One member's view of the in-process network
#[derive(Clone)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    from: String,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, target: &str, message: Message) -> Result<Message> {
        self.network.deliver(&self.from, target, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ErrorCode;

    struct Named(&'static str);

    #[async_trait]
    impl MessageHandler for Named {
        async fn handle(&self, _message: Message) -> Message {
            Message::Error {
                code: ErrorCode::Internal,
                message: self.0.to_string(),
            }
        }
    }

    #[tokio::test]
    async fn test_delivery_and_partition() {
        let network = LocalNetwork::new();
        let b: Arc<dyn MessageHandler> = Arc::new(Named("b"));
        network.register("b:1", &b).await;

        let from_a = network.transport("a:1");
        match from_a.send("b:1", Message::StatusRequest).await.unwrap() {
            Message::Error { message, .. } => assert_eq!(message, "b"),
            other => panic!("unexpected {}", other.type_name()),
        }

        network.take_down("b:1").await;
        assert!(from_a.send("b:1", Message::StatusRequest).await.is_err());

        network.bring_up("b:1").await;
        network.take_down("a:1").await;
        assert!(from_a.send("b:1", Message::StatusRequest).await.is_err());

        network.bring_up("a:1").await;
        assert!(from_a.send("b:1", Message::StatusRequest).await.is_ok());
        assert!(from_a.send("c:1", Message::StatusRequest).await.is_err());
    }
}
