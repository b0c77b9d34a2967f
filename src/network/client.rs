//! Network Client
//!
//! TCP client for sending requests to other members.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;

use super::{read_message, write_message, Transport};
use crate::replication::Message;
use crate::error::{Error, Result};

/// Connection pool entry
struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
}

/// Network client for connecting to peer members
pub struct NetworkClient {
    /// Connection pool: address -> connection
    pool: RwLock<HashMap<String, Arc<Mutex<PoolEntry>>>>,
    /// Connection timeout
    connect_timeout: Duration,
    /// Request timeout
    request_timeout: Duration,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            pool: RwLock::new(HashMap::new()),
            connect_timeout,
            request_timeout,
        }
    }

    /// Send a message to a peer and wait for response
    pub async fn request(&self, address: &str, message: Message) -> Result<Message> {
        match timeout(self.request_timeout, self.send_inner(address, message)).await {
            Ok(inner_result) => inner_result,
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Send without timeout wrapper
    async fn send_inner(&self, address: &str, message: Message) -> Result<Message> {
        // Try the pooled connection first
        if let Some(entry) = self.get_connection(address).await {
            let mut entry = entry.lock().await;
            let (mut reader, mut writer) = entry.stream.split();

            let exchanged = match write_message(&mut writer, &message).await {
                Ok(()) => read_message(&mut reader).await,
                Err(e) => Err(e),
            };

            match exchanged {
                Ok(response) => {
                    entry.last_used = Instant::now();
                    return Ok(response);
                }
                Err(e) => {
                    tracing::debug!("Pooled connection to {} failed: {}", address, e);
                    drop(entry);
                    self.remove_connection(address).await;
                }
            }
        }

        // Create new connection
        let mut stream = self.connect(address).await?;
        let response = {
            let (mut reader, mut writer) = stream.split();
            write_message(&mut writer, &message).await?;
            read_message(&mut reader).await?
        };

        self.store_connection(address.to_string(), stream).await;
        Ok(response)
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    /// Get a connection from the pool
    async fn get_connection(&self, address: &str) -> Option<Arc<Mutex<PoolEntry>>> {
        let pool = self.pool.read().await;
        pool.get(address).cloned()
    }

    /// Store a connection in the pool
    async fn store_connection(&self, address: String, stream: TcpStream) {
        let mut pool = self.pool.write().await;
        pool.insert(
            address,
            Arc::new(Mutex::new(PoolEntry {
                stream,
                last_used: Instant::now(),
            })),
        );
    }

    /// Remove a connection from the pool
    async fn remove_connection(&self, address: &str) {
        let mut pool = self.pool.write().await;
        pool.remove(address);
    }

    /// Clean up idle connections
    pub async fn cleanup_stale(&self, max_idle: Duration) {
        let mut pool = self.pool.write().await;
        let now = Instant::now();

        pool.retain(|addr, entry| {
            if let Ok(e) = entry.try_lock() {
                if now.duration_since(e.last_used) > max_idle {
                    tracing::debug!("Removing idle connection to {}", addr);
                    return false;
                }
            }
            true
        });
    }

    /// Get connection count
    pub async fn connection_count(&self) -> usize {
        self.pool.read().await.len()
    }
}

#[async_trait]
impl Transport for NetworkClient {
    async fn send(&self, target: &str, message: Message) -> Result<Message> {
        self.request(target, message).await
    }
}
