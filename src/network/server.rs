//! Network Server
//!
//! TCP server accepting requests from other members.

use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_message, write_message, MessageHandler};
use crate::error::{Error, Result};

/// Network server for member communication
pub struct NetworkServer {
    /// Bind address
    bind_address: String,
    /// Produces a response for every request
    handler: Arc<dyn MessageHandler>,
}

impl NetworkServer {
    /// Create a new network server
    pub fn new(bind_address: String, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            bind_address,
            handler,
        }
    }

    /// Bind address
    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }

    /// Accept connections until `shutdown` turns true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Network server listening on {}", self.bind_address);
        self.serve(listener, &mut shutdown).await
    }

    /// Accept connections on an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let handler = Arc::clone(&self.handler);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, handler).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Network server stopped");
        Ok(())
    }
}

/// Handle a single connection: one response per request, in order
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn MessageHandler>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        match read_message(&mut reader).await {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let response = handler.handle(message).await;
                write_message(&mut writer, &response).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading message from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}
