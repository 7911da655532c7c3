//! Network Server
//!
//! TCP server accepting cluster requests from other nodes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;

use super::{read_message, write_message, RequestHandler};
use crate::error::{Error, Result};
use crate::protocol::{ErrorCode, Message};

/// How long a stopping connection waits for requests already in flight
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// Network server for cluster communication
pub struct NetworkServer {
    /// Bound listener
    listener: TcpListener,
    /// Request handler shared by all connections
    handler: Arc<dyn RequestHandler>,
    /// Shutdown signal
    shutdown: watch::Sender<bool>,
}

impl NetworkServer {
    /// Bind a new network server
    pub async fn bind(bind_address: &str, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let listener = TcpListener::bind(bind_address).await?;
        Ok(Self::from_listener(listener, handler))
    }

    /// Wrap an already bound listener
    pub fn from_listener(listener: TcpListener, handler: Arc<dyn RequestHandler>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            listener,
            handler,
            shutdown,
        }
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Handle used to stop the accept loop
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Run the accept loop until shutdown
    pub async fn run(self) -> Result<()> {
        let local = self.local_addr()?;
        tracing::info!("Cluster server listening on {}", local);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let handler = Arc::clone(&self.handler);
                            let conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let peer_addr = addr.to_string();
                                if let Err(e) = handle_connection(socket, &peer_addr, handler, conn_shutdown).await {
                                    tracing::debug!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Cluster server on {} stopped", local);
        Ok(())
    }
}

/// Handle a single connection: request, reply, repeat until the peer hangs up.
///
/// Once shutdown is signalled, requests already sent on the connection are
/// answered with `ShuttingDown` instead of reaching the handler.
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    handler: Arc<dyn RequestHandler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let stopping = *shutdown.borrow();
        let next = if stopping {
            match timeout(DRAIN_TIMEOUT, read_message(&mut reader)).await {
                Ok(result) => result,
                Err(_) => break,
            }
        } else {
            tokio::select! {
                result = read_message(&mut reader) => result,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }
        };

        match next {
            Ok(message) => {
                tracing::trace!("Received {} from {}", message.type_name(), peer_addr);
                let reply = if *shutdown.borrow() {
                    Message::Error {
                        code: ErrorCode::ShuttingDown,
                        message: format!("{} refused, server is stopping", message.type_name()),
                    }
                } else {
                    handler.handle(peer_addr, message).await
                };
                write_message(&mut writer, &reply).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // Connection closed
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use crate::network::{NetworkClient, PeerTransport};

    struct EchoTime;

    #[async_trait]
    impl RequestHandler for EchoTime {
        async fn handle(&self, _peer: &str, message: Message) -> Message {
            match message {
                Message::TimeRequest => Message::TimeResponse {
                    node_id: "echo".into(),
                    local_time: 42.5,
                },
                _ => Message::Ack,
            }
        }
    }

    #[tokio::test]
    async fn test_request_reply_over_tcp() {
        let server = NetworkServer::bind("127.0.0.1:0", Arc::new(EchoTime)).await.unwrap();
        let address = server.local_addr().unwrap().to_string();
        let stop = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        let client = NetworkClient::new(Duration::from_millis(200), Duration::from_millis(500));
        assert_eq!(client.time_request(&address).await.unwrap(), 42.5);
        client.notify(&address, Message::Heartbeat { from_id: "S1".into(), active_load: 0 }).await.unwrap();

        stop.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    /// Holds the first request until released
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RequestHandler for Gate {
        async fn handle(&self, _peer: &str, _message: Message) -> Message {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Message::Ack
        }
    }

    #[tokio::test]
    async fn test_queued_request_refused_after_shutdown() {
        let gate = Arc::new(Gate::default());
        let server = NetworkServer::bind("127.0.0.1:0", gate.clone()).await.unwrap();
        let address = server.local_addr().unwrap();
        let stop = server.shutdown_handle();
        let task = tokio::spawn(server.run());

        let stream = TcpStream::connect(address).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let heartbeat = Message::Heartbeat { from_id: "S1".into(), active_load: 0 };

        write_message(&mut writer, &heartbeat).await.unwrap();
        gate.entered.notified().await;
        // Queued behind the request the handler is still working on
        write_message(&mut writer, &heartbeat).await.unwrap();

        stop.send(true).unwrap();
        gate.release.notify_one();

        // The request in flight completes, the queued one is refused
        assert_eq!(read_message(&mut reader).await.unwrap(), Message::Ack);
        match read_message(&mut reader).await.unwrap() {
            Message::Error { code, .. } => assert_eq!(code, ErrorCode::ShuttingDown),
            other => panic!("unexpected reply {:?}", other),
        }
        assert_eq!(gate.calls.load(Ordering::SeqCst), 1);

        task.await.unwrap().unwrap();
    }
}
