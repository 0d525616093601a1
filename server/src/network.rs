//! WebSocket transport and the accept loop
//!
//! Every accepted TCP stream is upgraded to a WebSocket and split in two.
//! The write half is parked in the [`WsTransport`], where only the delivery
//! drain task touches it. The read half stays with a per-connection task
//! that hands each text frame to the runtime on the blocking pool, so frames
//! never wait on each other and may run concurrently.

use crate::config::Config;
use crate::delivery::{DeliveryQueue, Transport};
use crate::dispatch::DispatchTable;
use crate::error::{ServerError, TransportError};
use crate::registry::ConnectionId;
use crate::runtime::Runtime;
use crate::scheduler::Scheduler;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Write halves of the open WebSocket connections
#[derive(Default)]
pub struct WsTransport {
    sinks: RwLock<HashMap<ConnectionId, Arc<AsyncMutex<WsSink>>>>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, connection: ConnectionId, sink: WsSink) {
        self.sinks
            .write()
            .insert(connection, Arc::new(AsyncMutex::new(sink)));
    }

    fn remove(&self, connection: ConnectionId) -> Option<Arc<AsyncMutex<WsSink>>> {
        self.sinks.write().remove(&connection)
    }

    /// Number of connections that can still be written to
    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }
}

impl Transport for WsTransport {
    fn is_open(&self, connection: ConnectionId) -> bool {
        self.sinks.read().contains_key(&connection)
    }

    fn send(
        &self,
        connection: ConnectionId,
        text: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let sink = self.sinks.read().get(&connection).cloned();
        async move {
            let sink = sink.ok_or(TransportError::NotOpen(connection))?;
            sink.lock().await.send(Message::text(text)).await?;
            Ok(())
        }
    }

    /// Sends a close frame; the connection stops accepting writes at once
    fn close(
        &self,
        connection: ConnectionId,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let sink = self.remove(connection);
        async move {
            let sink = sink.ok_or(TransportError::NotOpen(connection))?;
            sink.lock().await.close().await?;
            Ok(())
        }
    }
}

/// Per-connection read limits
#[derive(Debug, Clone, Copy)]
struct Limits {
    max_frame_bytes: usize,
    /// Zero disables the idle check
    idle_timeout: Duration,
}

pub struct Server {
    listener: TcpListener,
    runtime: Runtime,
    transport: Arc<WsTransport>,
    drain_interval: Duration,
    limits: Limits,
    stop: Notify,
}

impl Server {
    /// Binds the listener and starts the runtime
    ///
    /// Provider `init` hooks run here, before any connection is accepted.
    pub async fn bind(config: &Config, table: DispatchTable) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.address()).await?;

        let runtime = Runtime::new(
            table,
            Arc::new(DeliveryQueue::new()),
            Scheduler::new(Handle::current()),
            config.max_connections,
        );
        runtime.start()?;

        info!("Server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            runtime,
            transport: Arc::new(WsTransport::new()),
            drain_interval: config.drain_interval(),
            limits: Limits {
                max_frame_bytes: config.max_frame_bytes,
                idle_timeout: config.idle_timeout(),
            },
            stop: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn transport(&self) -> &Arc<WsTransport> {
        &self.transport
    }

    /// Accepts connections until ctrl-c or [`shutdown`](Self::shutdown)
    ///
    /// On the way out the provider `destroy` hooks run and every scheduled
    /// task is cancelled.
    pub async fn run(&self) -> Result<(), ServerError> {
        let drain = tokio::spawn(
            Arc::clone(self.runtime.queue()).run(Arc::clone(&self.transport), self.drain_interval),
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(serve_connection(
                                stream,
                                peer,
                                self.runtime.clone(),
                                Arc::clone(&self.transport),
                                self.limits,
                            ));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
                _ = self.stop.notified() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        drain.abort();
        self.runtime.stop();
        Ok(())
    }

    /// Asks a running [`run`](Self::run) to return
    pub fn shutdown(&self) {
        self.stop.notify_one();
    }
}

/// Upgrades one TCP stream and reads from it until it closes
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    runtime: Runtime,
    transport: Arc<WsTransport>,
    limits: Limits,
) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake with {} failed: {}", peer, e);
            return;
        }
    };
    let (mut sink, mut source) = ws.split();

    let Some(connection) = runtime.on_open() else {
        if let Err(e) = sink.close().await {
            debug!("Failed to close rejected connection from {}: {}", peer, e);
        }
        return;
    };
    transport.register(connection, sink);
    info!("{} opened from {}", connection, peer);

    loop {
        let next = if limits.idle_timeout.is_zero() {
            source.next().await
        } else {
            match tokio::time::timeout(limits.idle_timeout, source.next()).await {
                Ok(next) => next,
                Err(_) => {
                    info!("{} idle for {:?}, closing", connection, limits.idle_timeout);
                    break;
                }
            }
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!("{} read error: {}", connection, e);
                break;
            }
            None => break,
        };

        match message {
            Message::Text(text) => {
                if text.len() > limits.max_frame_bytes {
                    warn!(
                        "{} sent a {} byte frame, limit is {}",
                        connection,
                        text.len(),
                        limits.max_frame_bytes
                    );
                    continue;
                }
                let runtime = runtime.clone();
                let text = text.to_string();
                tokio::task::spawn_blocking(move || runtime.on_frame(connection, &text));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(sink) = transport.remove(connection) {
        if let Err(e) = sink.lock().await.close().await {
            debug!("{} close error: {}", connection, e);
        }
    }
    runtime.on_close(connection);
    info!("{} closed", connection);
}
