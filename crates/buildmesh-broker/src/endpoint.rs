//! The TCP transport endpoint.
//!
//! One endpoint owns one listener and every connection accepted on it. Each
//! connection is keyed by the application identity presented during the
//! upgrade handshake; a connection whose identity is already taken is refused
//! with `409`. The endpoint feeds decoded messages to the routing exchange
//! and emits messages on behalf of it (see [`Dispatch`]).
//!
//! Outgoing traffic for a connection goes through a per-connection queue
//! drained by a single writer task, so messages are serialized whole and two
//! messages never interleave on the stream.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use buildmesh_proto::handshake::{self, Rejection};
use buildmesh_proto::message::{Envelope, Message, Reply, Request};
use buildmesh_proto::{wire, ProtoError, TokenConfig};

use crate::error::Result;
use crate::exchange::{Dispatch, Exchange};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// Address to listen on, e.g. `127.0.0.1:9300`. Port 0 picks a free port;
    /// the bound address is published through [`TcpEndpoint::bound_addr`].
    pub addr: String,
    pub auth: TokenConfig,
    /// Per-connection heartbeat period. `None` disables the connection-level
    /// heartbeat.
    pub heartbeat_period: Option<Duration>,
}

struct Connection {
    tx: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    cancel: CancellationToken,
}

/// A listener endpoint serving framed RPC connections.
pub struct TcpEndpoint {
    id: u64,
    config: EndpointConfig,
    exchange: Arc<dyn Exchange>,
    connections: RwLock<HashMap<String, Connection>>,
    bound: watch::Sender<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl TcpEndpoint {
    pub fn new(config: EndpointConfig, exchange: Arc<dyn Exchange>) -> Arc<Self> {
        let (bound, _) = watch::channel(None);
        Arc::new(Self {
            id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
            config,
            exchange,
            connections: RwLock::new(HashMap::new()),
            bound,
            shutdown: CancellationToken::new(),
        })
    }

    /// Watch channel holding the bound listener address once serving.
    pub fn bound_addr(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.bound.subscribe()
    }

    /// Accepts and serves connections until [`TcpEndpoint::close`] is called
    /// or the listener fails.
    pub async fn listen_and_serve(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.bound.send(Some(local_addr));
        info!(addr = %local_addr, "endpoint listening");

        let mut handlers = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let this = self.clone();
                        handlers.spawn(async move { this.handle_connection(stream, peer).await });
                    }
                    Err(e) => break Err(e.into()),
                },
            }
        };

        // Stop every connection, drain their queues, wait for the handlers.
        drop(listener);
        {
            let connections = self.connections.read().unwrap();
            for connection in connections.values() {
                connection.cancel.cancel();
            }
        }
        while handlers.join_next().await.is_some() {}
        self.exchange.unregister_endpoint(self.id);
        info!(addr = %local_addr, "endpoint closed");
        result
    }

    /// Requests shutdown: stop accepting connections and close existing ones
    /// after their queued outgoing messages are drained.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();

        let hello = match handshake::read_client_hello(&mut rd).await {
            Ok(hello) => hello,
            Err(e) => {
                warn!(%peer, error = %e, "connection rejected: bad handshake");
                let _ = handshake::reject(&mut wr, Rejection::BadRequest).await;
                return;
            }
        };
        if !self.config.auth.validate(hello.token.as_deref()) {
            warn!(%peer, identity = %hello.identity, "connection rejected: invalid token");
            let _ = handshake::reject(&mut wr, Rejection::InvalidToken).await;
            return;
        }

        let identity = hello.identity;
        let cancel = self.shutdown.child_token();
        let (tx, rx) = mpsc::unbounded_channel();
        let collision = {
            let mut connections = self.connections.write().unwrap();
            if connections.contains_key(&identity) {
                true
            } else {
                connections.insert(
                    identity.clone(),
                    Connection {
                        tx: tx.clone(),
                        cancel: cancel.clone(),
                    },
                );
                false
            }
        };
        if collision {
            warn!(%peer, %identity, "connection rejected: identity in use");
            let _ = handshake::reject(&mut wr, Rejection::IdentityCollision).await;
            return;
        }

        if let Err(e) = handshake::accept(&mut wr).await {
            warn!(%peer, %identity, error = %e, "failed to confirm handshake");
            self.connections.write().unwrap().remove(&identity);
            return;
        }
        info!(%peer, %identity, "application connected");

        let writer = tokio::spawn(write_loop(wr, rx, cancel.clone()));

        if let Err(e) = self.read_loop(&identity, &mut rd, &tx, &cancel).await {
            warn!(%identity, error = %e, "connection error");
        }

        cancel.cancel();
        self.connections.write().unwrap().remove(&identity);
        self.exchange.unregister_app(&identity);
        let _ = writer.await;
        debug!(%identity, "connection closed");
    }

    async fn read_loop(
        self: &Arc<Self>,
        identity: &str,
        rd: &mut OwnedReadHalf,
        tx: &mpsc::UnboundedSender<Vec<Vec<u8>>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let heartbeat = self.config.heartbeat_period;
        let mut next_ping = heartbeat.map(|p| tokio::time::Instant::now() + p);
        let mut pong_deadline: Option<tokio::time::Instant> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),

                frames = wire::read_frames(rd) => {
                    let Some(frames) = frames? else {
                        return Ok(()); // closed by peer
                    };
                    let envelope = Envelope::from_frames(frames)?;
                    self.exchange.note_activity(identity);
                    if let Some(period) = heartbeat {
                        next_ping = Some(tokio::time::Instant::now() + period);
                    }
                    if matches!(envelope.message, Message::Pong) {
                        pong_deadline = None;
                    }
                    self.handle_envelope(identity, envelope, tx)?;
                }

                _ = tokio::time::sleep_until(next_ping.unwrap_or_else(tokio::time::Instant::now)),
                        if next_ping.is_some() => {
                    let period = heartbeat.unwrap();
                    let _ = tx.send(Envelope::new(Message::Ping).into_frames());
                    if pong_deadline.is_none() {
                        pong_deadline = Some(tokio::time::Instant::now() + 4 * period);
                    }
                    next_ping = Some(tokio::time::Instant::now() + period);
                }

                _ = tokio::time::sleep_until(pong_deadline.unwrap_or_else(tokio::time::Instant::now)),
                        if pong_deadline.is_some() => {
                    return Err(ProtoError::Connection("heartbeat timeout".to_string()).into());
                }
            }
        }
    }

    fn handle_envelope(
        self: &Arc<Self>,
        identity: &str,
        envelope: Envelope,
        tx: &mpsc::UnboundedSender<Vec<Vec<u8>>>,
    ) -> Result<()> {
        let Envelope { route, message } = envelope;
        match message {
            Message::Register { method } => {
                if let Err(e) =
                    self.exchange
                        .register_method(identity, self.clone() as Arc<dyn Dispatch>, &method)
                {
                    warn!(identity, %method, error = %e, "register failed");
                }
            }
            Message::Unregister { method } => {
                self.exchange.unregister_method(identity, &method);
            }
            Message::Request(request) => {
                self.exchange
                    .handle_request(identity, request, self.clone() as Arc<dyn Dispatch>);
            }
            Message::Interrupt { request_id } => {
                self.exchange.handle_interrupt(identity, request_id);
            }
            Message::Progress { request_id } => {
                let receiver = require_route(route, "PROGRESS")?;
                self.exchange.handle_progress(&receiver, request_id);
            }
            Message::StreamFrame { tag, body } => {
                let receiver = require_route(route, "STREAM_FRAME")?;
                self.exchange.handle_stream_frame(&receiver, tag, body);
            }
            Message::Reply(reply) => {
                let receiver = require_route(route, "REPLY")?;
                self.exchange.handle_reply(&receiver, reply);
            }
            Message::Ping => {
                let _ = tx.send(Envelope::new(Message::Pong).into_frames());
            }
            Message::Pong => {}
        }
        Ok(())
    }

    fn send_to(&self, receiver: &str, envelope: Envelope) -> buildmesh_proto::Result<()> {
        let connections = self.connections.read().unwrap();
        let connection = connections
            .get(receiver)
            .ok_or_else(|| ProtoError::UnknownReceiver(receiver.to_string()))?;
        if connection.cancel.is_cancelled() {
            return Err(ProtoError::Terminated);
        }
        connection
            .tx
            .send(envelope.into_frames())
            .map_err(|_| ProtoError::Connection(format!("connection to {} closed", receiver)))
    }
}

fn require_route(route: Option<String>, kind: &str) -> Result<String> {
    route
        .ok_or_else(|| ProtoError::MalformedMessage(format!("{}: receiver frame empty", kind)).into())
}

impl Dispatch for TcpEndpoint {
    fn endpoint_id(&self) -> u64 {
        self.id
    }

    fn dispatch_request(
        &self,
        receiver: &str,
        sender: &str,
        request: Request,
    ) -> buildmesh_proto::Result<()> {
        self.send_to(receiver, Envelope::routed(sender, Message::Request(request)))
    }

    fn dispatch_interrupt(
        &self,
        receiver: &str,
        sender: &str,
        request_id: u16,
    ) -> buildmesh_proto::Result<()> {
        self.send_to(receiver, Envelope::routed(sender, Message::Interrupt { request_id }))
    }

    fn dispatch_progress(&self, receiver: &str, request_id: u16) -> buildmesh_proto::Result<()> {
        self.send_to(receiver, Envelope::new(Message::Progress { request_id }))
    }

    fn dispatch_stream_frame(
        &self,
        receiver: &str,
        tag: u16,
        body: Vec<u8>,
    ) -> buildmesh_proto::Result<()> {
        self.send_to(receiver, Envelope::new(Message::StreamFrame { tag, body }))
    }

    fn dispatch_reply(&self, receiver: &str, reply: Reply) -> buildmesh_proto::Result<()> {
        self.send_to(receiver, Envelope::new(Message::Reply(reply)))
    }

    fn dispatch_ping(&self, receiver: &str) -> buildmesh_proto::Result<()> {
        self.send_to(receiver, Envelope::new(Message::Ping))
    }
}

impl crate::supervisor::Endpoint for TcpEndpoint {
    fn serve(self: Arc<Self>) -> crate::supervisor::BoxFuture<Result<()>> {
        Box::pin(self.listen_and_serve())
    }

    fn close(&self) {
        TcpEndpoint::close(self);
    }
}

/// Drains the connection's outgoing queue onto the socket. After shutdown is
/// requested, already-queued messages are still written before the stream is
/// shut down.
async fn write_loop(
    mut wr: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<Vec<u8>>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            frames = rx.recv() => match frames {
                Some(frames) => {
                    if wire::write_frames(&mut wr, &frames).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    while let Ok(frames) = rx.try_recv() {
        if wire::write_frames(&mut wr, &frames).await.is_err() {
            break;
        }
    }
    use tokio::io::AsyncWriteExt;
    let _ = wr.shutdown().await;
}
