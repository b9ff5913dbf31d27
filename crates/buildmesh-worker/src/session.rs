//! The worker's persistent connection to the master.
//!
//! A [`Session`] performs the upgrade handshake under the worker identity,
//! announces the registered methods, and then dispatches inbound traffic:
//! REQUESTs spawn a job handler task, INTERRUPTs fire the matching job's
//! interrupted-signal, PINGs are answered with PONG immediately.
//!
//! All outgoing traffic funnels through one queue drained by a single writer
//! task, which keeps whole messages atomic on the stream and makes the REPLY
//! for a request the last message sent for it as long as the handler resolves
//! after its final stream write.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use buildmesh_proto::job::code;
use buildmesh_proto::message::{Envelope, Message, Reply, Request};
use buildmesh_proto::{handshake, wire, ProtoError};

use crate::error::{Result, WorkerError};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered method implementation.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, request: JobRequest) -> BoxFuture<()>;
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Master address as `host:port`.
    pub master_addr: String,
    pub token: Option<String>,
    /// Application identity, unique within the master.
    pub identity: String,
}

/// One unidirectional output stream of a job (stdout or stderr).
///
/// Writes become STREAM-FRAME messages addressed to the requesting client.
/// A sink whose stream tag is absent swallows everything.
#[derive(Clone)]
pub struct StreamSink {
    client: String,
    tag: Option<u16>,
    outgoing: mpsc::UnboundedSender<Envelope>,
}

impl StreamSink {
    pub fn write(&self, bytes: &[u8]) {
        let Some(tag) = self.tag else { return };
        if bytes.is_empty() {
            return;
        }
        let _ = self.outgoing.send(Envelope::routed(
            self.client.clone(),
            Message::StreamFrame {
                tag,
                body: bytes.to_vec(),
            },
        ));
    }

    pub fn write_line(&self, line: impl AsRef<str>) {
        self.write(format!("{}\n", line.as_ref()).as_bytes());
    }
}

/// An accepted inbound request, owned by its handler until resolved.
pub struct JobRequest {
    id: u16,
    client: String,
    args: Vec<u8>,
    stdout_tag: Option<u16>,
    stderr_tag: Option<u16>,
    outgoing: mpsc::UnboundedSender<Envelope>,
    interrupted: CancellationToken,
}

impl JobRequest {
    pub(crate) fn new(
        request: Request,
        client: String,
        outgoing: mpsc::UnboundedSender<Envelope>,
        interrupted: CancellationToken,
    ) -> Self {
        Self {
            id: request.id,
            client,
            args: request.args,
            stdout_tag: request.stdout_tag,
            stderr_tag: request.stderr_tag,
            outgoing,
            interrupted,
        }
    }

    /// Decodes the opaque args payload.
    pub fn decode_args<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.args).map_err(ProtoError::from)?)
    }

    pub fn stdout(&self) -> StreamSink {
        StreamSink {
            client: self.client.clone(),
            tag: self.stdout_tag,
            outgoing: self.outgoing.clone(),
        }
    }

    pub fn stderr(&self) -> StreamSink {
        StreamSink {
            client: self.client.clone(),
            tag: self.stderr_tag,
            outgoing: self.outgoing.clone(),
        }
    }

    /// The request's one-shot cancellation signal.
    pub fn interrupted(&self) -> &CancellationToken {
        &self.interrupted
    }

    /// Emits a PROGRESS signal toward the requester.
    pub fn signal_progress(&self) {
        let _ = self.outgoing.send(Envelope::routed(
            self.client.clone(),
            Message::Progress { request_id: self.id },
        ));
    }

    /// Resolves the request. Consumes the request: a job sends exactly one
    /// REPLY, and it is the last message sent for this request id.
    pub fn resolve<T: Serialize>(self, return_code: u8, return_value: &T) {
        let return_value = match serde_json::to_vec(return_value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(request_id = self.id, error = %e, "failed to encode return value");
                Vec::new()
            }
        };
        let _ = self.outgoing.send(Envelope::routed(
            self.client,
            Message::Reply(Reply {
                request_id: self.id,
                return_code,
                return_value,
            }),
        ));
    }
}

/// A live connection to the master with a set of registered methods.
pub struct Session {
    config: SessionConfig,
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler for `method`. Must be called before
    /// [`Session::run`].
    pub fn register_method(&mut self, method: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(method.into(), handler);
    }

    /// Connects, announces every registered method, and serves requests until
    /// the connection drops or `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Session { config, handlers } = self;

        info!(master = %config.master_addr, identity = %config.identity, "connecting to master");
        let stream = TcpStream::connect(&config.master_addr).await?;
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();

        handshake::send_client_hello(&mut wr, &config.identity, config.token.as_deref()).await?;
        handshake::read_server_response(&mut rd, &config.identity).await?;
        info!("connected");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        // The writer gets a child token: it must stop when this connection
        // ends, without cancelling the caller's token (the caller may reuse
        // it across reconnects).
        let conn_shutdown = shutdown.child_token();
        let writer = tokio::spawn(write_loop(wr, outgoing_rx, conn_shutdown.clone()));

        for method in handlers.keys() {
            info!(method = %method, "exporting method");
            outgoing
                .send(Envelope::new(Message::Register {
                    method: method.clone(),
                }))
                .map_err(|_| WorkerError::Disconnected)?;
        }

        let interrupts: Arc<Mutex<HashMap<(String, u16), CancellationToken>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let result = loop {
            let frames = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                frames = wire::read_frames(&mut rd) => frames,
            };
            let Some(frames) = (match frames {
                Ok(frames) => frames,
                Err(e) => break Err(e.into()),
            }) else {
                break Err(WorkerError::Disconnected);
            };
            let envelope = match Envelope::from_frames(frames) {
                Ok(envelope) => envelope,
                Err(e) => break Err(e.into()),
            };

            match envelope.message {
                Message::Request(request) => {
                    let Some(client) = envelope.route else {
                        break Err(ProtoError::MalformedMessage(
                            "REQUEST: sender frame empty".to_string(),
                        )
                        .into());
                    };
                    spawn_job(&handlers, &interrupts, &outgoing, client, request);
                }
                Message::Interrupt { request_id } => {
                    let Some(client) = envelope.route else {
                        break Err(ProtoError::MalformedMessage(
                            "INTERRUPT: sender frame empty".to_string(),
                        )
                        .into());
                    };
                    let token = interrupts.lock().unwrap().get(&(client.clone(), request_id)).cloned();
                    match token {
                        Some(token) => {
                            debug!(%client, request_id, "interrupting job");
                            token.cancel();
                        }
                        // An interrupt for a job already resolved; drop it.
                        None => debug!(%client, request_id, "interrupt for unknown job"),
                    }
                }
                Message::Ping => {
                    let _ = outgoing.send(Envelope::new(Message::Pong));
                }
                Message::Pong => {}
                other => warn!(?other, "unexpected message from master"),
            }
        };

        // Nobody can receive results any more; interrupt in-flight jobs so
        // their children are terminated rather than left running.
        for (_, token) in interrupts.lock().unwrap().drain() {
            token.cancel();
        }
        conn_shutdown.cancel();
        let _ = writer.await;
        result
    }
}

fn spawn_job(
    handlers: &HashMap<String, Arc<dyn JobHandler>>,
    interrupts: &Arc<Mutex<HashMap<(String, u16), CancellationToken>>>,
    outgoing: &mpsc::UnboundedSender<Envelope>,
    client: String,
    request: Request,
) {
    let Some(handler) = handlers.get(&request.method).cloned() else {
        warn!(method = %request.method, "request for a method this worker does not export");
        let _ = outgoing.send(Envelope::routed(
            client,
            Message::Reply(Reply {
                request_id: request.id,
                return_code: code::DISPATCH_FAILED,
                return_value: b"method not exported".to_vec(),
            }),
        ));
        return;
    };

    let interrupted = CancellationToken::new();
    let key = (client.clone(), request.id);
    interrupts
        .lock()
        .unwrap()
        .insert(key.clone(), interrupted.clone());

    let job = JobRequest::new(request, client, outgoing.clone(), interrupted);
    let interrupts = interrupts.clone();
    tokio::spawn(async move {
        handler.handle(job).await;
        interrupts.lock().unwrap().remove(&key);
    });
}

async fn write_loop(
    mut wr: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            envelope = rx.recv() => match envelope {
                Some(envelope) => {
                    if wire::write_frames(&mut wr, &envelope.into_frames()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = shutdown.cancelled() => break,
        }
    }
    while let Ok(envelope) = rx.try_recv() {
        if wire::write_frames(&mut wr, &envelope.into_frames()).await.is_err() {
            break;
        }
    }
    use tokio::io::AsyncWriteExt;
    let _ = wr.shutdown().await;
}
