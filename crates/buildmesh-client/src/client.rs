//! The client connection and remote calls.
//!
//! A [`Client`] owns one connection to the master. Outgoing traffic funnels
//! through a single writer task; a reader task demultiplexes stream frames,
//! progress signals and replies to the in-flight calls by their request ids
//! and stream tags. Ids and tags come from one wraparound 16-bit pool per
//! client and are released when the call resolves, so allocation and release
//! stay balanced under load.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use buildmesh_proto::message::{Envelope, Message, Reply, Request};
use buildmesh_proto::{handshake, wire, IdPool};

use crate::error::{ClientError, Result};

#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Master address as `host:port`.
    pub master_addr: String,
    pub token: Option<String>,
    /// Identity presented to the master. Defaults to a generated
    /// `build#<random>` identity so concurrent clients never collide.
    pub identity: Option<String>,
}

struct PendingCall {
    reply_tx: oneshot::Sender<Reply>,
    stdout_tag: Option<u16>,
    stderr_tag: Option<u16>,
}

#[derive(Default)]
struct DispatchState {
    ids: IdPool,
    calls: HashMap<u16, PendingCall>,
    streams: HashMap<u16, Box<dyn Write + Send>>,
    progress: HashMap<u16, Box<dyn Fn() + Send + Sync>>,
}

impl DispatchState {
    fn unregister_call(&mut self, request_id: u16) -> Option<PendingCall> {
        let call = self.calls.remove(&request_id)?;
        self.ids.release(request_id);
        self.progress.remove(&request_id);
        for tag in [call.stdout_tag, call.stderr_tag].into_iter().flatten() {
            self.streams.remove(&tag);
            self.ids.release(tag);
        }
        Some(call)
    }
}

/// A connection to the master able to carry concurrent remote calls.
pub struct Client {
    identity: String,
    outgoing: mpsc::UnboundedSender<Envelope>,
    state: Arc<Mutex<DispatchState>>,
    shutdown: CancellationToken,
}

impl Client {
    /// Connects and performs the upgrade handshake.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let identity = config
            .identity
            .unwrap_or_else(|| format!("build#{}", random_suffix()));

        info!(master = %config.master_addr, identity = %identity, "connecting to master");
        let stream = TcpStream::connect(&config.master_addr).await?;
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();

        handshake::send_client_hello(&mut wr, &identity, config.token.as_deref()).await?;
        handshake::read_server_response(&mut rd, &identity).await?;
        debug!("connected");

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let state: Arc<Mutex<DispatchState>> = Arc::default();
        let shutdown = CancellationToken::new();

        tokio::spawn(write_loop(wr, outgoing_rx, shutdown.clone()));
        tokio::spawn(read_loop(rd, outgoing.clone(), state.clone(), shutdown.clone()));

        Ok(Self {
            identity,
            outgoing,
            state,
            shutdown,
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Prepares a remote call; attach sinks with the builder methods, then
    /// [`RemoteCall::execute`] it.
    pub fn new_call<T: serde::Serialize>(&self, method: &str, args: &T) -> Result<RemoteCall> {
        let args = serde_json::to_vec(args).map_err(buildmesh_proto::ProtoError::from)?;
        Ok(RemoteCall {
            outgoing: self.outgoing.clone(),
            state: self.state.clone(),
            method: method.to_string(),
            args,
            stdout: None,
            stderr: None,
            on_progress: None,
        })
    }

    /// Closes the connection. In-flight calls resolve with
    /// [`ClientError::Disconnected`].
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A prepared, not yet dispatched call.
pub struct RemoteCall {
    outgoing: mpsc::UnboundedSender<Envelope>,
    state: Arc<Mutex<DispatchState>>,
    method: String,
    args: Vec<u8>,
    stdout: Option<Box<dyn Write + Send>>,
    stderr: Option<Box<dyn Write + Send>>,
    on_progress: Option<Box<dyn Fn() + Send + Sync>>,
}

impl RemoteCall {
    /// Streams the job's stdout into `writer`.
    pub fn stdout(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stdout = Some(Box::new(writer));
        self
    }

    /// Streams the job's stderr into `writer`.
    pub fn stderr(mut self, writer: impl Write + Send + 'static) -> Self {
        self.stderr = Some(Box::new(writer));
        self
    }

    /// Invokes `callback` on every PROGRESS signal for this call.
    pub fn on_progress(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Allocates ids, registers the sinks and dispatches the REQUEST.
    pub fn execute(self) -> Result<CallHandle> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let (request_id, stdout_tag, stderr_tag) = {
            let mut state = self.state.lock().unwrap();
            let request_id = state.ids.allocate();
            let stdout_tag = self.stdout.map(|writer| {
                let tag = state.ids.allocate();
                state.streams.insert(tag, writer);
                tag
            });
            let stderr_tag = self.stderr.map(|writer| {
                let tag = state.ids.allocate();
                state.streams.insert(tag, writer);
                tag
            });
            if let Some(callback) = self.on_progress {
                state.progress.insert(request_id, callback);
            }
            state.calls.insert(
                request_id,
                PendingCall {
                    reply_tx,
                    stdout_tag,
                    stderr_tag,
                },
            );
            (request_id, stdout_tag, stderr_tag)
        };

        debug!(method = %self.method, request_id, "dispatching call");
        let sent = self.outgoing.send(Envelope::new(Message::Request(Request {
            id: request_id,
            method: self.method,
            args: self.args,
            stdout_tag,
            stderr_tag,
        })));
        if sent.is_err() {
            self.state.lock().unwrap().unregister_call(request_id);
            return Err(ClientError::Disconnected);
        }

        Ok(CallHandle {
            request_id,
            outgoing: self.outgoing,
            state: self.state,
            reply_rx,
            interrupted: Arc::default(),
        })
    }
}

/// A dispatched call awaiting its reply.
pub struct CallHandle {
    request_id: u16,
    outgoing: mpsc::UnboundedSender<Envelope>,
    state: Arc<Mutex<DispatchState>>,
    reply_rx: oneshot::Receiver<Reply>,
    interrupted: Arc<std::sync::atomic::AtomicBool>,
}

/// A detachable handle that can interrupt a call while another task waits on
/// it (e.g. from a Ctrl-C handler).
#[derive(Clone)]
pub struct CallInterrupter {
    request_id: u16,
    outgoing: mpsc::UnboundedSender<Envelope>,
    interrupted: Arc<std::sync::atomic::AtomicBool>,
}

impl CallInterrupter {
    pub fn interrupt(&self) -> Result<()> {
        send_interrupt(&self.outgoing, self.request_id, &self.interrupted)
    }
}

fn send_interrupt(
    outgoing: &mpsc::UnboundedSender<Envelope>,
    request_id: u16,
    interrupted: &Arc<std::sync::atomic::AtomicBool>,
) -> Result<()> {
    use std::sync::atomic::Ordering;
    if interrupted.swap(true, Ordering::SeqCst) {
        return Err(ClientError::AlreadyInterrupted);
    }
    outgoing
        .send(Envelope::new(Message::Interrupt { request_id }))
        .map_err(|_| ClientError::Disconnected)
}

impl CallHandle {
    pub fn request_id(&self) -> u16 {
        self.request_id
    }

    /// Asks the processing worker to stop executing this call. The call still
    /// resolves through the usual reply path.
    pub fn interrupt(&self) -> Result<()> {
        send_interrupt(&self.outgoing, self.request_id, &self.interrupted)
    }

    /// A handle for interrupting this call from another task.
    pub fn interrupter(&self) -> CallInterrupter {
        CallInterrupter {
            request_id: self.request_id,
            outgoing: self.outgoing.clone(),
            interrupted: self.interrupted.clone(),
        }
    }

    /// Waits for the reply.
    pub async fn wait(&mut self) -> Result<CallReply> {
        let reply = (&mut self.reply_rx)
            .await
            .map_err(|_| ClientError::Disconnected)?;
        Ok(CallReply {
            return_code: reply.return_code,
            return_value: reply.return_value,
        })
    }

    /// Abandons the call: interrupts it and releases its resources without
    /// waiting for the reply. A reply arriving later is dropped silently.
    pub fn abandon(self) {
        let _ = self.interrupt();
        self.state.lock().unwrap().unregister_call(self.request_id);
    }
}

/// The resolved outcome of a call.
#[derive(Debug, Clone)]
pub struct CallReply {
    /// Zero is success; other codes are defined by the method.
    pub return_code: u8,
    /// Opaque return payload (JSON for worker replies, plain text for the
    /// broker's synthesized 254/255 rejections).
    pub return_value: Vec<u8>,
}

impl CallReply {
    /// Decodes the return value as the method's JSON payload.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.return_value).map_err(buildmesh_proto::ProtoError::from)?)
    }

    /// The return value as text, for rejection payloads.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.return_value).into_owned()
    }
}

fn random_suffix() -> String {
    (0..10).map(|_| format!("{:02x}", rand::random::<u8>())).collect()
}

async fn read_loop(
    mut rd: tokio::net::tcp::OwnedReadHalf,
    outgoing: mpsc::UnboundedSender<Envelope>,
    state: Arc<Mutex<DispatchState>>,
    shutdown: CancellationToken,
) {
    loop {
        let frames = tokio::select! {
            _ = shutdown.cancelled() => break,
            frames = wire::read_frames(&mut rd) => frames,
        };
        let envelope = match frames {
            Ok(Some(frames)) => match Envelope::from_frames(frames) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(error = %e, "protocol error, closing connection");
                    break;
                }
            },
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "connection lost");
                break;
            }
        };

        match envelope.message {
            Message::StreamFrame { tag, body } => {
                let mut state = state.lock().unwrap();
                if let Some(writer) = state.streams.get_mut(&tag) {
                    if writer.write_all(&body).and_then(|_| writer.flush()).is_err() {
                        // A dead sink cannot be reported anywhere useful;
                        // drop the stream and let the call resolve normally.
                        state.streams.remove(&tag);
                    }
                }
            }
            Message::Reply(reply) => {
                let call = state.lock().unwrap().unregister_call(reply.request_id);
                match call {
                    Some(call) => {
                        let _ = call.reply_tx.send(reply);
                    }
                    None => debug!(request_id = reply.request_id, "reply for unknown call"),
                }
            }
            Message::Progress { request_id } => {
                let state = state.lock().unwrap();
                if let Some(callback) = state.progress.get(&request_id) {
                    callback();
                }
            }
            Message::Ping => {
                let _ = outgoing.send(Envelope::new(Message::Pong));
            }
            Message::Pong => {}
            other => warn!(?other, "unexpected message from master"),
        }
    }

    // Dropping the pending reply senders resolves every in-flight wait()
    // with Disconnected.
    shutdown.cancel();
    let mut state = state.lock().unwrap();
    let ids: Vec<u16> = state.calls.keys().copied().collect();
    for id in ids {
        state.unregister_call(id);
    }
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
