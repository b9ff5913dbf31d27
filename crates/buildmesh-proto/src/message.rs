//! The typed message model and its frame-level encoding.
//!
//! Every message travels as a list of frames (see [`crate::wire`]). The first
//! three frames are common to all messages:
//!
//! ```text
//! FRAME 0: route        (identity, or empty -- see below)
//! FRAME 1: header       (the fixed protocol-version token)
//! FRAME 2: message type (one byte)
//! FRAME 3+: type-specific
//! ```
//!
//! The route frame is empty on client-to-broker traffic (the broker knows the
//! sender from the connection identity). The broker fills it with the
//! *sender* identity when relaying a REQUEST or INTERRUPT to a provider, and
//! a provider fills it with the *receiver* identity when sending PROGRESS,
//! STREAM-FRAME or REPLY traffic back through the broker.

use crate::error::{ProtoError, Result};

/// Fixed ASCII protocol-version token carried in frame 1 of every message.
/// A connection that presents any other header is aborted.
pub const PROTOCOL_HEADER: &[u8] = b"BMX/RPC1";

pub const TYPE_REGISTER: u8 = 0;
pub const TYPE_UNREGISTER: u8 = 1;
pub const TYPE_REQUEST: u8 = 2;
pub const TYPE_INTERRUPT: u8 = 3;
pub const TYPE_PROGRESS: u8 = 4;
pub const TYPE_STREAM_FRAME: u8 = 5;
pub const TYPE_REPLY: u8 = 6;
pub const TYPE_PING: u8 = 7;
pub const TYPE_PONG: u8 = 8;

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Register {
        method: String,
    },
    Unregister {
        method: String,
    },
    Request(Request),
    Interrupt {
        request_id: u16,
    },
    Progress {
        request_id: u16,
    },
    StreamFrame {
        tag: u16,
        body: Vec<u8>,
    },
    Reply(Reply),
    Ping,
    Pong,
}

/// An RPC request: invoke `method` with the opaque `args` payload.
///
/// The stream tags identify the requester-side sinks for the job's stdout
/// and stderr. An absent tag means the requester does not want that stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub id: u16,
    pub method: String,
    pub args: Vec<u8>,
    pub stdout_tag: Option<u16>,
    pub stderr_tag: Option<u16>,
}

/// The final message of a request: return code plus an opaque return value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub request_id: u16,
    pub return_code: u8,
    pub return_value: Vec<u8>,
}

/// A message together with its route frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub route: Option<String>,
    pub message: Message,
}

impl Envelope {
    /// Wraps a message with an empty route frame.
    pub fn new(message: Message) -> Self {
        Self {
            route: None,
            message,
        }
    }

    /// Wraps a message with the given route identity.
    pub fn routed(route: impl Into<String>, message: Message) -> Self {
        Self {
            route: Some(route.into()),
            message,
        }
    }

    /// Encodes the envelope into wire frames.
    pub fn into_frames(self) -> Vec<Vec<u8>> {
        let route = self.route.map(String::into_bytes).unwrap_or_default();
        let mut frames = vec![route, PROTOCOL_HEADER.to_vec()];

        match self.message {
            Message::Register { method } => {
                frames.push(vec![TYPE_REGISTER]);
                frames.push(method.into_bytes());
            }
            Message::Unregister { method } => {
                frames.push(vec![TYPE_UNREGISTER]);
                frames.push(method.into_bytes());
            }
            Message::Request(req) => {
                frames.push(vec![TYPE_REQUEST]);
                frames.push(req.id.to_be_bytes().to_vec());
                frames.push(req.method.into_bytes());
                frames.push(req.args);
                frames.push(encode_tag(req.stdout_tag));
                frames.push(encode_tag(req.stderr_tag));
            }
            Message::Interrupt { request_id } => {
                frames.push(vec![TYPE_INTERRUPT]);
                frames.push(request_id.to_be_bytes().to_vec());
            }
            Message::Progress { request_id } => {
                frames.push(vec![TYPE_PROGRESS]);
                frames.push(request_id.to_be_bytes().to_vec());
            }
            Message::StreamFrame { tag, body } => {
                frames.push(vec![TYPE_STREAM_FRAME]);
                frames.push(tag.to_be_bytes().to_vec());
                frames.push(body);
            }
            Message::Reply(reply) => {
                frames.push(vec![TYPE_REPLY]);
                frames.push(reply.request_id.to_be_bytes().to_vec());
                frames.push(vec![reply.return_code]);
                frames.push(reply.return_value);
            }
            Message::Ping => frames.push(vec![TYPE_PING]),
            Message::Pong => frames.push(vec![TYPE_PONG]),
        }

        frames
    }

    /// Decodes an envelope from wire frames, validating the per-type shape.
    pub fn from_frames(frames: Vec<Vec<u8>>) -> Result<Self> {
        if frames.len() < 3 {
            return Err(malformed("message too short"));
        }
        if frames[1] != PROTOCOL_HEADER {
            return Err(ProtoError::HeaderMismatch);
        }
        if frames[2].len() != 1 {
            return Err(malformed("message type frame invalid"));
        }

        let route = if frames[0].is_empty() {
            None
        } else {
            Some(
                String::from_utf8(frames[0].clone())
                    .map_err(|_| malformed("route frame is not valid UTF-8"))?,
            )
        };

        let message = match frames[2][0] {
            TYPE_REGISTER => Message::Register {
                method: decode_method(&frames, 4, "REGISTER")?,
            },
            TYPE_UNREGISTER => Message::Unregister {
                method: decode_method(&frames, 4, "UNREGISTER")?,
            },
            TYPE_REQUEST => {
                expect_len(&frames, 8, "REQUEST")?;
                if frames[4].is_empty() {
                    return Err(malformed("REQUEST: method frame empty"));
                }
                if frames[5].is_empty() {
                    return Err(malformed("REQUEST: args frame empty"));
                }
                Message::Request(Request {
                    id: decode_u16(&frames[3], "REQUEST: request id")?,
                    method: decode_utf8(&frames[4], "REQUEST: method")?,
                    args: frames[5].clone(),
                    stdout_tag: decode_opt_tag(&frames[6], "REQUEST: stdout tag")?,
                    stderr_tag: decode_opt_tag(&frames[7], "REQUEST: stderr tag")?,
                })
            }
            TYPE_INTERRUPT => {
                expect_len(&frames, 4, "INTERRUPT")?;
                Message::Interrupt {
                    request_id: decode_u16(&frames[3], "INTERRUPT: request id")?,
                }
            }
            TYPE_PROGRESS => {
                expect_len(&frames, 4, "PROGRESS")?;
                Message::Progress {
                    request_id: decode_u16(&frames[3], "PROGRESS: request id")?,
                }
            }
            TYPE_STREAM_FRAME => {
                expect_len(&frames, 5, "STREAM_FRAME")?;
                if frames[4].is_empty() {
                    return Err(malformed("STREAM_FRAME: body frame empty"));
                }
                Message::StreamFrame {
                    tag: decode_u16(&frames[3], "STREAM_FRAME: stream tag")?,
                    body: frames[4].clone(),
                }
            }
            TYPE_REPLY => {
                expect_len(&frames, 6, "REPLY")?;
                if frames[4].len() != 1 {
                    return Err(malformed("REPLY: return code frame invalid"));
                }
                Message::Reply(Reply {
                    request_id: decode_u16(&frames[3], "REPLY: request id")?,
                    return_code: frames[4][0],
                    return_value: frames[5].clone(),
                })
            }
            TYPE_PING => {
                expect_len(&frames, 3, "PING")?;
                Message::Ping
            }
            TYPE_PONG => {
                expect_len(&frames, 3, "PONG")?;
                Message::Pong
            }
            other => return Err(malformed(&format!("unknown message type: {}", other))),
        };

        Ok(Self { route, message })
    }
}

fn encode_tag(tag: Option<u16>) -> Vec<u8> {
    match tag {
        Some(tag) => tag.to_be_bytes().to_vec(),
        None => Vec::new(),
    }
}

fn malformed(reason: &str) -> ProtoError {
    ProtoError::MalformedMessage(reason.to_string())
}

fn expect_len(frames: &[Vec<u8>], expected: usize, kind: &str) -> Result<()> {
    if frames.len() != expected {
        return Err(malformed(&format!("{}: invalid message length", kind)));
    }
    Ok(())
}

fn decode_method(frames: &[Vec<u8>], expected: usize, kind: &str) -> Result<String> {
    expect_len(frames, expected, kind)?;
    if frames[3].is_empty() {
        return Err(malformed(&format!("{}: method frame empty", kind)));
    }
    decode_utf8(&frames[3], "method")
}

fn decode_utf8(frame: &[u8], what: &str) -> Result<String> {
    String::from_utf8(frame.to_vec()).map_err(|_| malformed(&format!("{} is not valid UTF-8", what)))
}

fn decode_u16(frame: &[u8], what: &str) -> Result<u16> {
    let bytes: [u8; 2] = frame
        .try_into()
        .map_err(|_| malformed(&format!("{} frame invalid", what)))?;
    Ok(u16::from_be_bytes(bytes))
}

fn decode_opt_tag(frame: &[u8], what: &str) -> Result<Option<u16>> {
    if frame.is_empty() {
        return Ok(None);
    }
    decode_u16(frame, what).map(Some)
}
