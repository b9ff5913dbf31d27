//! Connection upgrade handshake.
//!
//! Before any framed traffic, a connecting application performs a minimal
//! HTTP/1.1 upgrade exchange on the raw stream:
//!
//! ```text
//! GET /rpc HTTP/1.1
//! Host: <broker>
//! Upgrade: bmx-rpc/1
//! Connection: Upgrade
//! Authorization: Bearer <token>
//! X-Buildmesh-Identity: <identity>
//! ```
//!
//! The broker answers `101 Switching Protocols` on success, `401` on a bad
//! token, `409` when the identity is already connected, and `400` for a
//! malformed request. After `101` the connection carries only framed
//! messages.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtoError, Result};

/// Value of the `Upgrade` header both sides must present.
pub const UPGRADE_PROTOCOL: &str = "bmx-rpc/1";

/// Header carrying the application identity.
pub const IDENTITY_HEADER: &str = "x-buildmesh-identity";

/// Handshake head size cap. A legitimate hello is a few hundred bytes.
const MAX_HEAD_SIZE: usize = 8 * 1024;

/// The parsed client side of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub identity: String,
    pub token: Option<String>,
}

/// Why the broker refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    BadRequest,
    InvalidToken,
    IdentityCollision,
}

impl Rejection {
    fn status_line(self) -> &'static str {
        match self {
            Rejection::BadRequest => "HTTP/1.1 400 Bad Request",
            Rejection::InvalidToken => "HTTP/1.1 401 Unauthorized",
            Rejection::IdentityCollision => "HTTP/1.1 409 Conflict",
        }
    }
}

/// Sends the client hello.
pub async fn send_client_hello<S>(stream: &mut S, identity: &str, token: Option<&str>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut head = String::with_capacity(256);
    head.push_str("GET /rpc HTTP/1.1\r\n");
    head.push_str("Upgrade: ");
    head.push_str(UPGRADE_PROTOCOL);
    head.push_str("\r\nConnection: Upgrade\r\n");
    if let Some(token) = token {
        head.push_str("Authorization: Bearer ");
        head.push_str(token);
        head.push_str("\r\n");
    }
    head.push_str("X-Buildmesh-Identity: ");
    head.push_str(identity);
    head.push_str("\r\n\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads and parses the client hello on the broker side.
pub async fn read_client_hello<S>(stream: &mut S) -> Result<ClientHello>
where
    S: AsyncRead + Unpin,
{
    let head = read_head(stream).await?;
    let mut lines = head.split("\r\n");

    let request_line = lines
        .next()
        .ok_or_else(|| ProtoError::Handshake("empty request".to_string()))?;
    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("GET"), Some("/rpc"), Some("HTTP/1.1")) => {}
        _ => {
            return Err(ProtoError::Handshake(format!(
                "unexpected request line: {}",
                request_line
            )))
        }
    }

    let mut identity = None;
    let mut token = None;
    let mut upgrade = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match name.as_str() {
            IDENTITY_HEADER => identity = Some(value.to_string()),
            "upgrade" => upgrade = Some(value.to_string()),
            "authorization" => {
                token = value
                    .strip_prefix("Bearer ")
                    .or_else(|| value.strip_prefix("bearer "))
                    .map(str::to_string);
            }
            _ => {}
        }
    }

    if upgrade.as_deref() != Some(UPGRADE_PROTOCOL) {
        return Err(ProtoError::Handshake(format!(
            "unsupported upgrade protocol: {}",
            upgrade.unwrap_or_default()
        )));
    }
    let identity = identity
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProtoError::Handshake("identity not set".to_string()))?;

    Ok(ClientHello { identity, token })
}

/// Confirms the upgrade; the connection speaks framed messages from here on.
pub async fn accept<S>(stream: &mut S) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: {}\r\nConnection: Upgrade\r\n\r\n",
        UPGRADE_PROTOCOL
    );
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Refuses the upgrade with the given status.
pub async fn reject<S>(stream: &mut S, rejection: Rejection) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!("{}\r\n\r\n", rejection.status_line());
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads the broker's response on the client side.
///
/// `identity` is only used to build the error for a `409` response.
pub async fn read_server_response<S>(stream: &mut S, identity: &str) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let head = read_head(stream).await?;
    let status_line = head.split("\r\n").next().unwrap_or_default();
    let code = status_line.split_whitespace().nth(1).unwrap_or_default();

    match code {
        "101" => Ok(()),
        "401" => Err(ProtoError::InvalidToken),
        "409" => Err(ProtoError::IdentityCollision(identity.to_string())),
        _ => Err(ProtoError::Handshake(format!(
            "unexpected response: {}",
            status_line
        ))),
    }
}

/// Reads bytes until the blank line terminating the head.
///
/// Byte-at-a-time is fine here: the handshake happens once per connection and
/// reading past the head would eat the first frames of the message stream.
async fn read_head<S>(stream: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    loop {
        let byte = stream.read_u8().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ProtoError::Handshake("connection closed during handshake".to_string())
            } else {
                ProtoError::Io(e)
            }
        })?;
        head.push(byte);
        if head.ends_with(b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(ProtoError::Handshake("handshake head too large".to_string()));
        }
    }
    String::from_utf8(head).map_err(|_| ProtoError::Handshake("head is not valid UTF-8".to_string()))
}
