use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("protocol header mismatch")]
    HeaderMismatch,

    #[error("invalid access token")]
    InvalidToken,

    #[error("identity already connected: {0}")]
    IdentityCollision(String),

    #[error("unknown message receiver: {0}")]
    UnknownReceiver(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("endpoint terminated")]
    Terminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtoError>;
