use buildmesh_proto::ProtoError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("connection to master lost")]
    Disconnected,

    #[error("call already interrupted")]
    AlreadyInterrupted,

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;
