use buildmesh_proto::ProtoError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("no script runners available on this machine")]
    NoRunners,

    #[error("unsupported VCS scheme: {0}")]
    UnsupportedVcs(String),

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("connection closed by master")]
    Disconnected,

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
