use buildmesh_proto::ProtoError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("method {method} already registered by {app}")]
    AlreadyRegistered { app: String, method: String },

    #[error(transparent)]
    Proto(#[from] ProtoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BrokerError>;
