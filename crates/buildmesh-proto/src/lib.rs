//! Buildmesh wire protocol and shared types
//!
//! This crate provides the protocol layer shared by every buildmesh
//! component: the broker, the build workers and the build clients.
//!
//! # Overview
//!
//! Buildmesh moves build jobs over persistent full-duplex TCP connections.
//! Each connection is established with a small HTTP upgrade handshake that
//! carries the shared access token and the application identity, after which
//! both sides speak length-prefixed multi-frame messages.
//!
//! # Components
//!
//! - [`wire`] - Multi-frame message framing over any byte stream
//! - [`message`] - The typed message model (REGISTER .. PONG) and its
//!   frame-level encoding
//! - [`handshake`] - The connection upgrade exchange (token + identity)
//! - [`auth`] - Shared-token validation
//! - [`ids`] - The 16-bit request/stream id pool
//! - [`job`] - Build job argument and result payloads, return codes
//!
//! # Example
//!
//! ```
//! use buildmesh_proto::message::{Envelope, Message};
//!
//! let envelope = Envelope::new(Message::Register {
//!     method: "mesh.any.bash".to_string(),
//! });
//! let frames = envelope.clone().into_frames();
//! let decoded = Envelope::from_frames(frames).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod auth;
pub mod error;
pub mod handshake;
pub mod ids;
pub mod job;
pub mod message;
pub mod wire;

pub use auth::TokenConfig;
pub use error::{ProtoError, Result};
pub use ids::IdPool;
pub use job::{BuildArgs, BuildResult};
pub use message::{Envelope, Message};
