//! Buildmesh build worker
//!
//! A worker connects to the master, registers one RPC method per
//! (label, runner) pair it can satisfy, and executes incoming build jobs:
//!
//! 1. derive a per-repository workspace directory and take its lock
//! 2. take a slot from the bounded executor pool
//! 3. materialize the sources (clone or pull at the requested ref)
//! 4. run the build script with its stdout/stderr streamed back to the
//!    requesting client
//!
//! Jobs stay interruptible at every wait: lock and slot acquisition, the
//! fetch, and the child-process wait all observe the request's
//! interrupted-signal. An interrupted child gets a termination signal, five
//! seconds of grace, then an unconditional kill.

pub mod builder;
pub mod error;
pub mod process;
pub mod runners;
pub mod session;
pub mod vcs;
pub mod worker;
pub mod workspace;

pub use builder::Builder;
pub use error::{Result, WorkerError};
pub use runners::Runner;
pub use session::{JobHandler, JobRequest, Session, SessionConfig, StreamSink};
pub use worker::{Worker, WorkerConfig};
pub use workspace::WorkspaceManager;
