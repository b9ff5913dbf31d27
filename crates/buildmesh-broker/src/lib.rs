//! Buildmesh routing broker
//!
//! The broker is the hub every build worker and build client connects to. It
//! owns no build logic of its own; its responsibilities are:
//!
//! 1. **Capability routing**: map `(application, method)` registrations and
//!    pick a provider per request via round-robin (see [`exchange`])
//! 2. **Relaying**: forward requests, interrupts, progress signals, stream
//!    frames and replies between the two sides of each in-flight request
//! 3. **Liveness**: ping registered applications and drop the ones that stop
//!    answering (see [`heartbeat`])
//! 4. **Endpoint supervision**: restart crashed listener endpoints within a
//!    sliding-window error budget (see [`supervisor`])
//!
//! [`Master`] ties these together into a single lifecycle value with
//! `start`/`terminate`/`wait` operations; tests construct isolated instances
//! and there is no process-wide default.

pub mod endpoint;
pub mod error;
pub mod exchange;
pub mod heartbeat;
pub mod master;
pub mod supervisor;

pub use endpoint::{EndpointConfig, TcpEndpoint};
pub use error::{BrokerError, Result};
pub use exchange::{Dispatch, Exchange, RoundRobin};
pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use master::{Master, MasterConfig};
pub use supervisor::{CrashReport, Endpoint, EndpointFactory, Supervisor};
