//! Buildmesh - distributed build execution.
//!
//! This facade crate re-exports the buildmesh components; the end-to-end
//! tests under `tests/` run a master, a worker and a client together inside
//! one process.

pub use buildmesh_broker as broker;
pub use buildmesh_client as client;
pub use buildmesh_proto as proto;
pub use buildmesh_worker as worker;
