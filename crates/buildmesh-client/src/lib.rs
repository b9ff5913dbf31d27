//! Buildmesh client
//!
//! Connects to the master, submits build requests, streams the job's stdout
//! and stderr into caller-provided writers, and supports interrupting a call
//! that is still in flight.
//!
//! # Example
//!
//! ```no_run
//! use buildmesh_client::{Client, ClientConfig};
//! use buildmesh_proto::BuildArgs;
//!
//! # async fn example() -> buildmesh_client::Result<()> {
//! let client = Client::connect(ClientConfig {
//!     master_addr: "127.0.0.1:9300".to_string(),
//!     token: Some("secret".to_string()),
//!     identity: None, // a unique identity is generated
//! })
//! .await?;
//!
//! let args = BuildArgs {
//!     repository: "git+https://example.com/team/project".to_string(),
//!     script: "build.sh".to_string(),
//!     ..BuildArgs::default()
//! };
//! let mut call = client
//!     .new_call("mesh.any.bash", &args)?
//!     .stdout(std::io::stdout())
//!     .stderr(std::io::stderr())
//!     .execute()?;
//! let reply = call.wait().await?;
//! println!("return code: {}", reply.return_code);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;

pub use client::{CallHandle, CallInterrupter, CallReply, Client, ClientConfig, RemoteCall};
pub use error::{ClientError, Result};
