//! The worker lifecycle value.
//!
//! A [`Worker`] owns the configuration of one build worker: which master to
//! attach to, the identity to present, the label set, the workspace root and
//! the executor budget. [`Worker::run`] performs one connection lifetime;
//! reconnection policy belongs to the caller.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use buildmesh_proto::job::method_name;

use crate::builder::Builder;
use crate::error::{Result, WorkerError};
use crate::runners::{self, Runner};
use crate::session::{Session, SessionConfig};
use crate::workspace::WorkspaceManager;

/// The label every worker carries in addition to its configured ones.
pub const ANY_LABEL: &str = "any";

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Master address as `host:port`.
    pub master_addr: String,
    pub token: Option<String>,
    /// Identity, unique within the master.
    pub identity: String,
    /// Capability labels; `any` is always implied.
    pub labels: Vec<String>,
    pub workspace_root: PathBuf,
    /// Number of jobs that may run scripts in parallel.
    pub executors: usize,
}

pub struct Worker {
    config: WorkerConfig,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }

    /// Connects to the master, exports one method per (label, runner) pair,
    /// and serves build requests until the connection drops or `shutdown`
    /// fires.
    ///
    /// Runners are probed on every call, so a runner installed between
    /// reconnects is picked up.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let available = runners::available();
        self.run_with_runners(available, shutdown).await
    }

    /// Like [`Worker::run`] with an explicit runner set (used by tests).
    pub async fn run_with_runners(
        &self,
        available: Vec<Runner>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        if available.is_empty() {
            return Err(WorkerError::NoRunners);
        }
        info!("available runners:");
        for runner in &available {
            info!("---> {}", runner.name);
        }

        let manager = Arc::new(WorkspaceManager::new(&self.config.workspace_root));
        let executors = Arc::new(Semaphore::new(self.config.executors.max(1)));
        info!(executors = self.config.executors, "initiating build executors");

        let mut session = Session::new(SessionConfig {
            master_addr: self.config.master_addr.clone(),
            token: self.config.token.clone(),
            identity: self.config.identity.clone(),
        });

        for label in self.labels() {
            for runner in &available {
                let method = method_name(&label, runner.name);
                let builder = Builder::new(runner.clone(), manager.clone(), executors.clone());
                session.register_method(method, Arc::new(builder));
            }
        }

        info!("waiting for build requests...");
        session.run(shutdown).await
    }

    /// The configured labels with `any` prepended and duplicates removed.
    fn labels(&self) -> Vec<String> {
        let mut labels = vec![ANY_LABEL.to_string()];
        for label in &self.config.labels {
            let label = label.trim();
            if !label.is_empty() && !labels.iter().any(|l| l == label) {
                labels.push(label.to_string());
            }
        }
        labels
    }
}
