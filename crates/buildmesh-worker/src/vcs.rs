//! Source materialization via git.
//!
//! The repository URL scheme selects the VCS and its transport:
//! `git+ssh`, `git+https` and `git+file` all map to git over the scheme that
//! follows the `git+` prefix. The URL fragment names the branch or ref to
//! check out, defaulting to `master`.
//!
//! Every git invocation streams its output into the job's sinks and observes
//! the job's interrupted-signal, so a hung fetch can be cancelled like any
//! other child process.

use std::path::Path;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Result, WorkerError};
use crate::process;
use crate::session::StreamSink;

const DEFAULT_BRANCH: &str = "master";

/// Git over one concrete transport (`ssh`, `https` or `file`).
pub struct GitVcs {
    transport: &'static str,
}

/// Selects the VCS for a repository URL scheme.
pub fn for_scheme(scheme: &str) -> Result<GitVcs> {
    match scheme {
        "git+ssh" => Ok(GitVcs { transport: "ssh" }),
        "git+https" => Ok(GitVcs { transport: "https" }),
        "git+file" => Ok(GitVcs { transport: "file" }),
        other => Err(WorkerError::UnsupportedVcs(other.to_string())),
    }
}

impl GitVcs {
    /// Clones the repository at its requested ref into `src_dir`.
    pub async fn clone_repo(
        &self,
        url: &Url,
        src_dir: &Path,
        stdout: &StreamSink,
        stderr: &StreamSink,
        interrupted: &CancellationToken,
    ) -> Result<()> {
        let branch = branch_of(url);
        let mut command = Command::new("git");
        command
            .arg("clone")
            .arg("--branch")
            .arg(branch)
            .arg("--single-branch")
            .arg(self.clone_url(url))
            .arg(src_dir);
        self.run_git("clone", command, stdout, stderr, interrupted).await
    }

    /// Updates an existing checkout: fetch, checkout, merge.
    pub async fn pull(
        &self,
        url: &Url,
        src_dir: &Path,
        stdout: &StreamSink,
        stderr: &StreamSink,
        interrupted: &CancellationToken,
    ) -> Result<()> {
        let branch = branch_of(url);

        let mut fetch = Command::new("git");
        fetch.arg("fetch").arg("origin").arg(branch).current_dir(src_dir);
        self.run_git("fetch", fetch, stdout, stderr, interrupted).await?;

        let mut checkout = Command::new("git");
        checkout.arg("checkout").arg(branch).current_dir(src_dir);
        self.run_git("checkout", checkout, stdout, stderr, interrupted).await?;

        let mut merge = Command::new("git");
        merge
            .arg("merge")
            .arg(format!("origin/{}", branch))
            .current_dir(src_dir);
        self.run_git("merge", merge, stdout, stderr, interrupted).await
    }

    /// Rewrites the repository URL onto the real transport scheme.
    fn clone_url(&self, url: &Url) -> String {
        let mut clone_url = format!("{}://", self.transport);
        if !url.username().is_empty() {
            clone_url.push_str(url.username());
            clone_url.push('@');
        }
        if let Some(host) = url.host_str() {
            clone_url.push_str(host);
        }
        if let Some(port) = url.port() {
            clone_url.push(':');
            clone_url.push_str(&port.to_string());
        }
        clone_url.push_str(url.path());
        clone_url
    }

    async fn run_git(
        &self,
        what: &str,
        command: Command,
        stdout: &StreamSink,
        stderr: &StreamSink,
        interrupted: &CancellationToken,
    ) -> Result<()> {
        let status = process::run(command, interrupted, stdout, stderr)
            .await
            .map_err(|e| WorkerError::Fetch(format!("git {}: {}", what, e)))?;
        if !status.success() {
            return Err(WorkerError::Fetch(format!("git {}: {}", what, status)));
        }
        Ok(())
    }
}

fn branch_of(url: &Url) -> &str {
    match url.fragment() {
        Some(fragment) if !fragment.is_empty() => fragment,
        _ => DEFAULT_BRANCH,
    }
}
