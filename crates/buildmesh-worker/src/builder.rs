//! The per-job build handler.
//!
//! One [`Builder`] instance backs every method a worker exports; each carries
//! its runner plus the shared workspace manager and executor pool. A job
//! moves through: decode and validate the arguments, derive the workspace,
//! take the workspace lock, take an executor slot, materialize the sources,
//! run the script, resolve. Failure at any stage resolves the request with
//! that stage's return code and releases whatever was already held.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use buildmesh_proto::job::code;
use buildmesh_proto::{BuildArgs, BuildResult};

use crate::process;
use crate::session::{BoxFuture, JobHandler, JobRequest, StreamSink};
use crate::vcs;
use crate::workspace::WorkspaceManager;

/// How often a waiting job narrates that it is still queued.
const ACQUIRE_TICK: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Builder {
    runner: crate::runners::Runner,
    manager: Arc<WorkspaceManager>,
    executors: Arc<Semaphore>,
}

impl Builder {
    pub fn new(
        runner: crate::runners::Runner,
        manager: Arc<WorkspaceManager>,
        executors: Arc<Semaphore>,
    ) -> Self {
        Self {
            runner,
            manager,
            executors,
        }
    }

    async fn build(self, request: JobRequest) {
        let stdout = request.stdout();
        let stderr = request.stderr();

        // Decode and validate the arguments.
        let args: BuildArgs = match request.decode_args() {
            Ok(args) => args,
            Err(e) => {
                request.resolve(code::DECODE_FAILED, &BuildResult::with_error(e.to_string()));
                return;
            }
        };
        let url = match args.validate() {
            Ok(url) => url,
            Err(e) => {
                request.resolve(code::VALIDATION_FAILED, &BuildResult::with_error(e.to_string()));
                return;
            }
        };
        if args.noop {
            request.resolve(code::SUCCESS, &BuildResult::default());
            return;
        }

        info!(repository = %args.repository, script = %args.script, runner = self.runner.name,
            "build accepted");

        // Derive the project workspace and make sure it exists.
        let workspace = match self.manager.ensure_workspace(&url) {
            Ok(workspace) => workspace,
            Err(e) => {
                request.resolve(code::WORKSPACE_FAILED, &BuildResult::with_error(e.to_string()));
                return;
            }
        };

        // The workspace lock, then an executor slot. Both waits narrate
        // progress and stay interruptible.
        let lock = self.manager.workspace_lock(&workspace);
        let Some(_workspace_permit) =
            acquire("Locking the project workspace", lock, &request, &stdout).await
        else {
            request.resolve(code::INTERRUPTED, &BuildResult::with_error("interrupted"));
            return;
        };
        let Some(_executor_permit) = acquire(
            "Waiting for a free executor",
            self.executors.clone(),
            &request,
            &stdout,
        )
        .await
        else {
            request.resolve(code::INTERRUPTED, &BuildResult::with_error("interrupted"));
            return;
        };

        // Start measuring the build time.
        let start = Instant::now();

        // Check out the sources at the right revision.
        let src_dir = self.manager.src_dir(&workspace);
        let src_dir_exists = match self.manager.src_dir_exists(&workspace) {
            Ok(exists) => exists,
            Err(e) => {
                resolve(request, code::FS_CHECK_FAILED, start, None, None, Some(e.to_string()));
                return;
            }
        };
        let vcs = match vcs::for_scheme(url.scheme()) {
            Ok(vcs) => vcs,
            Err(e) => {
                resolve(request, code::UNSUPPORTED_VCS, start, None, None, Some(e.to_string()));
                return;
            }
        };

        stdout.write_line(format!(
            "\n---> Pulling the sources (using URL {:?})",
            args.repository
        ));
        let fetched = if src_dir_exists {
            vcs.pull(&url, &src_dir, &stdout, &stderr, request.interrupted())
                .await
        } else {
            vcs.clone_repo(&url, &src_dir, &stdout, &stderr, request.interrupted())
                .await
        };
        let pulled = Instant::now();
        if let Err(e) = fetched {
            resolve(request, code::FETCH_FAILED, start, Some(pulled), None, Some(e.to_string()));
            return;
        }

        // Run the specified script.
        let mut command = self.runner.command(&args.script);
        command.current_dir(&src_dir);
        for pair in &args.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        command.env("WORKSPACE", &workspace);
        command.env("SRCDIR", &src_dir);

        stdout.write_line(format!(
            "\n---> Running the script located at {} (using runner {:?})",
            args.script, self.runner.name
        ));
        let ran = process::run(command, request.interrupted(), &stdout, &stderr).await;
        let built = Instant::now();

        let error = match ran {
            Ok(status) if status.success() => None,
            Ok(status) => Some(status.to_string()),
            Err(e) => Some(e.to_string()),
        };
        let return_code = if error.is_none() {
            code::SUCCESS
        } else {
            code::SCRIPT_FAILED
        };
        resolve(request, return_code, start, Some(pulled), Some(built), error);
    }
}

impl JobHandler for Builder {
    fn handle(&self, request: JobRequest) -> BoxFuture<()> {
        let builder = self.clone();
        Box::pin(builder.build(request))
    }
}

/// Waits on a semaphore while narrating progress every 30 seconds. Returns
/// `None` when the request is interrupted before the permit arrives.
async fn acquire(
    message: &str,
    semaphore: Arc<Semaphore>,
    request: &JobRequest,
    stdout: &StreamSink,
) -> Option<OwnedSemaphorePermit> {
    stdout.write_line(format!("---> {}", message));

    let mut acquired = std::pin::pin!(semaphore.acquire_owned());
    let mut ticker = tokio::time::interval(ACQUIRE_TICK);
    ticker.tick().await; // the first tick completes immediately
    loop {
        tokio::select! {
            permit = &mut acquired => {
                // The semaphore is never closed while jobs run.
                return Some(permit.expect("semaphore closed"));
            }
            _ = request.interrupted().cancelled() => {
                debug!("interrupted while waiting: {}", message);
                return None;
            }
            _ = ticker.tick() => {
                stdout.write_line("---> ...");
                request.signal_progress();
            }
        }
    }
}

/// Builds the result payload, writes the summary onto the job's stdout and
/// resolves the request. Durations: pull is measured from the build start to
/// the end of the fetch, build from the end of the fetch to the end of the
/// script run.
fn resolve(
    request: JobRequest,
    return_code: u8,
    start: Instant,
    pulled: Option<Instant>,
    built: Option<Instant>,
    error: Option<String>,
) {
    let mut result = BuildResult {
        error,
        ..BuildResult::default()
    };
    if let Some(pulled) = pulled {
        result.pull_duration = pulled.duration_since(start);
        if let Some(built) = built {
            result.build_duration = built.duration_since(pulled);
        }
    }

    let stdout = request.stdout();
    if result.error.is_some() {
        stdout.write_line("\n---> Build failed");
    } else {
        stdout.write_line("\n---> Build succeeded");
    }
    let mut summary = Vec::new();
    if result.write_summary(&mut summary).is_ok() {
        stdout.write(&summary);
    }

    request.resolve(return_code, &result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildmesh_proto::message::{Envelope, Message, Request};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Job {
        rx: mpsc::UnboundedReceiver<Envelope>,
        interrupted: CancellationToken,
    }

    fn builder_with(manager: Arc<WorkspaceManager>, executors: usize) -> Builder {
        Builder::new(
            crate::runners::by_name("bash").unwrap().clone(),
            manager,
            Arc::new(Semaphore::new(executors)),
        )
    }

    fn start_job(builder: &Builder, args: serde_json::Value) -> Job {
        let (tx, rx) = mpsc::unbounded_channel();
        let interrupted = CancellationToken::new();
        let request = JobRequest::new(
            Request {
                id: 1,
                method: "mesh.any.bash".to_string(),
                args: serde_json::to_vec(&args).unwrap(),
                stdout_tag: Some(1),
                stderr_tag: Some(2),
            },
            "client".to_string(),
            tx,
            interrupted.clone(),
        );
        let handler = builder.clone();
        tokio::spawn(async move { handler.build(request).await });
        Job { rx, interrupted }
    }

    async fn await_reply(job: &mut Job) -> (u8, BuildResult) {
        loop {
            let envelope = tokio::time::timeout(Duration::from_secs(10), job.rx.recv())
                .await
                .expect("timed out waiting for reply")
                .expect("job channel closed");
            if let Message::Reply(reply) = envelope.message {
                let result = serde_json::from_slice(&reply.return_value).unwrap_or_default();
                return (reply.return_code, result);
            }
        }
    }

    fn temp_manager() -> (tempfile::TempDir, Arc<WorkspaceManager>) {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(WorkspaceManager::new(dir.path().join("workspaces")));
        (dir, manager)
    }

    #[tokio::test]
    async fn noop_resolves_immediately_with_zero_durations() {
        let (_dir, manager) = temp_manager();
        let builder = builder_with(manager, 1);

        let mut job = start_job(
            &builder,
            serde_json::json!({
                "repository": "git+file:///tmp/fixture",
                "script": "build.sh",
                "noop": true,
            }),
        );

        let (return_code, result) = await_reply(&mut job).await;
        assert_eq!(return_code, code::SUCCESS);
        assert_eq!(result.pull_duration, Duration::ZERO);
        assert_eq!(result.build_duration, Duration::ZERO);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn undecodable_args_resolve_with_code_2() {
        let (_dir, manager) = temp_manager();
        let builder = builder_with(manager, 1);

        let (tx, rx) = mpsc::unbounded_channel();
        let request = JobRequest::new(
            Request {
                id: 1,
                method: "mesh.any.bash".to_string(),
                args: b"this is not json".to_vec(),
                stdout_tag: None,
                stderr_tag: None,
            },
            "client".to_string(),
            tx,
            CancellationToken::new(),
        );
        let handler = builder.clone();
        tokio::spawn(async move { handler.build(request).await });

        let mut job = Job {
            rx,
            interrupted: CancellationToken::new(),
        };
        let (return_code, result) = await_reply(&mut job).await;
        assert_eq!(return_code, code::DECODE_FAILED);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn invalid_args_resolve_with_code_3() {
        let (_dir, manager) = temp_manager();
        let builder = builder_with(manager, 1);

        let mut job = start_job(
            &builder,
            serde_json::json!({
                "repository": "svn+ssh://example.com/repo",
                "script": "build.sh",
            }),
        );

        let (return_code, _) = await_reply(&mut job).await;
        assert_eq!(return_code, code::VALIDATION_FAILED);
    }

    #[tokio::test]
    async fn interrupt_while_queued_resolves_with_code_5() {
        let (_dir, manager) = temp_manager();
        let builder = builder_with(manager.clone(), 1);

        // Hold the workspace lock so the job queues behind it.
        let url = url::Url::parse("git+file:///tmp/fixture").unwrap();
        let workspace = manager.ensure_workspace(&url).unwrap();
        let lock = manager.workspace_lock(&workspace);
        let _held = lock.acquire().await.unwrap();

        let mut job = start_job(
            &builder,
            serde_json::json!({
                "repository": "git+file:///tmp/fixture",
                "script": "build.sh",
            }),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        job.interrupted.cancel();

        let (return_code, result) = await_reply(&mut job).await;
        assert_eq!(return_code, code::INTERRUPTED);
        assert_eq!(result.error.as_deref(), Some("interrupted"));
    }

    #[tokio::test]
    async fn fetch_failure_resolves_with_code_8() {
        if !git_available() {
            return;
        }
        let (_dir, manager) = temp_manager();
        let builder = builder_with(manager, 1);

        // The repository path does not exist, so the clone must fail.
        let mut job = start_job(
            &builder,
            serde_json::json!({
                "repository": "git+file:///nonexistent/repository/path",
                "script": "build.sh",
            }),
        );

        let (return_code, result) = await_reply(&mut job).await;
        assert_eq!(return_code, code::FETCH_FAILED);
        assert!(result.error.is_some());

        // Whatever the outcome, the workspace lock and the executor slot come
        // back. The job task drops its permits just after replying, so poll
        // briefly.
        let url = url::Url::parse("git+file:///nonexistent/repository/path").unwrap();
        let workspace = builder.manager.workspace_path(&url);
        let lock = builder.manager.workspace_lock(&workspace);
        for _ in 0..50 {
            if lock.available_permits() == 1 && builder.executors.available_permits() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lock.available_permits(), 1);
        assert_eq!(builder.executors.available_permits(), 1);
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}
