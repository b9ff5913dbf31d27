//! # Buildmesh CLI Entry Point
//!
//! Main binary for the buildmesh distributed build system.
//!
//! ## Usage
//!
//! ```bash
//! # Start a master
//! buildmesh master --listen 0.0.0.0:9300 --token sesame --heartbeat 3
//!
//! # Start a build worker (reconnects with backoff when the master drops)
//! buildmesh worker --master tcp://master.example.com:9300 --token sesame \
//!     --identity worker-1 --labels linux --workspace /var/lib/buildmesh
//!
//! # Run a build and stream its output
//! buildmesh build --master tcp://master.example.com:9300 --token sesame \
//!     --repository git+https://example.com/team/project#develop \
//!     --script build.sh --env CONFIGURATION=release
//! ```
//!
//! Every parameter is also accepted from the environment
//! (`BUILDMESH_MASTER_URL`, `BUILDMESH_MASTER_TOKEN`,
//! `BUILDMESH_WORKER_IDENTITY`, `BUILDMESH_WORKER_LABELS`,
//! `BUILDMESH_WORKER_WORKSPACE`); a flag wins over its variable.
//!
//! Process exit codes: 0 success, 1 unrecoverable runtime error, 2 usage
//! error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use argh::FromArgs;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use buildmesh_broker::{Master, MasterConfig};
use buildmesh_client::{Client, ClientConfig};
use buildmesh_proto::job::method_name;
use buildmesh_proto::BuildArgs as JobArgs;
use buildmesh_proto::BuildResult;
use buildmesh_worker::{Worker, WorkerConfig};

const ENV_MASTER_URL: &str = "BUILDMESH_MASTER_URL";
const ENV_MASTER_TOKEN: &str = "BUILDMESH_MASTER_TOKEN";
const ENV_WORKER_IDENTITY: &str = "BUILDMESH_WORKER_IDENTITY";
const ENV_WORKER_LABELS: &str = "BUILDMESH_WORKER_LABELS";
const ENV_WORKER_WORKSPACE: &str = "BUILDMESH_WORKER_WORKSPACE";

/// Reconnect backoff bounds for the worker loop.
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// A connection that survived this long resets the failure counter.
const ERROR_CALM_PERIOD: Duration = Duration::from_secs(10);
const ERROR_THRESHOLD: u32 = 5;

#[derive(FromArgs)]
/// buildmesh - distributed build execution
struct Cli {
    /// print info-level log output to the console
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// print debug-level log output to the console
    #[argh(switch)]
    debug: bool,

    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Master(MasterArgs),
    Worker(WorkerArgs),
    Build(BuildCommandArgs),
}

/// Arguments for running a build master.
#[derive(FromArgs)]
#[argh(subcommand, name = "master")]
/// run a build master
struct MasterArgs {
    /// address to listen on
    #[argh(option, default = "\"0.0.0.0:9300\".to_string()")]
    listen: String,

    /// shared access token workers and clients must present
    #[argh(option)]
    token: Option<String>,

    /// heartbeat period in seconds; 0 disables liveness checking
    #[argh(option, default = "0")]
    heartbeat: u64,
}

/// Arguments for running a build worker.
#[derive(FromArgs)]
#[argh(subcommand, name = "worker")]
/// run a build worker
struct WorkerArgs {
    /// master to connect to, e.g. tcp://host:9300
    #[argh(option)]
    master: Option<String>,

    /// master access token
    #[argh(option)]
    token: Option<String>,

    /// worker identity; must be unique within the master
    #[argh(option)]
    identity: Option<String>,

    /// comma-separated capability labels; "any" is always implied
    #[argh(option)]
    labels: Option<String>,

    /// directory holding the per-repository workspaces
    #[argh(option)]
    workspace: Option<PathBuf>,

    /// number of builds that may run in parallel; defaults to the CPU count
    #[argh(option)]
    executors: Option<usize>,
}

/// Arguments for running a build.
#[derive(FromArgs)]
#[argh(subcommand, name = "build")]
/// run a build job and stream its output
struct BuildCommandArgs {
    /// master to connect to, e.g. tcp://host:9300
    #[argh(option)]
    master: Option<String>,

    /// master access token
    #[argh(option)]
    token: Option<String>,

    /// worker label the job must run on
    #[argh(option, default = "\"any\".to_string()")]
    label: String,

    /// script runner family (bash, node, cmd, powershell)
    #[argh(option, default = "\"bash\".to_string()")]
    runner: String,

    /// repository URL, scheme git+{ssh,https,file}, optional #ref fragment
    #[argh(option)]
    repository: Option<String>,

    /// repository-relative path of the script to run
    #[argh(option)]
    script: Option<String>,

    /// extra KEY=VALUE environment entries for the script (repeatable)
    #[argh(option, long = "env")]
    env: Vec<String>,

    /// only check that a worker would accept the job; do not fetch or build
    #[argh(switch)]
    noop: bool,
}

fn main() -> ExitCode {
    let cli: Cli = argh::from_env();
    init_tracing(&cli);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::from(1);
        }
    };

    let result = match cli.command {
        Commands::Master(args) => runtime.block_on(run_master(args)),
        Commands::Worker(args) => runtime.block_on(run_worker(args)),
        Commands::Build(args) => runtime.block_on(run_build(args)),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(cli: &Cli) {
    use tracing_subscriber::EnvFilter;

    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_master(args: MasterArgs) -> Result<ExitCode> {
    let heartbeat = match args.heartbeat {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let master = Master::start(MasterConfig {
        addr: args.listen.clone(),
        token: args.token,
        heartbeat,
    });
    let addr = master.local_addr().await.context("failed to bind listener")?;
    info!(%addr, "master listening");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            master.terminate();
        }
        _ = master.terminated() => {}
    }

    match master.wait().await {
        None => Ok(ExitCode::SUCCESS),
        Some(e) => Err(e.into()),
    }
}

async fn run_worker(args: WorkerArgs) -> Result<ExitCode> {
    let master = require(args.master, "--master", ENV_MASTER_URL);
    let token = fallback(args.token, ENV_MASTER_TOKEN);
    let identity = require(args.identity, "--identity", ENV_WORKER_IDENTITY);
    let labels = fallback(args.labels, ENV_WORKER_LABELS).unwrap_or_default();
    let workspace = require_path(args.workspace, "--workspace", ENV_WORKER_WORKSPACE);
    let executors = args.executors.unwrap_or_else(default_executors);

    let worker = Worker::new(WorkerConfig {
        master_addr: master_addr(&master)?,
        token,
        identity,
        labels: labels
            .split(',')
            .map(str::to_string)
            .filter(|l| !l.is_empty())
            .collect(),
        workspace_root: workspace,
        executors,
    });

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutting down");
                shutdown.cancel();
            }
        });
    }

    // Keep reconnecting with exponential backoff; give up after too many
    // connections that died right away.
    let mut backoff = MIN_BACKOFF;
    let mut failures: u32 = 0;
    loop {
        let connected_at = Instant::now();
        match worker.run(shutdown.clone()).await {
            Ok(()) => return Ok(ExitCode::SUCCESS),
            Err(e) => {
                if shutdown.is_cancelled() {
                    return Ok(ExitCode::SUCCESS);
                }
                warn!(error = %e, "connection to master failed");
            }
        }

        if connected_at.elapsed() >= ERROR_CALM_PERIOD {
            backoff = MIN_BACKOFF;
            failures = 0;
        } else {
            failures += 1;
            if failures >= ERROR_THRESHOLD {
                anyhow::bail!("giving up after {} consecutive connection failures", failures);
            }
        }

        info!(seconds = backoff.as_secs(), "reconnecting after backoff");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.cancelled() => return Ok(ExitCode::SUCCESS),
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn run_build(args: BuildCommandArgs) -> Result<ExitCode> {
    let master = require(args.master, "--master", ENV_MASTER_URL);
    let token = fallback(args.token, ENV_MASTER_TOKEN);
    let repository = require(args.repository, "--repository", "");
    let script = require(args.script, "--script", "");

    let job = JobArgs {
        repository,
        script,
        env: args.env,
        noop: args.noop,
    };
    // Local validation catches usage errors before anything connects.
    if let Err(e) = job.validate() {
        eprintln!("Error: {}", e);
        return Ok(ExitCode::from(2));
    }
    let method = method_name(&args.label, &args.runner);

    let client = Client::connect(ClientConfig {
        master_addr: master_addr(&master)?,
        token,
        identity: None,
    })
    .await
    .context("failed to connect to master")?;

    let mut call = client
        .new_call(&method, &job)?
        .stdout(std::io::stdout())
        .stderr(std::io::stderr())
        .execute()?;

    // The first Ctrl-C interrupts the job instead of killing the client; the
    // reply then arrives through the normal path.
    let interrupter = call.interrupter();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("---> Interrupting the build job");
            let _ = interrupter.interrupt();
        }
    });

    let reply = call.wait().await.context("call failed")?;
    ctrl_c.abort();
    client.close();

    let result: BuildResult = match reply.decode() {
        Ok(result) => result,
        // The broker's 254/255 rejections carry plain text.
        Err(_) => BuildResult::with_error(reply.text()),
    };
    let mut stderr = std::io::stderr();
    let _ = result.write_summary(&mut stderr);

    match result.error {
        None => Ok(ExitCode::SUCCESS),
        Some(error) => {
            eprintln!("\nError: {}", error);
            Ok(ExitCode::from(1))
        }
    }
}

/// Reads a missing parameter from the environment; absence is a usage error.
fn require(value: Option<String>, flag: &str, env_key: &str) -> String {
    if let Some(value) = value {
        return value;
    }
    if !env_key.is_empty() {
        if let Ok(value) = std::env::var(env_key) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    if env_key.is_empty() {
        eprintln!("Error: {} is required", flag);
    } else {
        eprintln!("Error: {} is required (or set {})", flag, env_key);
    }
    std::process::exit(2);
}

fn require_path(value: Option<PathBuf>, flag: &str, env_key: &str) -> PathBuf {
    PathBuf::from(require(value.map(|p| p.to_string_lossy().into_owned()), flag, env_key))
}

fn fallback(value: Option<String>, env_key: &str) -> Option<String> {
    value.or_else(|| std::env::var(env_key).ok().filter(|v| !v.is_empty()))
}

fn default_executors() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Normalizes a master URL to `host:port`. Accepts bare `host:port` and the
/// `tcp://` / `bmx://` prefixes.
fn master_addr(url: &str) -> Result<String> {
    let rest = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("bmx://"))
        .unwrap_or(url);
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() || !rest.contains(':') {
        anyhow::bail!("invalid master address '{}': expected host:port", url);
    }
    Ok(rest.to_string())
}
