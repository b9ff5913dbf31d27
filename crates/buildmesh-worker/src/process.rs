//! Interruptible child-process supervision.
//!
//! [`run`] spawns the child with piped stdout/stderr, pumps both streams into
//! the job's sinks, and waits on the child concurrently with the request's
//! interrupted-signal. On interruption the child first gets a termination
//! signal; if it has not exited five seconds later it is killed
//! unconditionally and then reaped. No spawned process is ever left behind.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::session::StreamSink;

/// Grace period between the termination signal and the unconditional kill.
pub const TERM_GRACE: Duration = Duration::from_secs(5);

/// Runs `command` to completion, streaming its output into the sinks.
///
/// Returns the child's exit status; an interrupted child reports the status
/// produced by the signal that stopped it.
pub async fn run(
    mut command: Command,
    interrupted: &CancellationToken,
    stdout: &StreamSink,
    stderr: &StreamSink,
) -> std::io::Result<ExitStatus> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;

    let out_pump = tokio::spawn(pump(child.stdout.take(), stdout.clone()));
    let err_pump = tokio::spawn(pump(child.stderr.take(), stderr.clone()));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = interrupted.cancelled() => {
            debug!("interrupt received, terminating child");
            terminate(&child);
            match tokio::time::timeout(TERM_GRACE, child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    warn!("child ignored termination signal, killing");
                    let _ = child.start_kill();
                    child.wait().await?
                }
            }
        }
    };

    // Drain whatever output is still buffered before reporting the status,
    // so stream frames always precede the reply.
    let _ = out_pump.await;
    let _ = err_pump.await;

    Ok(status)
}

async fn pump<R>(reader: Option<R>, sink: StreamSink)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else { return };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => sink.write(&buf[..n]),
        }
    }
}

/// Sends the platform's cooperative termination signal to the child.
#[cfg(unix)]
fn terminate(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else { return };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(pid, error = %e, "failed to signal child");
    }
}

/// Windows has no SIGTERM equivalent we can deliver here; the grace period
/// simply gives the child time before the unconditional kill.
#[cfg(not(unix))]
fn terminate(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use buildmesh_proto::message::{Envelope, Message};
    use tokio::sync::mpsc;

    fn sinks() -> (StreamSink, StreamSink, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = crate::session::JobRequest::new(
            buildmesh_proto::message::Request {
                id: 1,
                method: "m".to_string(),
                args: b"{}".to_vec(),
                stdout_tag: Some(1),
                stderr_tag: Some(2),
            },
            "client".to_string(),
            tx,
            CancellationToken::new(),
        );
        (request.stdout(), request.stderr(), rx)
    }

    fn collect_stream(rx: &mut mpsc::UnboundedReceiver<Envelope>, tag: u16) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            if let Message::StreamFrame { tag: t, body } = envelope.message {
                if t == tag {
                    bytes.extend_from_slice(&body);
                }
            }
        }
        bytes
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_output_in_order() {
        let (stdout, stderr, mut rx) = sinks();
        let mut command = Command::new("sh");
        command.arg("-c").arg("printf 'a\\nb\\nc\\n'");

        let status = run(command, &CancellationToken::new(), &stdout, &stderr)
            .await
            .unwrap();
        assert!(status.success());
        assert_eq!(collect_stream(&mut rx, 1), b"a\nb\nc\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reports_nonzero_exit() {
        let (stdout, stderr, _rx) = sinks();
        let mut command = Command::new("sh");
        command.arg("-c").arg("exit 7");

        let status = run(command, &CancellationToken::new(), &stdout, &stderr)
            .await
            .unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_goes_to_the_stderr_sink() {
        let (stdout, stderr, mut rx) = sinks();
        let mut command = Command::new("sh");
        command.arg("-c").arg("echo oops >&2");

        run(command, &CancellationToken::new(), &stdout, &stderr)
            .await
            .unwrap();
        assert_eq!(collect_stream(&mut rx, 2), b"oops\n");
        assert!(collect_stream(&mut rx, 1).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn interrupt_terminates_a_sleeping_child() {
        let (stdout, stderr, _rx) = sinks();
        let interrupted = CancellationToken::new();
        let mut command = Command::new("sleep");
        command.arg("30");

        let canceller = interrupted.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let status = run(command, &interrupted, &stdout, &stderr).await.unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
