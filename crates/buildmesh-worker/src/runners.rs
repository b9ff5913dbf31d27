//! Script runners.
//!
//! A runner maps a repository-relative script path to a child-process
//! invocation (`bash build.sh`, `node build.js`, ...). At startup the worker
//! probes each known runner and only registers methods for the ones actually
//! installed on the machine.

use tokio::process::Command;
use tracing::debug;

/// A script-interpreter family available on this worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Runner {
    pub name: &'static str,
    exe: &'static str,
    args: &'static [&'static str],
    probe_args: &'static [&'static str],
}

impl Runner {
    /// The child-process spec for running `script`.
    pub fn command(&self, script: &str) -> Command {
        let mut command = Command::new(self.exe);
        command.args(self.args);
        command.arg(script);
        command
    }

    fn probe(&self) -> bool {
        std::process::Command::new(self.exe)
            .args(self.probe_args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .is_ok()
    }
}

const KNOWN: &[Runner] = &[
    Runner {
        name: "bash",
        exe: "bash",
        args: &[],
        probe_args: &["--version"],
    },
    Runner {
        name: "node",
        exe: "node",
        args: &[],
        probe_args: &["--version"],
    },
    Runner {
        name: "cmd",
        exe: "cmd",
        args: &["/C"],
        probe_args: &["/C", "ver"],
    },
    Runner {
        name: "powershell",
        exe: "powershell",
        args: &["-File"],
        probe_args: &["-Command", "exit"],
    },
];

/// Every runner this build knows about, installed or not.
pub fn known() -> &'static [Runner] {
    KNOWN
}

/// The runners actually present on this machine.
pub fn available() -> Vec<Runner> {
    KNOWN
        .iter()
        .filter(|runner| {
            let present = runner.probe();
            debug!(runner = runner.name, present, "probed runner");
            present
        })
        .cloned()
        .collect()
}

/// Looks up a known runner by name.
pub fn by_name(name: &str) -> Option<&'static Runner> {
    KNOWN.iter().find(|runner| runner.name == name)
}
