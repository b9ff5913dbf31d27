//! Build job payloads and return codes.
//!
//! These are the opaque payloads carried in REQUEST args and REPLY return
//! value frames. The deployment codec is JSON; stream data never passes
//! through it (stdout/stderr bytes ride in raw STREAM-FRAME frames).

use std::io::{self, Write};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ProtoError, Result};

/// Method-name namespace fixed for this deployment.
///
/// Workers register one method per (label, runner) pair they can satisfy,
/// named `mesh.<label>.<runner>`, e.g. `mesh.any.bash`.
pub const METHOD_NAMESPACE: &str = "mesh";

/// Repository URL schemes a worker will fetch.
pub const SUPPORTED_SCHEMES: [&str; 3] = ["git+ssh", "git+https", "git+file"];

/// Builds the RPC method name for a (label, runner) pair.
pub fn method_name(label: &str, runner: &str) -> String {
    format!("{}.{}.{}", METHOD_NAMESPACE, label, runner)
}

/// Return codes carried in REPLY messages.
pub mod code {
    pub const SUCCESS: u8 = 0;
    pub const SCRIPT_FAILED: u8 = 1;
    pub const DECODE_FAILED: u8 = 2;
    pub const VALIDATION_FAILED: u8 = 3;
    pub const WORKSPACE_FAILED: u8 = 4;
    pub const INTERRUPTED: u8 = 5;
    pub const FS_CHECK_FAILED: u8 = 6;
    pub const UNSUPPORTED_VCS: u8 = 7;
    pub const FETCH_FAILED: u8 = 8;
    pub const NO_PROVIDER: u8 = 254;
    pub const DISPATCH_FAILED: u8 = 255;
}

/// Arguments of a build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuildArgs {
    /// Repository URL, scheme `git+{ssh,https,file}`, optional `#fragment`
    /// naming the branch or ref to check out.
    pub repository: String,
    /// Repository-relative path of the script to run.
    pub script: String,
    /// Extra `KEY=VALUE` pairs appended to the script environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// When set, the worker resolves the request immediately with code 0
    /// without touching the workspace. Used for connectivity checks.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub noop: bool,
}

impl BuildArgs {
    /// Validates the arguments and returns the parsed repository URL.
    pub fn validate(&self) -> Result<Url> {
        if self.script.is_empty() {
            return Err(ProtoError::InvalidArgs("script not set".to_string()));
        }
        let url = Url::parse(&self.repository)
            .map_err(|e| ProtoError::InvalidArgs(format!("repository: {}", e)))?;
        if !SUPPORTED_SCHEMES.contains(&url.scheme()) {
            return Err(ProtoError::InvalidArgs(format!(
                "unsupported repository URL scheme: {}",
                url.scheme()
            )));
        }
        for pair in &self.env {
            if !pair.contains('=') {
                return Err(ProtoError::InvalidArgs(format!(
                    "malformed env entry (expected KEY=VALUE): {}",
                    pair
                )));
            }
        }
        Ok(url)
    }
}

/// Result payload of a build request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BuildResult {
    /// Time spent materializing the sources, in milliseconds.
    #[serde(with = "duration_millis")]
    pub pull_duration: Duration,
    /// Time spent running the script, in milliseconds.
    #[serde(with = "duration_millis")]
    pub build_duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BuildResult {
    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Writes the human-readable summary block shown after every build.
    pub fn write_summary<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "=== BUILD SUMMARY ==========================================")?;
        writeln!(w, "Pull duration:  {:?}", self.pull_duration)?;
        writeln!(w, "Build duration: {:?}", self.build_duration)?;
        match &self.error {
            Some(error) => writeln!(w, "Error:          {}", error)?,
            None => writeln!(w, "Error:          none")?,
        }
        writeln!(w, "============================================================")
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(repository: &str) -> BuildArgs {
        BuildArgs {
            repository: repository.to_string(),
            script: "build.sh".to_string(),
            ..BuildArgs::default()
        }
    }

    #[test]
    fn method_name_format() {
        assert_eq!(method_name("any", "bash"), "mesh.any.bash");
        assert_eq!(method_name("linux", "node"), "mesh.linux.node");
    }

    #[test]
    fn valid_args_pass() {
        for repo in [
            "git+ssh://git@example.com/team/project",
            "git+https://example.com/team/project#develop",
            "git+file:///tmp/fixture",
        ] {
            args(repo).validate().unwrap();
        }
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let err = args("svn+ssh://example.com/repo").validate().unwrap_err();
        assert!(matches!(err, ProtoError::InvalidArgs(_)));
    }

    #[test]
    fn unparsable_url_rejected() {
        assert!(args("not a url").validate().is_err());
    }

    #[test]
    fn empty_script_rejected() {
        let mut a = args("git+file:///tmp/fixture");
        a.script = String::new();
        assert!(a.validate().is_err());
    }

    #[test]
    fn env_pairs_must_contain_equals() {
        let mut a = args("git+file:///tmp/fixture");
        a.env = vec!["GOOD=1".to_string(), "BAD".to_string()];
        assert!(a.validate().is_err());

        a.env = vec!["GOOD=1".to_string(), "ALSO=fine=here".to_string()];
        a.validate().unwrap();
    }

    #[test]
    fn fragment_carries_the_ref() {
        let url = args("git+https://example.com/team/project#release-1.2")
            .validate()
            .unwrap();
        assert_eq!(url.fragment(), Some("release-1.2"));
    }

    #[test]
    fn args_json_round_trip() {
        let a = BuildArgs {
            repository: "git+file:///tmp/fixture".to_string(),
            script: "build.sh".to_string(),
            env: vec!["A=1".to_string()],
            noop: true,
        };
        let encoded = serde_json::to_vec(&a).unwrap();
        assert_eq!(serde_json::from_slice::<BuildArgs>(&encoded).unwrap(), a);
    }

    #[test]
    fn result_durations_serialize_as_millis() {
        let r = BuildResult {
            pull_duration: Duration::from_millis(1500),
            build_duration: Duration::from_secs(2),
            error: None,
        };
        let value: serde_json::Value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["pull_duration"], 1500);
        assert_eq!(value["build_duration"], 2000);

        let back: BuildResult = serde_json::from_value(value).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn summary_mentions_the_error() {
        let mut out = Vec::new();
        BuildResult::with_error("exit status 7")
            .write_summary(&mut out)
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("exit status 7"));
    }
}
