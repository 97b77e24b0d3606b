//! Remote command execution seam.
//!
//! Everything the connector does on the cluster goes through
//! [`RemoteExecutor`], the sole I/O boundary: submission, state queries,
//! log tailing and garbage collection are all plain commands whose output
//! the rest of the crate treats as pure input. Tests substitute a scripted
//! implementation to drive the pipeline without a cluster.

use async_trait::async_trait;

use crate::error::AdapterResult;

/// Captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Build an output pair, trimming trailing whitespace the way a
    /// shell capture would.
    pub fn new(stdout: impl AsRef<str>, stderr: impl AsRef<str>) -> Self {
        Self {
            stdout: stdout.as_ref().trim_end().to_string(),
            stderr: stderr.as_ref().trim_end().to_string(),
        }
    }
}

/// Runs a command string on the remote cluster host.
///
/// One transport session is established per call; sessions are not pooled.
/// A connection, authentication or exec failure surfaces as
/// [`AdapterError::Transport`](crate::error::AdapterError::Transport),
/// never as a silent empty result.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Execute `cmd`, optionally feeding `stdin`, and capture the decoded,
    /// trailing-whitespace-trimmed stdout/stderr.
    async fn execute(&self, cmd: &str, stdin: Option<&str>) -> AdapterResult<CommandOutput>;
}
