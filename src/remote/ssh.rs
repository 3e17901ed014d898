//! Sync-direct channel over an SSH client subprocess.
//!
//! `submit` blocks until the remote process exits (bounded by the connect
//! timeout for unreachable hosts) and the outcome is derived from the exit
//! status. Used by backends that expose no asynchronous execution service,
//! and for simple read operations like fetching a file's contents.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cluster::NodeRef;
use crate::remote::{CommandChannel, CommandHandle, CommandOutcome};
use crate::runner::CommandRunner;
use crate::{Error, Result};

/// Seconds ssh waits for the TCP connection before giving up
const CONNECT_TIMEOUT_SECS: u32 = 10;

/// Sync-direct remote command channel over ssh
#[derive(Clone)]
pub struct SshChannel {
    runner: Arc<dyn CommandRunner>,
    user: String,
    key_path: Option<PathBuf>,
}

impl SshChannel {
    /// Create a channel connecting as the given user
    pub fn new(runner: Arc<dyn CommandRunner>, user: impl Into<String>) -> Self {
        Self {
            runner,
            user: user.into(),
            key_path: None,
        }
    }

    /// Use an explicit private key instead of the agent
    pub fn with_key(mut self, key_path: Option<PathBuf>) -> Self {
        self.key_path = key_path;
        self
    }

    async fn run_script(&self, target: &NodeRef, script: &str) -> Result<crate::runner::RunOutput> {
        let destination = format!("{}@{}", self.user, target.address);
        let connect_timeout = format!("ConnectTimeout={}", CONNECT_TIMEOUT_SECS);

        let mut args: Vec<&str> = vec![
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            "-o",
            &connect_timeout,
        ];
        let key;
        if let Some(path) = &self.key_path {
            key = path.display().to_string();
            args.push("-i");
            args.push(&key);
        }
        args.push(&destination);
        args.push("bash -s");

        debug!(node = %target.id, address = %target.address, "running script over ssh");
        self.runner.run_with_stdin("ssh", &args, script).await
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    async fn submit(&self, target: &NodeRef, script: &str) -> Result<CommandHandle> {
        let out = self.run_script(target, script).await?;
        let outcome = if out.success() {
            CommandOutcome::Success
        } else {
            CommandOutcome::Failed
        };
        if outcome == CommandOutcome::Failed {
            debug!(
                node = %target.id,
                code = out.code,
                stderr = %out.stderr.trim(),
                "remote script exited nonzero"
            );
        }
        Ok(CommandHandle::settled(target.clone(), outcome))
    }

    async fn poll(&self, handle: &CommandHandle) -> Result<CommandOutcome> {
        // Sync-direct commands settle at submit time; there is nothing to query.
        Ok(handle.settled_outcome().unwrap_or(CommandOutcome::Pending))
    }

    async fn capture(&self, target: &NodeRef, script: &str) -> Result<String> {
        let out = self.run_script(target, script).await?;
        if !out.success() {
            return Err(Error::remote(
                &target.id,
                format!("exit {}: {}", out.code, out.stderr.trim()),
            ));
        }
        Ok(out.stdout)
    }
}
