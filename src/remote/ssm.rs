//! Async-poll channel over the AWS SSM send-command API.
//!
//! `submit` returns as soon as the service accepts the command; status is
//! queried per (command id, instance id) with `get-command-invocation`.
//! Right after submit the invocation may not be visible yet
//! (`InvocationDoesNotExist`); that is a transient poll error, which
//! [`CommandChannel::wait`] retries rather than treating as failure.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cluster::NodeRef;
use crate::remote::{CommandChannel, CommandHandle, CommandOutcome};
use crate::runner::CommandRunner;
use crate::{Error, Result};

/// Async-poll remote command channel for SSM-managed instances
#[derive(Clone)]
pub struct SsmChannel {
    runner: Arc<dyn CommandRunner>,
    region: String,
}

impl SsmChannel {
    /// Create a channel for the given AWS region
    pub fn new(runner: Arc<dyn CommandRunner>, region: impl Into<String>) -> Self {
        Self {
            runner,
            region: region.into(),
        }
    }

    async fn invocation_field(&self, handle: &CommandHandle, field: &str) -> Result<String> {
        let out = self
            .runner
            .run(
                "aws",
                &[
                    "ssm",
                    "get-command-invocation",
                    "--command-id",
                    &handle.command_id,
                    "--instance-id",
                    &handle.node.id,
                    "--region",
                    &self.region,
                    "--query",
                    field,
                    "--output",
                    "text",
                ],
            )
            .await?;
        if !out.success() {
            return Err(Error::remote(&handle.node.id, out.stderr.trim().to_string()));
        }
        Ok(out.stdout.trim().to_string())
    }
}

#[async_trait]
impl CommandChannel for SsmChannel {
    async fn submit(&self, target: &NodeRef, script: &str) -> Result<CommandHandle> {
        let parameters = serde_json::json!({ "commands": [script] }).to_string();
        let out = self
            .runner
            .run(
                "aws",
                &[
                    "ssm",
                    "send-command",
                    "--instance-ids",
                    &target.id,
                    "--document-name",
                    "AWS-RunShellScript",
                    "--parameters",
                    &parameters,
                    "--region",
                    &self.region,
                    "--query",
                    "Command.CommandId",
                    "--output",
                    "text",
                ],
            )
            .await?;
        if !out.success() {
            return Err(Error::remote(&target.id, out.stderr.trim().to_string()));
        }

        let command_id = out.stdout.trim().to_string();
        debug!(node = %target.id, command = %command_id, "submitted remote command");
        Ok(CommandHandle::pending(target.clone(), command_id))
    }

    async fn poll(&self, handle: &CommandHandle) -> Result<CommandOutcome> {
        let status = self.invocation_field(handle, "Status").await?;
        Ok(match status.as_str() {
            "Pending" | "InProgress" | "Delayed" => CommandOutcome::Pending,
            "Success" => CommandOutcome::Success,
            "TimedOut" => CommandOutcome::TimedOut,
            // Cancelled/Cancelling/Failed and anything the service adds later
            _ => CommandOutcome::Failed,
        })
    }

    async fn capture(&self, target: &NodeRef, script: &str) -> Result<String> {
        let handle = self.submit(target, script).await?;
        let outcome = self
            .wait(&handle, &crate::poll::PollPolicy::default())
            .await?;
        if outcome != CommandOutcome::Success {
            return Err(Error::remote(
                &target.id,
                format!("capture command finished with {:?}", outcome),
            ));
        }
        self.invocation_field(&handle, "StandardOutputContent").await
    }
}
