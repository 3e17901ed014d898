//! Remote command channels.
//!
//! A [`CommandChannel`] submits a script to one remote node and reports
//! completion. Two variants exist: async-poll ([`ssm::SsmChannel`]), where
//! submit returns a handle that is polled to a terminal outcome, and
//! sync-direct ([`ssh::SshChannel`]), where submit blocks until the remote
//! process exits. Fleet-wide dispatch lives here too: fire-many,
//! collect-many, isolate failures.

pub mod ssh;
pub mod ssm;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cluster::NodeRef;
use crate::poll::PollPolicy;
use crate::Result;

/// Per-target status of a submitted remote command.
///
/// `Pending` is the only non-terminal state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Still running (or not yet visible to the status API)
    Pending,
    /// Exited successfully
    Success,
    /// Exited with a failure
    Failed,
    /// Did not reach a terminal state before the deadline
    TimedOut,
}

impl CommandOutcome {
    /// Whether this outcome will never change again
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandOutcome::Pending)
    }
}

/// Handle to a submitted remote command
#[derive(Clone, Debug)]
pub struct CommandHandle {
    /// The node the command was submitted to
    pub node: NodeRef,
    /// Backend-assigned command identifier
    pub command_id: String,
    /// Terminal outcome recorded at submit time by sync-direct channels
    settled: Option<CommandOutcome>,
}

impl CommandHandle {
    /// Handle for an async command that must be polled
    pub fn pending(node: NodeRef, command_id: impl Into<String>) -> Self {
        Self {
            node,
            command_id: command_id.into(),
            settled: None,
        }
    }

    /// Handle for a command whose outcome was known at submit time
    pub fn settled(node: NodeRef, outcome: CommandOutcome) -> Self {
        Self {
            node,
            command_id: String::new(),
            settled: Some(outcome),
        }
    }

    /// The outcome recorded at submit time, if any
    pub fn settled_outcome(&self) -> Option<CommandOutcome> {
        self.settled
    }
}

/// Submits scripts to remote nodes and reports completion
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Submit a script to a node.
    ///
    /// Async-poll channels return immediately with a pollable handle;
    /// sync-direct channels block until the remote process exits and return
    /// a settled handle.
    async fn submit(&self, target: &NodeRef, script: &str) -> Result<CommandHandle>;

    /// Query the current outcome of a submitted command
    async fn poll(&self, handle: &CommandHandle) -> Result<CommandOutcome>;

    /// Run a script and return its captured stdout; used for simple read
    /// operations such as fetching a file's contents
    async fn capture(&self, target: &NodeRef, script: &str) -> Result<String>;

    /// Poll until a terminal outcome or the policy deadline.
    ///
    /// Transient poll errors are retried, not treated as command failure.
    /// A deadline expiry yields [`CommandOutcome::TimedOut`].
    async fn wait(&self, handle: &CommandHandle, policy: &PollPolicy) -> Result<CommandOutcome> {
        let deadline = Instant::now() + policy.timeout;
        loop {
            match self.poll(handle).await {
                Ok(outcome) if outcome.is_terminal() => return Ok(outcome),
                Ok(_) => {
                    debug!(node = %handle.node.id, command = %handle.command_id, "command still pending");
                }
                Err(e) => {
                    warn!(
                        node = %handle.node.id,
                        command = %handle.command_id,
                        error = %e,
                        "transient error polling command status, retrying"
                    );
                }
            }
            if Instant::now() + policy.interval > deadline {
                return Ok(CommandOutcome::TimedOut);
            }
            tokio::time::sleep(policy.interval).await;
        }
    }
}

/// Result of dispatching one command to one node
#[derive(Debug)]
pub struct Dispatch {
    /// The target node
    pub node: NodeRef,
    /// The command outcome, or the submit/wait error for this node
    pub result: Result<CommandOutcome>,
}

impl Dispatch {
    /// Whether this node's command succeeded
    pub fn succeeded(&self) -> bool {
        matches!(self.result, Ok(CommandOutcome::Success))
    }
}

/// Dispatch one script to many nodes, isolating per-node failures.
///
/// Every target gets a submit attempt regardless of how the others fare; a
/// failing node is recorded and logged but never aborts dispatch to the
/// rest of the fleet. With `wait_policy` set, each submission is driven to a
/// terminal outcome; without it, dispatch returns as soon as every submit
/// has been attempted.
pub async fn dispatch_fleet(
    channel: &dyn CommandChannel,
    targets: &[&NodeRef],
    script: &str,
    wait_policy: Option<&PollPolicy>,
) -> Vec<Dispatch> {
    let submissions = targets.iter().map(|node| async move {
        let result = match channel.submit(node, script).await {
            Ok(handle) => match wait_policy {
                Some(policy) => channel.wait(&handle, policy).await,
                None => Ok(handle.settled_outcome().unwrap_or(CommandOutcome::Pending)),
            },
            Err(e) => Err(e),
        };

        match &result {
            Ok(outcome) if outcome.is_terminal() && *outcome != CommandOutcome::Success => {
                warn!(node = %node.id, ?outcome, "remote command did not succeed");
            }
            Err(e) => {
                warn!(node = %node.id, error = %e, "remote command dispatch failed");
            }
            _ => {}
        }

        Dispatch {
            node: (*node).clone(),
            result,
        }
    });

    join_all(submissions).await
}
