//! Azure backend placeholder.
//!
//! Azure stays in the provider registry so callers can enumerate and invoke
//! it uniformly, but every hook returns the same "not implemented" outcome.
//! When it lands it will follow the aws shape: managed instances behind a
//! load balancer with an async-poll execution channel.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::{Backend, ClusterSpec, Fleet, TfVars, Workspace};
use crate::provider::Provider;
use crate::remote::ssh::SshChannel;
use crate::remote::CommandChannel;
use crate::runner::CommandRunner;
use crate::terraform::Terraform;
use crate::{Error, Result};

/// Azure infrastructure provider (not yet implemented)
pub struct AzureProvider {
    runner: Arc<dyn CommandRunner>,
    terraform: Terraform,
    channel: SshChannel,
    workspace: Workspace,
}

impl AzureProvider {
    /// Create the placeholder provider
    pub fn new(workspace: Workspace, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            terraform: Terraform::new(runner.clone()),
            channel: SshChannel::new(runner.clone(), "root"),
            runner,
            workspace,
        }
    }

    fn unimplemented<T>(&self, operation: &str) -> Result<T> {
        Err(Error::unimplemented(Backend::Azure.to_string(), operation))
    }
}

#[async_trait]
impl Provider for AzureProvider {
    fn backend(&self) -> Backend {
        Backend::Azure
    }

    fn runner(&self) -> Arc<dyn CommandRunner> {
        self.runner.clone()
    }

    fn channel(&self) -> &dyn CommandChannel {
        &self.channel
    }

    fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    fn terraform(&self) -> &Terraform {
        &self.terraform
    }

    async fn validate_config(&self, _spec: &ClusterSpec) -> Result<()> {
        self.unimplemented("validate_config")
    }

    fn tf_vars(&self, _spec: &ClusterSpec) -> Result<TfVars> {
        self.unimplemented("tf_vars")
    }

    async fn fleet(&self, _spec: &ClusterSpec) -> Result<Fleet> {
        self.unimplemented("fleet")
    }

    async fn load_balancer_address(&self, _spec: &ClusterSpec) -> Result<Option<String>> {
        self.unimplemented("load_balancer_address")
    }

    async fn provision(&self, _spec: &ClusterSpec) -> Result<()> {
        self.unimplemented("provision")
    }

    async fn destroy(&self, _spec: &ClusterSpec) -> Result<()> {
        self.unimplemented("destroy")
    }

    async fn fetch_raw_kubeconfig(&self, _spec: &ClusterSpec) -> Result<String> {
        self.unimplemented("fetch_raw_kubeconfig")
    }
}
