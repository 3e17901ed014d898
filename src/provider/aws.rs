//! AWS backend: EC2 instances behind a network load balancer.
//!
//! Remote commands run through the async-poll SSM channel, so no inbound
//! SSH access to the nodes is required. Node references carry the EC2
//! instance id (the SSM target) plus the instance's address; the endpoint
//! candidate is the NLB's DNS name from the provisioning outputs.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::{Backend, ClusterSpec, Fleet, TfVars, Workspace};
use crate::provider::{fleet_from_outputs, require_credential_env, require_tools, Provider};
use crate::remote::ssm::SsmChannel;
use crate::remote::CommandChannel;
use crate::runner::CommandRunner;
use crate::terraform::Terraform;
use crate::{Error, Result};

/// AWS infrastructure provider
pub struct AwsProvider {
    runner: Arc<dyn CommandRunner>,
    terraform: Terraform,
    channel: SsmChannel,
    workspace: Workspace,
}

impl std::fmt::Debug for AwsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsProvider")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

impl AwsProvider {
    /// Create a provider; the spec must carry the `aws` section
    pub fn new(
        spec: &ClusterSpec,
        workspace: Workspace,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let aws = spec
            .aws
            .as_ref()
            .ok_or_else(|| Error::precondition("backend 'aws' requires the aws section"))?;
        Ok(Self {
            terraform: Terraform::new(runner.clone()),
            channel: SsmChannel::new(runner.clone(), &aws.region),
            runner,
            workspace,
        })
    }
}

#[async_trait]
impl Provider for AwsProvider {
    fn backend(&self) -> Backend {
        Backend::Aws
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

    async fn validate_config(&self, spec: &ClusterSpec) -> Result<()> {
        spec.validate_shape()?;

        let aws = spec
            .aws
            .as_ref()
            .ok_or_else(|| Error::precondition("backend 'aws' requires the aws section"))?;
        if aws.region.is_empty() {
            return Err(Error::precondition("aws.region must be set"));
        }

        require_credential_env(Backend::Aws, &["AWS_ACCESS_KEY_ID", "AWS_PROFILE"])?;
        require_tools(
            self.runner.as_ref(),
            &[
                ("terraform", "https://developer.hashicorp.com/terraform/install"),
                ("aws", "https://docs.aws.amazon.com/cli/latest/userguide/getting-started-install.html"),
            ],
        )
        .await
    }

    fn tf_vars(&self, spec: &ClusterSpec) -> Result<TfVars> {
        let aws = spec
            .aws
            .as_ref()
            .ok_or_else(|| Error::precondition("backend 'aws' requires the aws section"))?;
        let mut vars = TfVars::new();
        vars.insert("region".to_string(), aws.region.clone());
        vars.insert("instance_type".to_string(), aws.instance_type.clone());
        vars.insert("enable_api_lb".to_string(), "true".to_string());
        Ok(vars)
    }

    async fn fleet(&self, spec: &ClusterSpec) -> Result<Fleet> {
        let dir = self.workspace.cluster_dir(&spec.name)?;
        let tf = &self.terraform;
        let cp_ids = tf.output_list(&dir, "control_plane_ids").await?;
        let cp_ips = tf.output_list(&dir, "control_plane_ips").await?;
        let worker_ids = tf.output_list(&dir, "worker_ids").await?;
        let worker_ips = tf.output_list(&dir, "worker_ips").await?;
        fleet_from_outputs(cp_ids, cp_ips, worker_ids, worker_ips)
    }

    async fn load_balancer_address(&self, spec: &ClusterSpec) -> Result<Option<String>> {
        let dir = self.workspace.cluster_dir(&spec.name)?;
        let dns = self.terraform.output_raw(&dir, "api_lb_dns").await?;
        if dns.is_empty() {
            return Ok(None);
        }
        Ok(Some(dns))
    }
}
