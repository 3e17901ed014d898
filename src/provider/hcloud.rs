//! Hetzner Cloud backend: servers fronted by a cloud load balancer.
//!
//! The hcloud API is token-authenticated; the provisioning templates read
//! `HCLOUD_TOKEN` directly. Hetzner exposes no asynchronous remote
//! execution service, so commands go over the sync-direct SSH channel and
//! node references use the server's public IPv4 as both id and address.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::{Backend, ClusterSpec, Fleet, TfVars, Workspace};
use crate::provider::{fleet_from_outputs, require_credential_env, require_tools, Provider};
use crate::remote::ssh::SshChannel;
use crate::remote::CommandChannel;
use crate::runner::CommandRunner;
use crate::terraform::Terraform;
use crate::{Error, Result};

/// Hetzner Cloud infrastructure provider
pub struct HcloudProvider {
    runner: Arc<dyn CommandRunner>,
    terraform: Terraform,
    channel: SshChannel,
    workspace: Workspace,
}

impl HcloudProvider {
    /// Create a provider for the given spec
    pub fn new(spec: &ClusterSpec, workspace: Workspace, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            terraform: Terraform::new(runner.clone()),
            channel: SshChannel::new(runner.clone(), "root").with_key(spec.ssh_key_path.clone()),
            runner,
            workspace,
        }
    }
}

#[async_trait]
impl Provider for HcloudProvider {
    fn backend(&self) -> Backend {
        Backend::Hcloud
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

        let hcloud = spec
            .hcloud
            .as_ref()
            .ok_or_else(|| Error::precondition("backend 'hcloud' requires the hcloud section"))?;
        if hcloud.location.is_empty() {
            return Err(Error::precondition("hcloud.location must be set"));
        }

        require_credential_env(Backend::Hcloud, &["HCLOUD_TOKEN"])?;
        require_tools(
            self.runner.as_ref(),
            &[
                ("terraform", "https://developer.hashicorp.com/terraform/install"),
                ("ssh", "install the openssh client"),
            ],
        )
        .await
    }

    fn tf_vars(&self, spec: &ClusterSpec) -> Result<TfVars> {
        let hcloud = spec
            .hcloud
            .as_ref()
            .ok_or_else(|| Error::precondition("backend 'hcloud' requires the hcloud section"))?;
        let mut vars = TfVars::new();
        vars.insert("location".to_string(), hcloud.location.clone());
        vars.insert("server_type".to_string(), hcloud.server_type.clone());
        vars.insert("enable_api_lb".to_string(), "true".to_string());
        Ok(vars)
    }

    async fn fleet(&self, spec: &ClusterSpec) -> Result<Fleet> {
        let dir = self.workspace.cluster_dir(&spec.name)?;
        let tf = &self.terraform;
        let cp_ips = tf.output_list(&dir, "control_plane_ips").await?;
        let worker_ips = tf.output_list(&dir, "worker_ips").await?;
        // The server address doubles as the channel target id.
        fleet_from_outputs(cp_ips.clone(), cp_ips, worker_ips.clone(), worker_ips)
    }

    async fn load_balancer_address(&self, spec: &ClusterSpec) -> Result<Option<String>> {
        let dir = self.workspace.cluster_dir(&spec.name)?;
        let ipv4 = self.terraform.output_raw(&dir, "api_lb_ipv4").await?;
        if ipv4.is_empty() {
            return Ok(None);
        }
        Ok(Some(ipv4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::HcloudSpec;
    use crate::runner::{ok_output, MockCommandRunner};

    fn hcloud_spec() -> ClusterSpec {
        ClusterSpec {
            name: "prod-eu".to_string(),
            backend: Backend::Hcloud,
            control_planes: 3,
            workers: 1,
            network_cidr: "10.42.0.0/16".to_string(),
            kubernetes_version: "v1.31.4+k3s1".to_string(),
            ssh_key_path: None,
            aws: None,
            hcloud: Some(HcloudSpec {
                location: "fsn1".to_string(),
                server_type: "cx32".to_string(),
            }),
            proxmox: None,
        }
    }

    fn provider_with(mock: MockCommandRunner) -> (HcloudProvider, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path());
        let provider = HcloudProvider::new(&hcloud_spec(), workspace, Arc::new(mock));
        (provider, tmp)
    }

    #[tokio::test]
    async fn fleet_uses_addresses_as_node_ids() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|_, args| args.contains(&"control_plane_ips"))
            .returning(|_, _| Ok(ok_output(r#"["192.0.2.1","192.0.2.2","192.0.2.3"]"#)));
        mock.expect_run()
            .withf(|_, args| args.contains(&"worker_ips"))
            .returning(|_, _| Ok(ok_output(r#"["192.0.2.10"]"#)));

        let (provider, _tmp) = provider_with(mock);
        let fleet = provider.fleet(&hcloud_spec()).await.unwrap();

        assert_eq!(fleet.leader().id, "192.0.2.1");
        assert_eq!(fleet.leader().address, "192.0.2.1");
        assert_eq!(fleet.workers().len(), 1);
    }

    #[tokio::test]
    async fn endpoint_candidate_is_the_lb_ipv4() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|_, args| args.contains(&"api_lb_ipv4"))
            .returning(|_, _| Ok(ok_output("198.51.100.20\n")));

        let (provider, _tmp) = provider_with(mock);
        let candidate = provider.endpoint_candidate(&hcloud_spec()).await.unwrap();
        assert_eq!(candidate.unwrap().host, "198.51.100.20");
    }

    #[test]
    fn tf_vars_carry_location_and_server_type() {
        let (provider, _tmp) = provider_with(MockCommandRunner::new());
        let vars = provider.tf_vars(&hcloud_spec()).unwrap();
        assert_eq!(vars["location"], "fsn1");
        assert_eq!(vars["server_type"], "cx32");
        assert_eq!(vars["enable_api_lb"], "true");
    }

    #[tokio::test]
    async fn missing_hcloud_section_is_a_precondition_error() {
        let (provider, _tmp) = provider_with(MockCommandRunner::new());
        let mut spec = hcloud_spec();
        spec.hcloud = None;
        let err = provider.validate_config(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
