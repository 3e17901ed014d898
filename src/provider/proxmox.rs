//! Proxmox VE backend: VMs on a virtualization host, no cloud load balancer.
//!
//! The externally stable address is the *configured* virtual IP, claimed by
//! ARP failover on the control-plane nodes; it is known before provisioning
//! and therefore baked into the initial TLS SAN list. Remote commands go
//! over the sync-direct SSH channel.

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::{Backend, ClusterSpec, Fleet, TfVars, Workspace};
use crate::provider::{fleet_from_outputs, require_credential_env, require_tools, Provider};
use crate::remote::ssh::SshChannel;
use crate::remote::CommandChannel;
use crate::runner::CommandRunner;
use crate::terraform::Terraform;
use crate::{Error, Result};

/// Proxmox VE infrastructure provider
pub struct ProxmoxProvider {
    runner: Arc<dyn CommandRunner>,
    terraform: Terraform,
    channel: SshChannel,
    workspace: Workspace,
}

impl ProxmoxProvider {
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
impl Provider for ProxmoxProvider {
    fn backend(&self) -> Backend {
        Backend::Proxmox
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

        let proxmox = spec
            .proxmox
            .as_ref()
            .ok_or_else(|| Error::precondition("backend 'proxmox' requires the proxmox section"))?;
        if proxmox.node.is_empty() {
            return Err(Error::precondition("proxmox.node must be set"));
        }

        require_credential_env(
            Backend::Proxmox,
            &["PROXMOX_VE_API_TOKEN", "PROXMOX_VE_USERNAME"],
        )?;
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
        let proxmox = spec
            .proxmox
            .as_ref()
            .ok_or_else(|| Error::precondition("backend 'proxmox' requires the proxmox section"))?;
        let mut vars = TfVars::new();
        vars.insert("proxmox_node".to_string(), proxmox.node.clone());
        vars.insert("enable_api_lb".to_string(), "false".to_string());
        if let Some(vip) = spec.virtual_ip() {
            vars.insert("virtual_ip".to_string(), vip.to_string());
        }
        Ok(vars)
    }

    async fn fleet(&self, spec: &ClusterSpec) -> Result<Fleet> {
        let dir = self.workspace.cluster_dir(&spec.name)?;
        let tf = &self.terraform;
        let cp_ips = tf.output_list(&dir, "control_plane_ips").await?;
        let worker_ips = tf.output_list(&dir, "worker_ips").await?;
        fleet_from_outputs(cp_ips.clone(), cp_ips, worker_ips.clone(), worker_ips)
    }

    async fn load_balancer_address(&self, _spec: &ClusterSpec) -> Result<Option<String>> {
        // No cloud LB exists on this backend; the virtual IP (if configured)
        // is picked up by the shared endpoint-candidate priority.
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ProxmoxSpec;
    use crate::runner::MockCommandRunner;

    fn proxmox_spec(vip: Option<&str>) -> ClusterSpec {
        ClusterSpec {
            name: "lab".to_string(),
            backend: Backend::Proxmox,
            control_planes: 1,
            workers: 0,
            network_cidr: "10.42.0.0/16".to_string(),
            kubernetes_version: "v1.31.4+k3s1".to_string(),
            ssh_key_path: None,
            aws: None,
            hcloud: None,
            proxmox: Some(ProxmoxSpec {
                node: "pve1".to_string(),
                virtual_ip: vip.map(|v| v.to_string()),
            }),
        }
    }

    fn provider() -> (ProxmoxProvider, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(tmp.path());
        let provider = ProxmoxProvider::new(
            &proxmox_spec(None),
            workspace,
            Arc::new(MockCommandRunner::new()),
        );
        (provider, tmp)
    }

    #[tokio::test]
    async fn endpoint_candidate_is_the_configured_virtual_ip() {
        let (p, _tmp) = provider();
        let candidate = p
            .endpoint_candidate(&proxmox_spec(Some("10.0.0.100")))
            .await
            .unwrap();
        assert_eq!(candidate.unwrap().host, "10.0.0.100");
    }

    #[tokio::test]
    async fn no_virtual_ip_means_no_candidate() {
        let (p, _tmp) = provider();
        let candidate = p.endpoint_candidate(&proxmox_spec(None)).await.unwrap();
        assert!(candidate.is_none());
    }

    #[test]
    fn tf_vars_disable_the_lb_and_carry_the_vip() {
        let (p, _tmp) = provider();
        let vars = p.tf_vars(&proxmox_spec(Some("10.0.0.100"))).unwrap();
        assert_eq!(vars["enable_api_lb"], "false");
        assert_eq!(vars["virtual_ip"], "10.0.0.100");
        assert_eq!(vars["proxmox_node"], "pve1");
    }
}
