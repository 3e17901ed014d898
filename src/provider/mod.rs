//! Infrastructure provider abstraction layer.
//!
//! A [`Provider`] drives one backend's provisioning and command-execution
//! primitives: it validates a [`ClusterSpec`] offline, owns the declarative
//! provisioning lifecycle, and exposes fleet metadata (node references,
//! endpoint candidates) to the phases above it. Variants differ only in how
//! node references and the endpoint candidate are obtained from backend
//! outputs, and which remote command channel they use; everything else is
//! shared default behavior.
//!
//! # Supported backends
//!
//! - [`AwsProvider`] - EC2 behind an NLB, remote commands via SSM
//! - [`HcloudProvider`] - Hetzner Cloud servers behind an LB, SSH
//! - [`ProxmoxProvider`] - Proxmox VE VMs with an ARP virtual IP, SSH
//! - [`AzureProvider`] - registered but not yet implemented

mod aws;
mod azure;
mod hcloud;
mod proxmox;

pub use aws::AwsProvider;
pub use azure::AzureProvider;
pub use hcloud::HcloudProvider;
pub use proxmox::ProxmoxProvider;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{info, warn};

use crate::cluster::{Backend, ClusterSpec, Endpoint, Fleet, TfVars, Workspace};
use crate::poll::{retry_backoff, BackoffPolicy};
use crate::remote::CommandChannel;
use crate::runner::CommandRunner;
use crate::terraform::Terraform;
use crate::{Error, Result};

/// Path of the installer-written credential bundle on the leader
pub const KUBECONFIG_REMOTE_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Infrastructure provider capability set.
///
/// Backend variants implement the hooks (`validate_config`, `tf_vars`,
/// `fleet`, `load_balancer_address`, accessors); the provisioning lifecycle,
/// endpoint-candidate priority, and credential fetch are shared defaults.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Backend identity
    fn backend(&self) -> Backend;

    /// The process boundary all local subcommands go through
    fn runner(&self) -> Arc<dyn CommandRunner>;

    /// The remote command channel for this backend's nodes
    fn channel(&self) -> &dyn CommandChannel;

    /// On-disk workspace for provisioning state
    fn workspace(&self) -> &Workspace;

    /// Driver for the declarative provisioning backend
    fn terraform(&self) -> &Terraform;

    /// Validate the spec and local environment without contacting the
    /// backend: spec shape, required credentials, required tooling.
    async fn validate_config(&self, spec: &ClusterSpec) -> Result<()>;

    /// Backend-specific provisioning variables layered over the shared set
    fn tf_vars(&self, spec: &ClusterSpec) -> Result<TfVars>;

    /// Fleet metadata from provisioning outputs
    async fn fleet(&self, spec: &ClusterSpec) -> Result<Fleet>;

    /// Provisioned load-balancer address, if this backend creates one
    async fn load_balancer_address(&self, spec: &ClusterSpec) -> Result<Option<String>>;

    /// Run the declarative init/apply sequence for this cluster.
    ///
    /// Re-entrant: the working directory, join token, and startup scripts
    /// persist across invocations, so a failed apply can be retried.
    async fn provision(&self, spec: &ClusterSpec) -> Result<()> {
        let dir = self.workspace().cluster_dir(&spec.name)?;
        let token = ensure_join_token(&dir)?;

        let scripts = render_startup_scripts(spec, &token)?;
        let mut vars = base_tf_vars(spec);
        for (name, content) in [
            ("leader_init_script", &scripts.leader_init),
            ("server_join_script", &scripts.server_join),
            ("agent_join_script", &scripts.agent_join),
        ] {
            let path = dir.join(format!("{}.sh", name.replace('_', "-")));
            std::fs::write(&path, content)?;
            vars.insert(name.to_string(), path.display().to_string());
        }
        vars.extend(self.tf_vars(spec)?);

        let tf = self.terraform();
        tf.write_vars(&dir, &vars).await?;
        tf.init(&dir, &self.workspace().module_dir(self.backend()))
            .await?;
        tf.apply(&dir).await?;
        Ok(())
    }

    /// Destroy all provisioned resources for this cluster
    async fn destroy(&self, spec: &ClusterSpec) -> Result<()> {
        if !self.workspace().cluster_dir_exists(&spec.name) {
            return Err(Error::precondition(format!(
                "no provisioning state for cluster '{}'",
                spec.name
            )));
        }
        let dir = self.workspace().cluster_dir(&spec.name)?;
        self.terraform().destroy(&dir).await
    }

    /// The externally-derived endpoint candidate, if the topology has one.
    ///
    /// Priority: a provisioned load-balancer address, then a configured
    /// virtual IP. Exactly one candidate is selected per call; given the
    /// same provisioning outputs the result is deterministic.
    async fn endpoint_candidate(&self, spec: &ClusterSpec) -> Result<Option<Endpoint>> {
        match self.load_balancer_address(spec).await {
            Ok(Some(host)) => return Ok(Some(Endpoint::new(host))),
            Ok(None) => {}
            Err(e) => match spec.virtual_ip() {
                Some(vip) => {
                    warn!(error = %e, "load balancer query failed, falling back to virtual IP");
                    return Ok(Some(Endpoint::new(vip)));
                }
                None => return Err(e),
            },
        }
        Ok(spec.virtual_ip().map(Endpoint::new))
    }

    /// Fetch the raw credential bundle the installer wrote on the leader.
    ///
    /// Retries with backoff: the bundle appears only once the installer has
    /// finished bringing the leader up, which races the end of provisioning.
    async fn fetch_raw_kubeconfig(&self, spec: &ClusterSpec) -> Result<String> {
        let fleet = self.fleet(spec).await?;
        let leader = fleet.leader().clone();
        let channel = self.channel();
        let script = format!("cat {}", KUBECONFIG_REMOTE_PATH);

        let raw = retry_backoff(
            &BackoffPolicy::with_max_attempts(6),
            "fetch_raw_kubeconfig",
            || channel.capture(&leader, &script),
        )
        .await?;

        if !raw.contains("server:") {
            return Err(Error::remote(
                &leader.id,
                "fetched credential bundle has no server line",
            ));
        }
        Ok(raw)
    }
}

/// Create a provider instance for the spec's backend identity.
///
/// Every backend is registered here, including the not-yet-implemented one,
/// so callers can enumerate and invoke them uniformly.
pub fn create_provider(
    spec: &ClusterSpec,
    workspace: Workspace,
    runner: Arc<dyn CommandRunner>,
) -> Result<Box<dyn Provider>> {
    match spec.backend {
        Backend::Aws => Ok(Box::new(AwsProvider::new(spec, workspace, runner)?)),
        Backend::Hcloud => Ok(Box::new(HcloudProvider::new(spec, workspace, runner))),
        Backend::Proxmox => Ok(Box::new(ProxmoxProvider::new(spec, workspace, runner))),
        Backend::Azure => Ok(Box::new(AzureProvider::new(workspace, runner))),
    }
}

/// Shared provisioning variables every backend consumes
fn base_tf_vars(spec: &ClusterSpec) -> TfVars {
    let mut vars = TfVars::new();
    vars.insert("cluster_name".to_string(), spec.name.clone());
    vars.insert(
        "control_plane_count".to_string(),
        spec.control_planes.to_string(),
    );
    vars.insert("worker_count".to_string(), spec.workers.to_string());
    vars.insert("network_cidr".to_string(), spec.network_cidr.clone());
    vars.insert(
        "kubernetes_version".to_string(),
        spec.kubernetes_version.clone(),
    );
    vars
}

/// Read or create the cluster join token in the state directory
fn ensure_join_token(dir: &Path) -> Result<String> {
    let path = dir.join("join-token");
    if path.exists() {
        let token = std::fs::read_to_string(&path)?;
        return Ok(token.trim().to_string());
    }

    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    std::fs::write(&path, &token)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), "generated cluster join token");
    Ok(token)
}

/// Rendered startup scripts for the three node flavors.
///
/// The join scripts reference `${leader_address}`, which the backend's
/// templates substitute once the leader's address exists.
pub struct StartupScripts {
    /// First control-plane node; initialises the cluster
    pub leader_init: String,
    /// Additional control-plane nodes joining the leader
    pub server_join: String,
    /// Worker nodes joining the leader
    pub agent_join: String,
}

const LEADER_INIT_TEMPLATE: &str = r#"#!/bin/bash
set -euo pipefail
curl -sfL https://get.k3s.io | INSTALL_K3S_VERSION='{{ version }}' sh -s - server \
  --cluster-init \
  --token '{{ token }}' \
  --cluster-cidr '{{ cidr }}' \
  --write-kubeconfig-mode 0600{% for san in tls_sans %} \
  --tls-san '{{ san }}'{% endfor %}
"#;

const SERVER_JOIN_TEMPLATE: &str = r#"#!/bin/bash
set -euo pipefail
curl -sfL https://get.k3s.io | INSTALL_K3S_VERSION='{{ version }}' sh -s - server \
  --server 'https://${leader_address}:6443' \
  --token '{{ token }}' \
  --cluster-cidr '{{ cidr }}'{% for san in tls_sans %} \
  --tls-san '{{ san }}'{% endfor %}
"#;

const AGENT_JOIN_TEMPLATE: &str = r#"#!/bin/bash
set -euo pipefail
curl -sfL https://get.k3s.io | INSTALL_K3S_VERSION='{{ version }}' sh -s - agent \
  --server 'https://${leader_address}:6443' \
  --token '{{ token }}'
"#;

/// Render the installer startup scripts for a spec.
///
/// The initial TLS SAN list carries only addresses known before
/// provisioning (a configured virtual IP); addresses that exist only after
/// provisioning are added by the identity-convergence phase.
pub fn render_startup_scripts(spec: &ClusterSpec, token: &str) -> Result<StartupScripts> {
    let mut env = minijinja::Environment::new();
    env.add_template("leader", LEADER_INIT_TEMPLATE)
        .and_then(|_| env.add_template("server", SERVER_JOIN_TEMPLATE))
        .and_then(|_| env.add_template("agent", AGENT_JOIN_TEMPLATE))
        .map_err(|e| Error::serialization(format!("invalid startup template: {}", e)))?;

    let tls_sans: Vec<&str> = spec.virtual_ip().into_iter().collect();
    let ctx = minijinja::context! {
        version => spec.kubernetes_version,
        token => token,
        cidr => spec.network_cidr,
        tls_sans => tls_sans,
    };

    let render = |name: &str| -> Result<String> {
        env.get_template(name)
            .expect("template was just added")
            .render(&ctx)
            .map_err(|e| Error::serialization(format!("failed to render {} script: {}", name, e)))
    };

    Ok(StartupScripts {
        leader_init: render("leader")?,
        server_join: render("server")?,
        agent_join: render("agent")?,
    })
}

/// Fail with an install hint when a required tool is missing
pub(crate) async fn require_tools(
    runner: &dyn CommandRunner,
    tools: &[(&str, &str)],
) -> Result<()> {
    for (tool, hint) in tools {
        if !crate::runner::tool_available(runner, tool).await {
            return Err(Error::precondition(format!(
                "required tool '{}' not found on PATH ({})",
                tool, hint
            )));
        }
    }
    Ok(())
}

/// Fail unless at least one of the given environment variables is set
pub(crate) fn require_credential_env(backend: Backend, names: &[&str]) -> Result<()> {
    if names
        .iter()
        .any(|name| std::env::var(name).map(|v| !v.is_empty()).unwrap_or(false))
    {
        return Ok(());
    }
    Err(Error::precondition(format!(
        "backend '{}' requires one of {} to be set",
        backend,
        names.join(", ")
    )))
}

/// Build a fleet from parallel id/address lists, leader first
pub(crate) fn fleet_from_outputs(
    control_plane_ids: Vec<String>,
    control_plane_addrs: Vec<String>,
    worker_ids: Vec<String>,
    worker_addrs: Vec<String>,
) -> Result<Fleet> {
    use crate::cluster::{NodeRef, NodeRole};

    if control_plane_ids.len() != control_plane_addrs.len()
        || worker_ids.len() != worker_addrs.len()
    {
        return Err(Error::serialization(
            "provisioning outputs disagree on node counts",
        ));
    }
    if control_plane_ids.is_empty() {
        return Err(Error::serialization(
            "provisioning outputs contain no control-plane nodes",
        ));
    }

    let mut nodes = Vec::with_capacity(control_plane_ids.len() + worker_ids.len());
    for (i, (id, addr)) in control_plane_ids
        .into_iter()
        .zip(control_plane_addrs)
        .enumerate()
    {
        let role = if i == 0 {
            NodeRole::ControlPlaneLeader
        } else {
            NodeRole::ControlPlaneFollower
        };
        nodes.push(NodeRef::new(id, role, addr));
    }
    for (id, addr) in worker_ids.into_iter().zip(worker_addrs) {
        nodes.push(NodeRef::new(id, NodeRole::Worker, addr));
    }

    Fleet::new(nodes)
}
