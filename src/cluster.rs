//! Cluster model: spec, fleet, endpoint, status, and on-disk workspace.
//!
//! A [`ClusterSpec`] is parsed from the user's YAML file and is immutable once
//! [`ClusterSpec::validate_shape`] has accepted it. Everything that varies per
//! invocation (state root, output paths) lives in [`Workspace`] and is threaded
//! explicitly; there are no ambient globals.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default port the installed API server listens on
pub const API_SERVER_PORT: u16 = 6443;

/// Backend identity selecting a provider implementation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// AWS: EC2 instances behind an NLB, remote commands via SSM
    Aws,
    /// Hetzner Cloud: servers behind a cloud load balancer, remote commands via SSH
    Hcloud,
    /// Proxmox VE: VMs with an ARP-failover virtual IP, remote commands via SSH
    Proxmox,
    /// Azure: registered but not yet implemented
    Azure,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Backend::Aws => "aws",
            Backend::Hcloud => "hcloud",
            Backend::Proxmox => "proxmox",
            Backend::Azure => "azure",
        };
        f.write_str(s)
    }
}

/// AWS-specific spec fields
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AwsSpec {
    /// AWS region (e.g., "eu-west-1")
    pub region: String,
    /// EC2 instance type for all nodes
    #[serde(default = "default_aws_instance_type")]
    pub instance_type: String,
}

fn default_aws_instance_type() -> String {
    "t3.large".to_string()
}

/// Hetzner Cloud-specific spec fields
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HcloudSpec {
    /// Hetzner location (e.g., "fsn1")
    pub location: String,
    /// Server type for all nodes
    #[serde(default = "default_hcloud_server_type")]
    pub server_type: String,
}

fn default_hcloud_server_type() -> String {
    "cx32".to_string()
}

/// Proxmox VE-specific spec fields
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProxmoxSpec {
    /// Proxmox node name to schedule VMs on
    pub node: String,
    /// Virtual IP fronting the control plane (ARP failover)
    pub virtual_ip: Option<String>,
}

/// User-supplied cluster specification, immutable once validated
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster name; used for the state directory and all backend resources
    pub name: String,
    /// Backend identity
    pub backend: Backend,
    /// Number of control-plane nodes; must be odd and >= 1 for etcd quorum
    pub control_planes: u32,
    /// Number of worker nodes
    #[serde(default)]
    pub workers: u32,
    /// Pod network CIDR (e.g., "10.42.0.0/16")
    pub network_cidr: String,
    /// Installer version channel (e.g., "v1.31.4+k3s1")
    pub kubernetes_version: String,
    /// Path to the SSH private key used by sync-direct channels
    #[serde(default)]
    pub ssh_key_path: Option<PathBuf>,
    /// AWS fields; required when backend is aws
    #[serde(default)]
    pub aws: Option<AwsSpec>,
    /// Hetzner fields; required when backend is hcloud
    #[serde(default)]
    pub hcloud: Option<HcloudSpec>,
    /// Proxmox fields; required when backend is proxmox
    #[serde(default)]
    pub proxmox: Option<ProxmoxSpec>,
}

impl ClusterSpec {
    /// Parse a spec from YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::precondition(format!("invalid cluster spec YAML: {}", e)))
    }

    /// Validate the backend-independent shape of the spec.
    ///
    /// This runs entirely offline and never contacts any backend. Backend
    /// variants layer their own credential/tooling checks on top.
    pub fn validate_shape(&self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            || self.name.starts_with('-')
            || self.name.ends_with('-')
        {
            return Err(Error::precondition(format!(
                "cluster name '{}' must be non-empty lowercase alphanumeric with interior dashes",
                self.name
            )));
        }

        if self.control_planes == 0 {
            return Err(Error::precondition(
                "control plane count must be at least 1",
            ));
        }
        if self.control_planes % 2 == 0 {
            return Err(Error::precondition(format!(
                "control plane count must be odd for etcd quorum (1, 3, 5, ...), got {}",
                self.control_planes
            )));
        }

        parse_cidr(&self.network_cidr)?;

        if self.kubernetes_version.is_empty() {
            return Err(Error::precondition("kubernetesVersion must be set"));
        }

        Ok(())
    }

    /// The configured virtual IP, if this spec's topology carries one
    pub fn virtual_ip(&self) -> Option<&str> {
        self.proxmox
            .as_ref()
            .and_then(|p| p.virtual_ip.as_deref())
            .filter(|ip| !ip.is_empty())
    }
}

/// Validate an IPv4 CIDR of the form `a.b.c.d/len`
fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| Error::precondition(format!("network CIDR '{}' missing prefix length", cidr)))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::precondition(format!("network CIDR '{}' has an invalid address", cidr)))?;
    let len: u8 = len
        .parse()
        .ok()
        .filter(|l| *l <= 32)
        .ok_or_else(|| Error::precondition(format!("network CIDR '{}' has an invalid prefix length", cidr)))?;
    Ok((addr, len))
}

/// Role of a node within the cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// The control-plane node that initialises the cluster
    ControlPlaneLeader,
    /// Control-plane nodes that join the leader
    ControlPlaneFollower,
    /// Workload-only nodes
    Worker,
}

impl NodeRole {
    /// Whether this role runs the API server
    pub fn is_control_plane(self) -> bool {
        matches!(
            self,
            NodeRole::ControlPlaneLeader | NodeRole::ControlPlaneFollower
        )
    }
}

/// A provisioned remote node: backend identifier, role, and network address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeRef {
    /// Backend-specific remote identifier (instance id, server IP, ...)
    pub id: String,
    /// Role within the cluster
    pub role: NodeRole,
    /// Network address the node is reachable on
    pub address: String,
}

impl NodeRef {
    /// Create a node reference
    pub fn new(id: impl Into<String>, role: NodeRole, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            address: address.into(),
        }
    }
}

/// The full set of provisioned nodes for a cluster
#[derive(Clone, Debug, Default)]
pub struct Fleet {
    nodes: Vec<NodeRef>,
}

impl Fleet {
    /// Build a fleet, enforcing the role-partition invariant:
    /// exactly one control-plane leader.
    pub fn new(nodes: Vec<NodeRef>) -> Result<Self> {
        let leaders = nodes
            .iter()
            .filter(|n| n.role == NodeRole::ControlPlaneLeader)
            .count();
        if leaders != 1 {
            return Err(Error::precondition(format!(
                "fleet must have exactly one control-plane leader, got {}",
                leaders
            )));
        }
        Ok(Self { nodes })
    }

    /// All nodes
    pub fn nodes(&self) -> &[NodeRef] {
        &self.nodes
    }

    /// The control-plane leader
    pub fn leader(&self) -> &NodeRef {
        self.nodes
            .iter()
            .find(|n| n.role == NodeRole::ControlPlaneLeader)
            .expect("fleet invariant: exactly one leader")
    }

    /// All control-plane nodes, leader first
    pub fn control_planes(&self) -> Vec<&NodeRef> {
        let mut cp: Vec<&NodeRef> = self
            .nodes
            .iter()
            .filter(|n| n.role.is_control_plane())
            .collect();
        cp.sort_by_key(|n| n.role != NodeRole::ControlPlaneLeader);
        cp
    }

    /// All worker nodes
    pub fn workers(&self) -> Vec<&NodeRef> {
        self.nodes
            .iter()
            .filter(|n| n.role == NodeRole::Worker)
            .collect()
    }
}

/// A resolved externally reachable API endpoint
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// Hostname or IP address
    pub host: String,
    /// API server port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint on the default API server port
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: API_SERVER_PORT,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Readiness of a single cluster node as reported by the API server
#[derive(Clone, Debug)]
pub struct NodeStatus {
    /// Kubernetes node name
    pub name: String,
    /// Whether the node's Ready condition is True
    pub ready: bool,
    /// Node roles from well-known labels
    pub roles: Vec<String>,
    /// Kubelet version
    pub version: String,
}

/// Snapshot of cluster health returned by `get_cluster_status`
#[derive(Clone, Debug)]
pub struct ClusterStatus {
    /// Cluster name
    pub cluster: String,
    /// The endpoint the status was queried through, if resolution succeeded
    pub endpoint: Option<Endpoint>,
    /// Per-node readiness
    pub nodes: Vec<NodeStatus>,
}

impl ClusterStatus {
    /// Whether every node reports Ready
    pub fn all_ready(&self) -> bool {
        !self.nodes.is_empty() && self.nodes.iter().all(|n| n.ready)
    }
}

/// On-disk workspace for per-cluster provisioning state.
///
/// The per-cluster directory is an exclusive resource: concurrent bootstrap
/// invocations against the same cluster name are undefined behavior and are
/// not guarded by locking.
#[derive(Clone, Debug)]
pub struct Workspace {
    state_root: PathBuf,
    module_root: PathBuf,
}

/// Environment variable overriding the terraform module root
const MODULE_ROOT_ENV: &str = "STRATA_TF_MODULES";
/// Default location backend templates are installed to
const DEFAULT_MODULE_ROOT: &str = "/usr/share/strata/terraform";

impl Workspace {
    /// Create a workspace rooted at the given directory
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        let module_root = std::env::var(MODULE_ROOT_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_MODULE_ROOT));
        Self {
            state_root: state_root.into(),
            module_root,
        }
    }

    /// Default workspace at `~/.strata`
    pub fn default_root() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::precondition("could not determine home directory"))?;
        Ok(Self::new(home.join(".strata")))
    }

    /// Override the terraform module root
    pub fn with_module_root(mut self, module_root: impl Into<PathBuf>) -> Self {
        self.module_root = module_root.into();
        self
    }

    /// Provisioning state directory for a cluster, created on demand
    pub fn cluster_dir(&self, cluster: &str) -> Result<PathBuf> {
        let dir = self.state_root.join("clusters").join(cluster);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Whether any provisioning state exists for a cluster
    pub fn cluster_dir_exists(&self, cluster: &str) -> bool {
        self.state_root.join("clusters").join(cluster).exists()
    }

    /// Remove all provisioning state for a cluster
    pub fn purge_cluster_dir(&self, cluster: &str) -> Result<()> {
        let dir = self.state_root.join("clusters").join(cluster);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Default path the patched kubeconfig is written to
    pub fn kubeconfig_path(&self, cluster: &str) -> Result<PathBuf> {
        Ok(self.cluster_dir(cluster)?.join("kubeconfig"))
    }

    /// Backend template directory for `terraform init -from-module`
    pub fn module_dir(&self, backend: Backend) -> PathBuf {
        self.module_root.join(backend.to_string())
    }
}

/// Flat key/value variables consumed by the provisioning backend
pub type TfVars = BTreeMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> ClusterSpec {
        ClusterSpec {
            name: "prod-eu".to_string(),
            backend: Backend::Hcloud,
            control_planes: 3,
            workers: 2,
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

    #[test]
    fn valid_spec_passes_shape_validation() {
        base_spec().validate_shape().expect("spec should be valid");
    }

    #[test]
    fn even_control_plane_count_is_rejected() {
        let mut spec = base_spec();
        spec.control_planes = 2;
        let err = spec.validate_shape().unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert!(err.to_string().contains("odd"));
    }

    #[test]
    fn zero_control_planes_is_rejected() {
        let mut spec = base_spec();
        spec.control_planes = 0;
        let err = spec.validate_shape().unwrap_err();
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn bad_cidr_is_rejected() {
        for cidr in ["10.42.0.0", "10.42.0.0/33", "not-a-cidr/16", ""] {
            let mut spec = base_spec();
            spec.network_cidr = cidr.to_string();
            assert!(
                spec.validate_shape().is_err(),
                "CIDR '{}' should be rejected",
                cidr
            );
        }
    }

    #[test]
    fn bad_names_are_rejected() {
        for name in ["", "Has-Caps", "under_score", "-leading", "trailing-"] {
            let mut spec = base_spec();
            spec.name = name.to_string();
            assert!(
                spec.validate_shape().is_err(),
                "name '{}' should be rejected",
                name
            );
        }
    }

    #[test]
    fn spec_yaml_roundtrip() {
        let yaml = r#"
name: staging
backend: proxmox
controlPlanes: 1
workers: 0
networkCidr: 10.42.0.0/16
kubernetesVersion: v1.31.4+k3s1
proxmox:
  node: pve1
  virtualIp: 10.0.0.100
"#;
        let spec = ClusterSpec::from_yaml(yaml).expect("should parse");
        assert_eq!(spec.backend, Backend::Proxmox);
        assert_eq!(spec.control_planes, 1);
        assert_eq!(spec.virtual_ip(), Some("10.0.0.100"));
        spec.validate_shape().expect("should validate");
    }

    #[test]
    fn fleet_requires_exactly_one_leader() {
        let two_leaders = vec![
            NodeRef::new("a", NodeRole::ControlPlaneLeader, "10.0.0.1"),
            NodeRef::new("b", NodeRole::ControlPlaneLeader, "10.0.0.2"),
        ];
        assert!(Fleet::new(two_leaders).is_err());

        let none = vec![NodeRef::new("a", NodeRole::Worker, "10.0.0.1")];
        assert!(Fleet::new(none).is_err());
    }

    #[test]
    fn fleet_partitions_roles() {
        let fleet = Fleet::new(vec![
            NodeRef::new("w1", NodeRole::Worker, "10.0.1.1"),
            NodeRef::new("cp2", NodeRole::ControlPlaneFollower, "10.0.0.2"),
            NodeRef::new("cp1", NodeRole::ControlPlaneLeader, "10.0.0.1"),
            NodeRef::new("w2", NodeRole::Worker, "10.0.1.2"),
        ])
        .unwrap();

        assert_eq!(fleet.leader().id, "cp1");
        let cp: Vec<&str> = fleet.control_planes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(cp, vec!["cp1", "cp2"], "leader sorts first");
        assert_eq!(fleet.workers().len(), 2);
    }

    #[test]
    fn endpoint_defaults_to_api_server_port() {
        let ep = Endpoint::new("lb.example.com");
        assert_eq!(ep.port, 6443);
        assert_eq!(ep.to_string(), "lb.example.com:6443");
    }

    #[test]
    fn workspace_paths_are_per_cluster() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = Workspace::new(tmp.path());
        let dir = ws.cluster_dir("alpha").unwrap();
        assert!(dir.ends_with("clusters/alpha"));
        assert!(dir.exists());

        assert!(ws.cluster_dir_exists("alpha"));
        ws.purge_cluster_dir("alpha").unwrap();
        assert!(!ws.cluster_dir_exists("alpha"));
    }
}
