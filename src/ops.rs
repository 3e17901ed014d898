//! Caller-facing cluster operations.
//!
//! The CLI layer talks to exactly these functions. Every operation that
//! needs cluster credentials (kubeconfig export, status, validation) goes
//! through the single canonical path: resolve the endpoint, fetch the raw
//! bundle from the leader, patch the server line. There is no second,
//! divergent way to obtain a bundle.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::bootstrap::{BootstrapReport, Sequencer};
use crate::cluster::{ClusterSpec, ClusterStatus, Endpoint, NodeStatus};
use crate::kubeconfig::{patch_kubeconfig, write_bundle};
use crate::poll::PollPolicy;
use crate::provider::Provider;
use crate::validate::{self, CheckContext, CheckKind, CheckResult, ValidationReport};
use crate::{Error, Result};

/// Create and converge the cluster's infrastructure.
///
/// `validate_config` gates the sequencer: a spec that fails validation
/// causes zero backend invocations.
pub async fn create_infrastructure(
    provider: &dyn Provider,
    spec: &ClusterSpec,
) -> Result<BootstrapReport> {
    provider.validate_config(spec).await?;
    Sequencer::new(provider).run(spec).await
}

/// Tear down the cluster's infrastructure.
///
/// With `purge_state`, the on-disk provisioning state is removed after a
/// successful destroy; otherwise it persists for idempotent re-entry.
pub async fn destroy_infrastructure(
    provider: &dyn Provider,
    spec: &ClusterSpec,
    purge_state: bool,
) -> Result<()> {
    provider.destroy(spec).await?;
    if purge_state {
        provider.workspace().purge_cluster_dir(&spec.name)?;
        info!(cluster = %spec.name, "removed provisioning state");
    }
    Ok(())
}

/// A fetched (and usually patched) credential bundle
#[derive(Debug)]
pub struct KubeconfigOutcome {
    /// Where the bundle was written
    pub path: PathBuf,
    /// The endpoint patched in, when resolution succeeded
    pub endpoint: Option<Endpoint>,
    /// Set when the bundle is a degraded, unpatched copy
    pub warning: Option<String>,
}

/// Fetch the cluster's credential bundle, patch its server address to the
/// resolved endpoint, and write it to `out` (or the workspace default).
///
/// If no endpoint candidate resolves, the raw unpatched bundle is returned
/// with a warning: a degraded success, since the bundle may still be
/// usable for local tunnel-based access.
pub async fn get_kubeconfig(
    provider: &dyn Provider,
    spec: &ClusterSpec,
    out: Option<&Path>,
) -> Result<KubeconfigOutcome> {
    let raw = provider.fetch_raw_kubeconfig(spec).await?;
    let path = match out {
        Some(path) => path.to_path_buf(),
        None => provider.workspace().kubeconfig_path(&spec.name)?,
    };

    match resolve_endpoint(provider, spec).await {
        Ok(endpoint) => {
            let patched = patch_kubeconfig(&raw, &endpoint)?;
            write_bundle(&path, &patched).await?;
            info!(path = %path.display(), endpoint = %endpoint, "wrote patched credential bundle");
            Ok(KubeconfigOutcome {
                path,
                endpoint: Some(endpoint),
                warning: None,
            })
        }
        Err(e) => {
            let warning = format!(
                "no endpoint candidate resolved ({}); returning the unpatched bundle",
                e
            );
            warn!(%warning);
            write_bundle(&path, &raw).await?;
            Ok(KubeconfigOutcome {
                path,
                endpoint: None,
                warning: Some(warning),
            })
        }
    }
}

/// Resolve the externally reachable endpoint for a cluster.
///
/// Priority: the provider's endpoint candidate (load balancer, then virtual
/// IP), falling back to the leader's own address. Deterministic given the
/// same provisioning outputs. A failed candidate query still falls through
/// to the leader; only an unanswerable fleet query is a resolution error.
pub async fn resolve_endpoint(provider: &dyn Provider, spec: &ClusterSpec) -> Result<Endpoint> {
    match provider.endpoint_candidate(spec).await {
        Ok(Some(endpoint)) => return Ok(endpoint),
        Ok(None) => {}
        Err(e) => {
            warn!(error = %e, "endpoint candidate query failed, falling back to leader address");
        }
    }
    let fleet = provider
        .fleet(spec)
        .await
        .map_err(|e| Error::resolution(format!("fleet query failed: {}", e)))?;
    Ok(Endpoint::new(fleet.leader().address.clone()))
}

/// Query per-node readiness through the patched credential bundle
pub async fn get_cluster_status(
    provider: &dyn Provider,
    spec: &ClusterSpec,
) -> Result<ClusterStatus> {
    let bundle = get_kubeconfig(provider, spec, None).await?;
    let kubeconfig = bundle.path.display().to_string();

    let out = provider
        .runner()
        .run(
            "kubectl",
            &["--kubeconfig", &kubeconfig, "get", "nodes", "-o", "json"],
        )
        .await?;
    if !out.success() {
        return Err(Error::backend(
            "kubectl get nodes",
            out.stderr.trim().to_string(),
        ));
    }

    let nodes = parse_node_statuses(&out.stdout)?;
    Ok(ClusterStatus {
        cluster: spec.name.clone(),
        endpoint: bundle.endpoint,
        nodes,
    })
}

/// Run the full health validation pipeline against the canonical bundle
pub async fn validate_cluster(
    provider: &dyn Provider,
    spec: &ClusterSpec,
    quick: bool,
) -> Result<ValidationReport> {
    let bundle = get_kubeconfig(provider, spec, None).await?;
    if let Some(warning) = &bundle.warning {
        warn!(%warning, "validating against a degraded bundle");
    }

    let runner = provider.runner();
    let ctx = CheckContext {
        runner: runner.as_ref(),
        kubeconfig: &bundle.path,
        policy: PollPolicy::default(),
    };
    Ok(validate::run_pipeline(&ctx, quick).await)
}

/// Run a single named health check against the canonical bundle
pub async fn validate_check(
    provider: &dyn Provider,
    spec: &ClusterSpec,
    kind: CheckKind,
) -> Result<CheckResult> {
    let bundle = get_kubeconfig(provider, spec, None).await?;
    let runner = provider.runner();
    let ctx = CheckContext {
        runner: runner.as_ref(),
        kubeconfig: &bundle.path,
        policy: PollPolicy::default(),
    };
    Ok(validate::run_check(&ctx, kind).await)
}

fn parse_node_statuses(json: &str) -> Result<Vec<NodeStatus>> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| Error::serialization(format!("node list is not valid JSON: {}", e)))?;
    let items = value
        .get("items")
        .and_then(|i| i.as_array())
        .ok_or_else(|| Error::serialization("node list has no items array"))?;

    let nodes = items
        .iter()
        .map(|item| {
            let name = item
                .pointer("/metadata/name")
                .and_then(|n| n.as_str())
                .unwrap_or("<unnamed>")
                .to_string();
            let ready = item
                .pointer("/status/conditions")
                .and_then(|c| c.as_array())
                .map(|conditions| {
                    conditions.iter().any(|c| {
                        c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                            && c.get("status").and_then(|s| s.as_str()) == Some("True")
                    })
                })
                .unwrap_or(false);
            let roles = item
                .pointer("/metadata/labels")
                .and_then(|l| l.as_object())
                .map(|labels| {
                    labels
                        .keys()
                        .filter_map(|k| k.strip_prefix("node-role.kubernetes.io/"))
                        .map(|r| r.to_string())
                        .collect()
                })
                .unwrap_or_default();
            let version = item
                .pointer("/status/nodeInfo/kubeletVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            NodeStatus {
                name,
                ready,
                roles,
                version,
            }
        })
        .collect();

    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Backend, Fleet, HcloudSpec, NodeRef, NodeRole, TfVars, Workspace};
    use crate::remote::{CommandChannel, CommandHandle, CommandOutcome};
    use crate::runner::{CommandRunner, MockCommandRunner};
    use crate::terraform::Terraform;
    use async_trait::async_trait;
    use std::sync::Arc;

    const RAW_BUNDLE: &str = "\
apiVersion: v1
clusters:
- cluster:
    server: https://127.0.0.1:6443
  name: default
kind: Config
";

    fn spec() -> ClusterSpec {
        ClusterSpec {
            name: "test".to_string(),
            backend: Backend::Hcloud,
            control_planes: 1,
            workers: 0,
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

    struct StubChannel;

    #[async_trait]
    impl CommandChannel for StubChannel {
        async fn submit(&self, target: &NodeRef, _script: &str) -> crate::Result<CommandHandle> {
            Ok(CommandHandle::settled(target.clone(), CommandOutcome::Success))
        }
        async fn poll(&self, handle: &CommandHandle) -> crate::Result<CommandOutcome> {
            Ok(handle.settled_outcome().unwrap_or(CommandOutcome::Pending))
        }
        async fn capture(&self, _target: &NodeRef, _script: &str) -> crate::Result<String> {
            Ok(RAW_BUNDLE.to_string())
        }
    }

    /// Provider stub exercising resolution priority and degraded paths.
    struct StubProvider {
        runner: Arc<dyn CommandRunner>,
        terraform: Terraform,
        channel: StubChannel,
        workspace: Workspace,
        lb: crate::Result<Option<String>>,
        fleet_unavailable: bool,
    }

    impl StubProvider {
        fn new(tmp: &tempfile::TempDir, lb: crate::Result<Option<String>>) -> Self {
            let runner: Arc<dyn CommandRunner> = Arc::new(MockCommandRunner::new());
            Self {
                terraform: Terraform::new(runner.clone()),
                runner,
                channel: StubChannel,
                workspace: Workspace::new(tmp.path()),
                lb,
                fleet_unavailable: false,
            }
        }
    }

    #[async_trait]
    impl Provider for StubProvider {
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
        async fn validate_config(&self, s: &ClusterSpec) -> crate::Result<()> {
            s.validate_shape()
        }
        fn tf_vars(&self, _spec: &ClusterSpec) -> crate::Result<TfVars> {
            Ok(TfVars::new())
        }
        async fn fleet(&self, _spec: &ClusterSpec) -> crate::Result<Fleet> {
            if self.fleet_unavailable {
                return Err(Error::backend("terraform output", "no outputs found"));
            }
            Fleet::new(vec![NodeRef::new(
                "cp1",
                NodeRole::ControlPlaneLeader,
                "192.0.2.1",
            )])
        }
        async fn fetch_raw_kubeconfig(&self, _spec: &ClusterSpec) -> crate::Result<String> {
            // Bundle fetch is independent of the resolution queries here so
            // the degraded-success path can be exercised.
            Ok(RAW_BUNDLE.to_string())
        }
        async fn load_balancer_address(&self, _spec: &ClusterSpec) -> crate::Result<Option<String>> {
            match &self.lb {
                Ok(v) => Ok(v.clone()),
                Err(_) => Err(Error::backend("terraform output", "no outputs found")),
            }
        }
    }

    /// A spec that also carries a configured virtual IP, so the shared
    /// endpoint-candidate priority can be exercised end to end.
    fn spec_with_vip() -> ClusterSpec {
        let mut s = spec();
        s.proxmox = Some(crate::cluster::ProxmoxSpec {
            node: "pve1".to_string(),
            virtual_ip: Some("10.0.0.100".to_string()),
        });
        s
    }

    #[tokio::test]
    async fn lb_wins_over_virtual_ip() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(&tmp, Ok(Some("lb.example.com".to_string())));

        let endpoint = resolve_endpoint(&provider, &spec_with_vip()).await.unwrap();
        assert_eq!(endpoint.host, "lb.example.com");
    }

    #[tokio::test]
    async fn virtual_ip_wins_over_leader_address() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(&tmp, Ok(None));

        let endpoint = resolve_endpoint(&provider, &spec_with_vip()).await.unwrap();
        assert_eq!(endpoint.host, "10.0.0.100");
    }

    #[tokio::test]
    async fn leader_address_is_the_last_resort() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(&tmp, Ok(None));

        let endpoint = resolve_endpoint(&provider, &spec()).await.unwrap();
        assert_eq!(endpoint.host, "192.0.2.1");
    }

    #[tokio::test]
    async fn kubeconfig_is_patched_to_the_resolved_endpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(&tmp, Ok(Some("lb.example.com".to_string())));

        let outcome = get_kubeconfig(&provider, &spec(), None).await.unwrap();
        assert!(outcome.warning.is_none());
        assert_eq!(outcome.endpoint.as_ref().unwrap().host, "lb.example.com");

        let content = std::fs::read_to_string(&outcome.path).unwrap();
        assert!(content.contains("server: https://lb.example.com:6443"));
        assert!(!content.contains("127.0.0.1"));
    }

    #[tokio::test]
    async fn candidate_query_failure_still_falls_back_to_leader() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(
            &tmp,
            Err(Error::backend("terraform output", "no outputs found")),
        );

        let endpoint = resolve_endpoint(&provider, &spec()).await.unwrap();
        assert_eq!(endpoint.host, "192.0.2.1");
    }

    #[tokio::test]
    async fn resolution_failure_degrades_to_unpatched_bundle() {
        let tmp = tempfile::tempdir().unwrap();
        let mut provider = StubProvider::new(
            &tmp,
            Err(Error::backend("terraform output", "no outputs found")),
        );
        provider.fleet_unavailable = true;

        let outcome = get_kubeconfig(&provider, &spec(), None).await.unwrap();
        assert!(outcome.endpoint.is_none());
        assert!(outcome.warning.unwrap().contains("unpatched"));

        let content = std::fs::read_to_string(&outcome.path).unwrap();
        assert!(content.contains("server: https://127.0.0.1:6443"));
    }

    #[tokio::test]
    async fn explicit_output_path_is_honored() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(&tmp, Ok(Some("lb.example.com".to_string())));
        let out = tmp.path().join("exported-kubeconfig");

        let outcome = get_kubeconfig(&provider, &spec(), Some(&out)).await.unwrap();
        assert_eq!(outcome.path, out);
        assert!(out.exists());
    }

    #[tokio::test]
    async fn invalid_spec_never_reaches_the_sequencer() {
        let tmp = tempfile::tempdir().unwrap();
        let provider = StubProvider::new(&tmp, Ok(None));
        let mut bad = spec();
        bad.control_planes = 4;

        let err = create_infrastructure(&provider, &bad).await.unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }

    #[test]
    fn node_statuses_parse_from_kubectl_json() {
        let json = serde_json::json!({
            "items": [
                {
                    "metadata": {
                        "name": "cp1",
                        "labels": { "node-role.kubernetes.io/control-plane": "true" }
                    },
                    "status": {
                        "conditions": [ { "type": "Ready", "status": "True" } ],
                        "nodeInfo": { "kubeletVersion": "v1.31.4+k3s1" }
                    }
                },
                {
                    "metadata": { "name": "w1", "labels": {} },
                    "status": {
                        "conditions": [ { "type": "Ready", "status": "False" } ],
                        "nodeInfo": { "kubeletVersion": "v1.31.4+k3s1" }
                    }
                }
            ]
        })
        .to_string();

        let nodes = parse_node_statuses(&json).unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes[0].ready);
        assert_eq!(nodes[0].roles, vec!["control-plane"]);
        assert!(!nodes[1].ready);
        assert_eq!(nodes[1].version, "v1.31.4+k3s1");
    }
}
