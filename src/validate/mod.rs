//! Health validation pipeline.
//!
//! An ordered list of independent checks runs against a resolved and patched
//! credential bundle, driven through `kubectl` via the command runner. A
//! check never raises: every underlying query failure is mapped to fail or
//! warn according to that check's own policy. All checks always run to
//! completion, with no short-circuiting on first failure, so a full report is
//! always produced, with end-to-end elapsed time.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::poll::PollPolicy;
use crate::runner::CommandRunner;
use crate::{Error, Result};

/// Status of a single check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    /// The check passed
    Pass,
    /// The check found a problem
    Fail,
    /// The check found something worth attention, not a failure
    Warn,
    /// The check was statically excluded from this run
    Skip,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Warn => "WARN",
            CheckStatus::Skip => "SKIP",
        };
        f.pad(s)
    }
}

/// Outcome of one named check
#[derive(Clone, Debug)]
pub struct CheckResult {
    /// Stable check name
    pub name: &'static str,
    /// Status per this check's policy
    pub status: CheckStatus,
    /// Human-readable summary
    pub message: String,
    /// Optional supporting detail (e.g., the failing nodes)
    pub detail: Option<String>,
}

impl CheckResult {
    fn pass(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Pass,
            message: message.into(),
            detail: None,
        }
    }

    fn fail(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Fail,
            message: message.into(),
            detail: None,
        }
    }

    fn warn(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Warn,
            message: message.into(),
            detail: None,
        }
    }

    fn skip(name: &'static str, message: impl Into<String>) -> Self {
        Self {
            name,
            status: CheckStatus::Skip,
            message: message.into(),
            detail: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// The checks the pipeline knows, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckKind {
    /// API server answers readiness probes
    ApiReachable,
    /// Every node reports Ready
    NodesReady,
    /// kube-system pods are running
    SystemPods,
    /// etcd reports healthy through the API
    EtcdHealth,
    /// Cluster DNS deployment has ready replicas
    ClusterDns,
    /// Every node has a pod CIDR assigned
    PodNetwork,
    /// A probe pod schedules and runs to completion
    PodScheduling,
}

impl CheckKind {
    /// All checks in execution order
    pub fn all() -> &'static [CheckKind] {
        &[
            CheckKind::ApiReachable,
            CheckKind::NodesReady,
            CheckKind::SystemPods,
            CheckKind::EtcdHealth,
            CheckKind::ClusterDns,
            CheckKind::PodNetwork,
            CheckKind::PodScheduling,
        ]
    }

    /// Stable name used in reports and on the CLI
    pub fn name(self) -> &'static str {
        match self {
            CheckKind::ApiReachable => "api-reachable",
            CheckKind::NodesReady => "nodes-ready",
            CheckKind::SystemPods => "system-pods",
            CheckKind::EtcdHealth => "etcd-health",
            CheckKind::ClusterDns => "cluster-dns",
            CheckKind::PodNetwork => "pod-network",
            CheckKind::PodScheduling => "pod-scheduling",
        }
    }
}

impl FromStr for CheckKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        CheckKind::all()
            .iter()
            .copied()
            .find(|k| k.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = CheckKind::all().iter().map(|k| k.name()).collect();
                Error::precondition(format!(
                    "unknown check '{}' (known: {})",
                    s,
                    names.join(", ")
                ))
            })
    }
}

/// Checks excluded by quick mode
pub const QUICK_EXCLUDED: &[CheckKind] = &[CheckKind::PodScheduling];

/// Aggregated verdict over all checks
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Every check passed
    Passed,
    /// No failures, at least one warning
    PassedWithWarnings,
    /// At least one check failed
    Failed,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Passed => "PASSED",
            Verdict::PassedWithWarnings => "PASSED_WITH_WARNINGS",
            Verdict::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Full pipeline report
#[derive(Clone, Debug)]
pub struct ValidationReport {
    /// Per-check outcomes, in execution order
    pub results: Vec<CheckResult>,
    /// Aggregated verdict
    pub verdict: Verdict,
    /// End-to-end wall-clock time for the run
    pub elapsed: Duration,
}

/// Everything a check needs to query the cluster
pub struct CheckContext<'a> {
    /// Local subprocess boundary
    pub runner: &'a dyn CommandRunner,
    /// Path to the patched credential bundle
    pub kubeconfig: &'a Path,
    /// Poll bounds for checks that wait (pod scheduling)
    pub policy: PollPolicy,
}

impl CheckContext<'_> {
    async fn kubectl(&self, args: &[&str]) -> Result<String> {
        let kubeconfig = self.kubeconfig.display().to_string();
        let mut full: Vec<&str> = vec!["--kubeconfig", &kubeconfig];
        full.extend_from_slice(args);
        let out = self.runner.run("kubectl", &full).await?;
        if !out.success() {
            return Err(Error::backend(
                format!("kubectl {}", args.first().copied().unwrap_or_default()),
                out.stderr.trim().to_string(),
            ));
        }
        Ok(out.stdout)
    }
}

/// Run the ordered pipeline; quick mode statically excludes
/// [`QUICK_EXCLUDED`] without changing aggregation semantics.
pub async fn run_pipeline(ctx: &CheckContext<'_>, quick: bool) -> ValidationReport {
    let started = Instant::now();
    let mut results = Vec::with_capacity(CheckKind::all().len());

    for kind in CheckKind::all() {
        if quick && QUICK_EXCLUDED.contains(kind) {
            results.push(CheckResult::skip(kind.name(), "excluded in quick mode"));
            continue;
        }
        let result = run_check(ctx, *kind).await;
        debug!(check = result.name, status = %result.status, "check complete");
        results.push(result);
    }

    let verdict = aggregate(&results);
    ValidationReport {
        results,
        verdict,
        elapsed: started.elapsed(),
    }
}

/// Aggregate per-check outcomes into one verdict:
/// any fail => FAILED; else any warn => PASSED_WITH_WARNINGS; else PASSED.
pub fn aggregate(results: &[CheckResult]) -> Verdict {
    if results.iter().any(|r| r.status == CheckStatus::Fail) {
        Verdict::Failed
    } else if results.iter().any(|r| r.status == CheckStatus::Warn) {
        Verdict::PassedWithWarnings
    } else {
        Verdict::Passed
    }
}

/// Run a single check; never returns an error
pub async fn run_check(ctx: &CheckContext<'_>, kind: CheckKind) -> CheckResult {
    match kind {
        CheckKind::ApiReachable => check_api_reachable(ctx).await,
        CheckKind::NodesReady => check_nodes_ready(ctx).await,
        CheckKind::SystemPods => check_system_pods(ctx).await,
        CheckKind::EtcdHealth => check_etcd_health(ctx).await,
        CheckKind::ClusterDns => check_cluster_dns(ctx).await,
        CheckKind::PodNetwork => check_pod_network(ctx).await,
        CheckKind::PodScheduling => check_pod_scheduling(ctx).await,
    }
}

async fn check_api_reachable(ctx: &CheckContext<'_>) -> CheckResult {
    let name = CheckKind::ApiReachable.name();
    match ctx.kubectl(&["get", "--raw", "/readyz"]).await {
        Ok(_) => CheckResult::pass(name, "API server is reachable and ready"),
        Err(e) => CheckResult::fail(name, "API server is not reachable")
            .with_detail(e.to_string()),
    }
}

async fn check_nodes_ready(ctx: &CheckContext<'_>) -> CheckResult {
    let name = CheckKind::NodesReady.name();
    let json = match ctx.kubectl(&["get", "nodes", "-o", "json"]).await {
        Ok(json) => json,
        Err(e) => {
            return CheckResult::fail(name, "could not list nodes").with_detail(e.to_string())
        }
    };

    let nodes = match parse_items(&json) {
        Ok(items) => items,
        Err(e) => return CheckResult::fail(name, "could not parse node list").with_detail(e),
    };
    if nodes.is_empty() {
        return CheckResult::fail(name, "cluster reports zero nodes");
    }

    let not_ready: Vec<String> = nodes
        .iter()
        .filter(|n| !node_is_ready(n))
        .map(node_name)
        .collect();
    if not_ready.is_empty() {
        CheckResult::pass(name, format!("all {} nodes are Ready", nodes.len()))
    } else {
        CheckResult::fail(
            name,
            format!("{} of {} nodes are not Ready", not_ready.len(), nodes.len()),
        )
        .with_detail(not_ready.join(", "))
    }
}

async fn check_system_pods(ctx: &CheckContext<'_>) -> CheckResult {
    let name = CheckKind::SystemPods.name();
    let json = match ctx
        .kubectl(&["get", "pods", "-n", "kube-system", "-o", "json"])
        .await
    {
        Ok(json) => json,
        Err(e) => {
            return CheckResult::fail(name, "could not list kube-system pods")
                .with_detail(e.to_string())
        }
    };

    let pods = match parse_items(&json) {
        Ok(items) => items,
        Err(e) => return CheckResult::fail(name, "could not parse pod list").with_detail(e),
    };

    let unhealthy: Vec<String> = pods
        .iter()
        .filter(|p| {
            let phase = p
                .pointer("/status/phase")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");
            phase != "Running" && phase != "Succeeded"
        })
        .map(node_name)
        .collect();

    if unhealthy.is_empty() {
        CheckResult::pass(name, format!("all {} system pods are healthy", pods.len()))
    } else {
        CheckResult::fail(name, format!("{} system pods are unhealthy", unhealthy.len()))
            .with_detail(unhealthy.join(", "))
    }
}

async fn check_etcd_health(ctx: &CheckContext<'_>) -> CheckResult {
    let name = CheckKind::EtcdHealth.name();
    match ctx.kubectl(&["get", "--raw", "/livez/etcd"]).await {
        Ok(_) => CheckResult::pass(name, "etcd reports healthy"),
        // Not all distributions expose etcd health through the generic API,
        // so an unanswerable query is a warning, not a failure.
        Err(e) => CheckResult::warn(name, "etcd health not queryable through the API")
            .with_detail(e.to_string()),
    }
}

async fn check_cluster_dns(ctx: &CheckContext<'_>) -> CheckResult {
    let name = CheckKind::ClusterDns.name();
    let json = match ctx
        .kubectl(&["get", "deployment", "coredns", "-n", "kube-system", "-o", "json"])
        .await
    {
        Ok(json) => json,
        Err(e) => {
            return CheckResult::fail(name, "cluster DNS deployment not found")
                .with_detail(e.to_string())
        }
    };

    let ready = serde_json::from_str::<serde_json::Value>(&json)
        .ok()
        .and_then(|v| v.pointer("/status/readyReplicas").and_then(|r| r.as_u64()))
        .unwrap_or(0);
    if ready >= 1 {
        CheckResult::pass(name, format!("cluster DNS has {} ready replicas", ready))
    } else {
        CheckResult::fail(name, "cluster DNS has no ready replicas")
    }
}

async fn check_pod_network(ctx: &CheckContext<'_>) -> CheckResult {
    let name = CheckKind::PodNetwork.name();
    let json = match ctx.kubectl(&["get", "nodes", "-o", "json"]).await {
        Ok(json) => json,
        Err(e) => {
            return CheckResult::fail(name, "could not list nodes").with_detail(e.to_string())
        }
    };

    let nodes = match parse_items(&json) {
        Ok(items) => items,
        Err(e) => return CheckResult::fail(name, "could not parse node list").with_detail(e),
    };

    let missing: Vec<String> = nodes
        .iter()
        .filter(|n| {
            n.pointer("/spec/podCIDR")
                .and_then(|v| v.as_str())
                .map(|c| c.is_empty())
                .unwrap_or(true)
        })
        .map(node_name)
        .collect();

    if missing.is_empty() {
        CheckResult::pass(name, "every node has a pod CIDR assigned")
    } else {
        CheckResult::fail(name, format!("{} nodes have no pod CIDR", missing.len()))
            .with_detail(missing.join(", "))
    }
}

/// Name of the throwaway pod used by the scheduling check
const PROBE_POD: &str = "strata-scheduling-probe";

async fn check_pod_scheduling(ctx: &CheckContext<'_>) -> CheckResult {
    let name = CheckKind::PodScheduling.name();

    // Clear any leftover probe from an aborted earlier run.
    let _ = ctx
        .kubectl(&["delete", "pod", PROBE_POD, "--ignore-not-found", "--wait=false"])
        .await;

    if let Err(e) = ctx
        .kubectl(&[
            "run",
            PROBE_POD,
            "--image=busybox:1.36",
            "--restart=Never",
            "--command",
            "--",
            "true",
        ])
        .await
    {
        return CheckResult::fail(name, "could not create scheduling probe pod")
            .with_detail(e.to_string());
    }

    let deadline = Instant::now() + ctx.policy.timeout;
    let result = loop {
        match ctx
            .kubectl(&["get", "pod", PROBE_POD, "-o", "jsonpath={.status.phase}"])
            .await
        {
            Ok(phase) => match phase.trim() {
                "Succeeded" => {
                    break CheckResult::pass(name, "probe pod scheduled and ran to completion")
                }
                "Failed" => break CheckResult::fail(name, "probe pod failed to run"),
                other => debug!(phase = other, "probe pod not finished"),
            },
            Err(e) => debug!(error = %e, "probe pod status query failed, retrying"),
        }
        if Instant::now() + ctx.policy.interval > deadline {
            break CheckResult::fail(
                name,
                format!("probe pod did not complete within {:?}", ctx.policy.timeout),
            );
        }
        tokio::time::sleep(ctx.policy.interval).await;
    };

    let _ = ctx
        .kubectl(&["delete", "pod", PROBE_POD, "--ignore-not-found", "--wait=false"])
        .await;

    result
}

fn parse_items(json: &str) -> std::result::Result<Vec<serde_json::Value>, String> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| e.to_string())?;
    value
        .get("items")
        .and_then(|i| i.as_array())
        .cloned()
        .ok_or_else(|| "response has no items array".to_string())
}

fn node_is_ready(node: &serde_json::Value) -> bool {
    node.pointer("/status/conditions")
        .and_then(|c| c.as_array())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

fn node_name(item: &serde_json::Value) -> String {
    item.pointer("/metadata/name")
        .and_then(|n| n.as_str())
        .unwrap_or("<unnamed>")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{failed_output, ok_output, MockCommandRunner};
    use std::path::PathBuf;

    fn nodes_json(ready: &[(&str, bool)]) -> String {
        let items: Vec<serde_json::Value> = ready
            .iter()
            .map(|(name, is_ready)| {
                serde_json::json!({
                    "metadata": { "name": name },
                    "spec": { "podCIDR": "10.42.0.0/24" },
                    "status": {
                        "conditions": [
                            { "type": "Ready", "status": if *is_ready { "True" } else { "False" } }
                        ]
                    }
                })
            })
            .collect();
        serde_json::json!({ "items": items }).to_string()
    }

    async fn run_with(mock: MockCommandRunner, kind: CheckKind) -> CheckResult {
        let kubeconfig = PathBuf::from("/tmp/kubeconfig");
        let ctx = CheckContext {
            runner: &mock,
            kubeconfig: &kubeconfig,
            policy: PollPolicy::fast(),
        };
        run_check(&ctx, kind).await
    }

    #[tokio::test]
    async fn api_reachable_passes_on_ok() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|_, args| args.contains(&"/readyz"))
            .returning(|_, _| Ok(ok_output("ok")));
        let result = run_with(mock, CheckKind::ApiReachable).await;
        assert_eq!(result.status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn api_unreachable_fails_without_raising() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .returning(|_, _| Ok(failed_output(1, "connection refused")));
        let result = run_with(mock, CheckKind::ApiReachable).await;
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.detail.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn nodes_ready_lists_the_not_ready_nodes() {
        let json = nodes_json(&[("cp1", true), ("w1", false), ("w2", true)]);
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .returning(move |_, _| Ok(ok_output(&json)));

        let result = run_with(mock, CheckKind::NodesReady).await;
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.message.contains("1 of 3"));
        assert_eq!(result.detail.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn nodes_ready_passes_when_all_ready() {
        let json = nodes_json(&[("cp1", true), ("w1", true)]);
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .returning(move |_, _| Ok(ok_output(&json)));

        let result = run_with(mock, CheckKind::NodesReady).await;
        assert_eq!(result.status, CheckStatus::Pass);
    }

    #[tokio::test]
    async fn etcd_query_failure_is_a_warning_not_a_failure() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .returning(|_, _| Ok(failed_output(1, "the server could not find the requested resource")));
        let result = run_with(mock, CheckKind::EtcdHealth).await;
        assert_eq!(result.status, CheckStatus::Warn);
    }

    #[tokio::test]
    async fn scheduling_probe_waits_for_completion() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .withf(|_, args| args.contains(&"delete"))
            .returning(|_, _| Ok(ok_output("")));
        mock.expect_run()
            .withf(|_, args| args.contains(&"run"))
            .returning(|_, _| Ok(ok_output("pod/strata-scheduling-probe created")));

        let phases = std::sync::atomic::AtomicUsize::new(0);
        mock.expect_run()
            .withf(|_, args| args.contains(&"get") && args.contains(&"pod"))
            .returning(move |_, _| {
                Ok(
                    if phases.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                        ok_output("Pending")
                    } else {
                        ok_output("Succeeded")
                    },
                )
            });

        let result = run_with(mock, CheckKind::PodScheduling).await;
        assert_eq!(result.status, CheckStatus::Pass);
    }

    #[test]
    fn aggregation_fail_dominates() {
        let results = vec![
            CheckResult::pass("a", "ok"),
            CheckResult::warn("b", "meh"),
            CheckResult::fail("c", "bad"),
            CheckResult::pass("d", "ok"),
        ];
        assert_eq!(aggregate(&results), Verdict::Failed);
    }

    #[test]
    fn aggregation_warn_without_fail() {
        let results = vec![CheckResult::pass("a", "ok"), CheckResult::warn("b", "meh")];
        assert_eq!(aggregate(&results), Verdict::PassedWithWarnings);
    }

    #[test]
    fn aggregation_all_pass() {
        let results = vec![CheckResult::pass("a", "ok"), CheckResult::skip("b", "quick")];
        assert_eq!(aggregate(&results), Verdict::Passed);
    }

    #[tokio::test]
    async fn pipeline_runs_every_check_to_completion() {
        // Every kubectl query fails; the report must still contain all checks.
        let mut mock = MockCommandRunner::new();
        mock.expect_run()
            .returning(|_, _| Ok(failed_output(1, "no route to host")));

        let kubeconfig = PathBuf::from("/tmp/kubeconfig");
        let ctx = CheckContext {
            runner: &mock,
            kubeconfig: &kubeconfig,
            policy: PollPolicy::fast(),
        };
        let report = run_pipeline(&ctx, false).await;

        assert_eq!(report.results.len(), CheckKind::all().len());
        assert_eq!(report.verdict, Verdict::Failed);
        assert!(report.elapsed > Duration::ZERO);
    }

    #[tokio::test]
    async fn quick_mode_skips_pod_scheduling_only() {
        let mut mock = MockCommandRunner::new();
        mock.expect_run().returning(|_, _| Ok(ok_output("ok")));

        let kubeconfig = PathBuf::from("/tmp/kubeconfig");
        let ctx = CheckContext {
            runner: &mock,
            kubeconfig: &kubeconfig,
            policy: PollPolicy::fast(),
        };
        let report = run_pipeline(&ctx, true).await;

        let skipped: Vec<&str> = report
            .results
            .iter()
            .filter(|r| r.status == CheckStatus::Skip)
            .map(|r| r.name)
            .collect();
        assert_eq!(skipped, vec!["pod-scheduling"]);
    }

    #[test]
    fn check_kind_parses_from_cli_names() {
        assert_eq!(
            CheckKind::from_str("etcd-health").unwrap(),
            CheckKind::EtcdHealth
        );
        assert!(CheckKind::from_str("nonsense").is_err());
    }
}
