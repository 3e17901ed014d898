//! Bootstrap phase sequencer.
//!
//! Drives a cluster from nothing to a converged, externally reachable state:
//!
//! 1. Provisioning: the declarative backend's init/apply sequence
//! 2. ConvergingIdentity: add the resolved endpoint to every control-plane
//!    node's TLS SAN list and regenerate certificates
//! 3. ReconnectingFleet: best-effort restart dispatch to workers so they
//!    reconnect with the new certificates
//!
//! Provisioning failures are fatal with no automatic rollback; the on-disk
//! state is left intact for inspection or idempotent retry. Per-node
//! failures in the convergence phases are downgraded to warnings; the
//! installer on each node retries joining on its own, so losing
//! coordination with one node must not block the rest of the fleet.
//!
//! The sequencer runs single-threaded per cluster invocation; phases never
//! overlap for the same cluster.

use std::fmt;

use tracing::{info, warn};

use crate::cluster::{ClusterSpec, Endpoint, Fleet};
use crate::poll::PollPolicy;
use crate::provider::Provider;
use crate::remote::dispatch_fleet;
use crate::{Error, Result};

/// Lifecycle state of a bootstrap invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Nothing attempted yet
    Idle,
    /// Declarative provisioning in progress
    Provisioning,
    /// Infrastructure exists; fleet metadata available
    Provisioned,
    /// Updating control-plane TLS identity to the resolved endpoint
    ConvergingIdentity,
    /// Dispatching reconnect restarts to workers
    ReconnectingFleet,
    /// Bootstrap complete; convergence may still be in flight on workers
    Ready,
    /// Terminal failure; see the error's phase and cause
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "Idle",
            Phase::Provisioning => "Provisioning",
            Phase::Provisioned => "Provisioned",
            Phase::ConvergingIdentity => "ConvergingIdentity",
            Phase::ReconnectingFleet => "ReconnectingFleet",
            Phase::Ready => "Ready",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Outcome of a completed bootstrap run
#[derive(Debug)]
pub struct BootstrapReport {
    /// The endpoint the cluster is reachable on
    pub endpoint: Endpoint,
    /// Phases visited, in order
    pub phases: Vec<Phase>,
    /// Non-fatal problems collected along the way
    pub warnings: Vec<String>,
    /// The provisioned fleet
    pub fleet: Fleet,
}

/// Sequences the bootstrap phases for one cluster using a provider and its
/// remote command channel.
pub struct Sequencer<'a> {
    provider: &'a dyn Provider,
    policy: PollPolicy,
    phase: Phase,
    visited: Vec<Phase>,
}

impl<'a> Sequencer<'a> {
    /// Create a sequencer with the default per-node poll policy
    pub fn new(provider: &'a dyn Provider) -> Self {
        Self::with_policy(provider, PollPolicy::default())
    }

    /// Create a sequencer with an explicit poll policy
    pub fn with_policy(provider: &'a dyn Provider, policy: PollPolicy) -> Self {
        Self {
            provider,
            policy,
            phase: Phase::Idle,
            visited: Vec::new(),
        }
    }

    /// The current (or final) phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = %self.phase, to = %phase, "phase transition");
        self.phase = phase;
        self.visited.push(phase);
    }

    fn fail(&mut self, cause: Error) -> Error {
        let phase = self.phase;
        self.phase = Phase::Failed;
        warn!(%phase, error = %cause, "bootstrap failed");
        Error::in_phase(phase.to_string(), cause)
    }

    /// Run the full bootstrap sequence.
    ///
    /// The caller must have run `validate_config` first; the sequencer makes
    /// side-effecting calls from its first step.
    pub async fn run(&mut self, spec: &ClusterSpec) -> Result<BootstrapReport> {
        let mut warnings = Vec::new();

        self.enter(Phase::Provisioning);
        if let Err(e) = self.provider.provision(spec).await {
            // Fatal, no rollback: the partially-applied state stays on disk
            // for operator inspection or an idempotent retry.
            return Err(self.fail(e));
        }

        self.enter(Phase::Provisioned);
        let fleet = match self.provider.fleet(spec).await {
            Ok(fleet) => fleet,
            Err(e) => return Err(self.fail(e)),
        };

        let candidate = match self.provider.endpoint_candidate(spec).await {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!(error = %e, "endpoint candidate query failed; using leader address");
                warnings.push(format!("endpoint resolution failed: {}", e));
                None
            }
        };

        let leader_address = fleet.leader().address.clone();
        let endpoint = match candidate {
            Some(endpoint) if endpoint.host != leader_address => {
                self.converge_identity(&fleet, &endpoint, &mut warnings).await;
                self.reconnect_fleet(&fleet, &mut warnings).await;
                endpoint
            }
            Some(endpoint) => {
                // Candidate equals the address already baked into the node
                // certificates; nothing to converge.
                info!(endpoint = %endpoint, "endpoint matches leader address, skipping identity convergence");
                endpoint
            }
            None => {
                info!(leader = %leader_address, "no external endpoint configured, using leader address");
                Endpoint::new(leader_address)
            }
        };

        self.enter(Phase::Ready);
        info!(endpoint = %endpoint, warnings = warnings.len(), "cluster bootstrap complete");
        Ok(BootstrapReport {
            endpoint,
            phases: self.visited.clone(),
            warnings,
            fleet,
        })
    }

    /// Add the endpoint to every control-plane node's SAN list and restart
    /// the installer so certificates regenerate. Leader first, then
    /// followers; each node's outcome is evaluated independently and
    /// failures are downgraded to warnings.
    async fn converge_identity(
        &mut self,
        fleet: &Fleet,
        endpoint: &Endpoint,
        warnings: &mut Vec<String>,
    ) {
        self.enter(Phase::ConvergingIdentity);
        let script = tls_converge_script(endpoint);
        let targets = fleet.control_planes();

        let results = dispatch_fleet(
            self.provider.channel(),
            &targets,
            &script,
            Some(&self.policy),
        )
        .await;

        for dispatch in results {
            if !dispatch.succeeded() {
                let detail = match &dispatch.result {
                    Ok(outcome) => format!("{:?}", outcome),
                    Err(e) => e.to_string(),
                };
                warnings.push(format!(
                    "identity convergence on {}: {} (installer will retry on its own)",
                    dispatch.node.id, detail
                ));
            }
        }
    }

    /// Best-effort restart dispatch to every worker so they reconnect with
    /// the new certificates. Only dispatch is awaited, never completion;
    /// the caller is told convergence is in flight and may poll status
    /// separately. An empty worker list is a no-op.
    async fn reconnect_fleet(&mut self, fleet: &Fleet, warnings: &mut Vec<String>) {
        self.enter(Phase::ReconnectingFleet);
        let workers = fleet.workers();
        if workers.is_empty() {
            return;
        }

        let results = dispatch_fleet(
            self.provider.channel(),
            &workers,
            worker_reconnect_script(),
            None,
        )
        .await;

        for dispatch in results {
            if let Err(e) = &dispatch.result {
                warnings.push(format!(
                    "worker reconnect dispatch to {}: {}",
                    dispatch.node.id, e
                ));
            }
        }
    }
}

/// Script that appends the endpoint host to the installer's SAN list and
/// restarts it. Idempotent: a host already present is not appended again.
pub fn tls_converge_script(endpoint: &Endpoint) -> String {
    format!(
        r#"set -e
CONF=/etc/rancher/k3s/config.yaml
mkdir -p /etc/rancher/k3s
touch "$CONF"
if ! grep -q '{host}' "$CONF"; then
  grep -q '^tls-san:' "$CONF" || printf 'tls-san:\n' >> "$CONF"
  printf '  - "{host}"\n' >> "$CONF"
fi
systemctl restart k3s
"#,
        host = endpoint.host
    )
}

/// Script dispatched to workers so they pick up the regenerated
/// certificates; `--no-block` keeps the dispatch itself from waiting.
pub fn worker_reconnect_script() -> &'static str {
    "systemctl restart --no-block k3s-agent"
}
