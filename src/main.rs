//! strata CLI - provision and converge Kubernetes control planes

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use strata::cluster::{ClusterSpec, Workspace};
use strata::ops;
use strata::provider::create_provider;
use strata::runner::ProcessRunner;
use strata::validate::{CheckKind, CheckStatus, Verdict};

/// strata - provision and converge Kubernetes control planes across backends
#[derive(Parser, Debug)]
#[command(name = "strata", version, about, long_about = None)]
struct Cli {
    /// Root directory for per-cluster provisioning state
    #[arg(long, env = "STRATA_STATE_ROOT", global = true)]
    state_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision infrastructure and converge the cluster to a reachable state
    Create(SpecArgs),

    /// Destroy the cluster's infrastructure
    Destroy(DestroyArgs),

    /// Fetch the credential bundle, patched to the resolved endpoint
    Kubeconfig(KubeconfigArgs),

    /// Show per-node readiness
    Status(SpecArgs),

    /// Run the health validation pipeline
    Validate(ValidateArgs),
}

#[derive(Parser, Debug)]
struct SpecArgs {
    /// Path to the cluster spec YAML file
    #[arg(short = 'f', long = "config")]
    config_file: PathBuf,
}

#[derive(Parser, Debug)]
struct DestroyArgs {
    #[command(flatten)]
    spec: SpecArgs,

    /// Also remove the on-disk provisioning state after a successful destroy
    #[arg(long)]
    purge_state: bool,
}

#[derive(Parser, Debug)]
struct KubeconfigArgs {
    #[command(flatten)]
    spec: SpecArgs,

    /// Write the bundle here instead of the workspace default
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ValidateArgs {
    #[command(flatten)]
    spec: SpecArgs,

    /// Skip the slow checks (pod scheduling)
    #[arg(long)]
    quick: bool,

    /// Run a single named check instead of the full pipeline
    #[arg(long)]
    check: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let workspace = match &cli.state_root {
        Some(root) => Workspace::new(root.clone()),
        None => Workspace::default_root()?,
    };
    let runner = Arc::new(ProcessRunner::new());

    match cli.command {
        Commands::Create(args) => {
            let spec = load_spec(&args.config_file)?;
            let provider = create_provider(&spec, workspace, runner)?;
            let report = ops::create_infrastructure(provider.as_ref(), &spec).await?;

            println!("cluster '{}' is ready", spec.name);
            println!("  endpoint: https://{}", report.endpoint);
            println!(
                "  nodes: {} control-plane, {} worker",
                report.fleet.control_planes().len(),
                report.fleet.workers().len()
            );
            for warning in &report.warnings {
                println!("  warning: {}", warning);
            }
        }
        Commands::Destroy(args) => {
            let spec = load_spec(&args.spec.config_file)?;
            let provider = create_provider(&spec, workspace, runner)?;
            ops::destroy_infrastructure(provider.as_ref(), &spec, args.purge_state).await?;
            println!("cluster '{}' destroyed", spec.name);
        }
        Commands::Kubeconfig(args) => {
            let spec = load_spec(&args.spec.config_file)?;
            let provider = create_provider(&spec, workspace, runner)?;
            let outcome =
                ops::get_kubeconfig(provider.as_ref(), &spec, args.output.as_deref()).await?;

            println!("{}", outcome.path.display());
            if let Some(warning) = outcome.warning {
                eprintln!("warning: {}", warning);
            }
        }
        Commands::Status(args) => {
            let spec = load_spec(&args.config_file)?;
            let provider = create_provider(&spec, workspace, runner)?;
            let status = ops::get_cluster_status(provider.as_ref(), &spec).await?;

            match &status.endpoint {
                Some(endpoint) => println!("cluster '{}' @ https://{}", status.cluster, endpoint),
                None => println!("cluster '{}' (endpoint unresolved)", status.cluster),
            }
            for node in &status.nodes {
                println!(
                    "  {:<24} {:<10} {:<16} {}",
                    node.name,
                    if node.ready { "Ready" } else { "NotReady" },
                    node.roles.join(","),
                    node.version
                );
            }
            if !status.all_ready() {
                std::process::exit(1);
            }
        }
        Commands::Validate(args) => {
            let spec = load_spec(&args.spec.config_file)?;
            let provider = create_provider(&spec, workspace, runner)?;

            if let Some(name) = &args.check {
                let kind: CheckKind = name.parse()?;
                let result = ops::validate_check(provider.as_ref(), &spec, kind).await?;
                print_check(&result);
                if result.status == CheckStatus::Fail {
                    std::process::exit(1);
                }
                return Ok(());
            }

            let report = ops::validate_cluster(provider.as_ref(), &spec, args.quick).await?;
            for result in &report.results {
                print_check(result);
            }
            println!("\n{} in {:.1}s", report.verdict, report.elapsed.as_secs_f64());
            if report.verdict == Verdict::Failed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load_spec(path: &PathBuf) -> anyhow::Result<ClusterSpec> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {}", path.display(), e))?;
    Ok(ClusterSpec::from_yaml(&content)?)
}

fn print_check(result: &strata::validate::CheckResult) {
    println!("  [{:<4}] {:<16} {}", result.status, result.name, result.message);
    if let Some(detail) = &result.detail {
        println!("         {:<16} {}", "", detail);
    }
}
