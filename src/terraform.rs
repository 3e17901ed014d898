//! Driver for the declarative provisioning backend.
//!
//! Wraps the `terraform` binary's init / apply / destroy / output verbs over
//! a per-cluster working directory. The resource templates themselves are
//! backend-owned and opaque; this module only manages the working directory,
//! the generated variables file, and output queries.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use crate::cluster::TfVars;
use crate::runner::CommandRunner;
use crate::{Error, Result};

/// Name of the generated variables file
const TFVARS_FILE: &str = "strata.auto.tfvars";

/// Thin driver over the provisioning tool's CLI
#[derive(Clone)]
pub struct Terraform {
    runner: Arc<dyn CommandRunner>,
    binary: String,
}

impl Terraform {
    /// Create a driver using the `terraform` binary
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            binary: "terraform".to_string(),
        }
    }

    /// Initialise the working directory, seeding it from the backend's
    /// template module on first use.
    pub async fn init(&self, dir: &Path, module: &Path) -> Result<()> {
        let chdir = chdir_arg(dir);
        if dir.join("main.tf").exists() {
            info!(dir = %dir.display(), "initialising provisioning state");
            self.exec(&[&chdir, "init", "-input=false", "-no-color"]).await?;
        } else {
            let from_module = format!("-from-module={}", module.display());
            info!(dir = %dir.display(), module = %module.display(), "seeding provisioning state from module");
            self.exec(&[&chdir, "init", "-input=false", "-no-color", &from_module])
                .await?;
        }
        Ok(())
    }

    /// Apply the plan; any failure is fatal and leaves the state intact
    pub async fn apply(&self, dir: &Path) -> Result<()> {
        info!(dir = %dir.display(), "applying provisioning plan");
        self.exec(&[&chdir_arg(dir), "apply", "-auto-approve", "-input=false", "-no-color"])
            .await?;
        Ok(())
    }

    /// Destroy all managed resources
    pub async fn destroy(&self, dir: &Path) -> Result<()> {
        info!(dir = %dir.display(), "destroying provisioned resources");
        self.exec(&[&chdir_arg(dir), "destroy", "-auto-approve", "-input=false", "-no-color"])
            .await?;
        Ok(())
    }

    /// Query a single string-valued output
    pub async fn output_raw(&self, dir: &Path, name: &str) -> Result<String> {
        let out = self
            .exec(&[&chdir_arg(dir), "output", "-no-color", "-raw", name])
            .await?;
        Ok(out.trim().to_string())
    }

    /// Query a list-valued output
    pub async fn output_list(&self, dir: &Path, name: &str) -> Result<Vec<String>> {
        let out = self
            .exec(&[&chdir_arg(dir), "output", "-no-color", "-json", name])
            .await?;
        let values: Vec<String> = serde_json::from_str(out.trim()).map_err(|e| {
            Error::serialization(format!("output '{}' is not a string list: {}", name, e))
        })?;
        Ok(values)
    }

    /// Write the flat variables file consumed by the templates
    pub async fn write_vars(&self, dir: &Path, vars: &TfVars) -> Result<()> {
        let mut content = String::new();
        for (key, value) in vars {
            content.push_str(&format!("{} = {}\n", key, hcl_string(value)));
        }
        let path = dir.join(TFVARS_FILE);
        debug!(path = %path.display(), count = vars.len(), "writing provisioning variables");
        tokio::fs::write(&path, content).await?;
        Ok(())
    }

    async fn exec(&self, args: &[&str]) -> Result<String> {
        let out = self.runner.run(&self.binary, args).await?;
        if !out.success() {
            let verb = args.get(1).copied().unwrap_or_default();
            return Err(Error::backend(
                format!("{} {}", self.binary, verb),
                out.stderr.trim().to_string(),
            ));
        }
        Ok(out.stdout)
    }
}

fn chdir_arg(dir: &Path) -> String {
    format!("-chdir={}", dir.display())
}

/// Quote a value for the variables file; numbers and booleans pass through
fn hcl_string(value: &str) -> String {
    if value.parse::<i64>().is_ok() || value == "true" || value == "false" {
        value.to_string()
    } else {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    }
}
