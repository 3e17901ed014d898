//! Subprocess execution boundary.
//!
//! Every external process strata touches (the provisioning tool, the AWS
//! CLI, ssh, kubectl) goes through [`CommandRunner`], so the sequencer,
//! channels, and validation pipeline can all be exercised against a fake
//! runner returning canned output without spawning anything.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::Result;

/// Captured result of a finished subprocess
#[derive(Clone, Debug)]
pub struct RunOutput {
    /// Process exit code; -1 when terminated by signal
    pub code: i32,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl RunOutput {
    /// Whether the process exited zero
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Executes a named external process and captures its output.
///
/// Implementations never interpret the output; policy lives in the callers.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a process to completion and capture its output
    async fn run(&self, program: &str, args: &[&str]) -> Result<RunOutput>;

    /// Run a process with the given bytes piped to stdin
    async fn run_with_stdin(&self, program: &str, args: &[&str], stdin: &str)
        -> Result<RunOutput>;
}

/// Real subprocess runner backed by `tokio::process`
#[derive(Clone, Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    /// Create a process runner
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<RunOutput> {
        debug!(program, ?args, "running command");
        let output = Command::new(program).args(args).output().await?;
        Ok(to_run_output(output))
    }

    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin: &str,
    ) -> Result<RunOutput> {
        debug!(program, ?args, stdin_bytes = stdin.len(), "running command with stdin");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut handle) = child.stdin.take() {
            handle.write_all(stdin.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        Ok(to_run_output(output))
    }
}

fn to_run_output(output: std::process::Output) -> RunOutput {
    RunOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

/// Check whether a tool is available on PATH
pub async fn tool_available(runner: &dyn CommandRunner, tool: &str) -> bool {
    runner
        .run("which", &[tool])
        .await
        .map(|out| out.success())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) use mock::MockCommandRunner;

/// Scripted stand-in for [`CommandRunner`].
///
/// Expectations are matched in registration order, first match wins; an
/// unmatched invocation panics with the offending command line. Built by
/// hand because the trait's borrowed slice arguments don't survive mock
/// generation.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    type RunMatcher = Box<dyn Fn(&str, &[&str]) -> bool + Send + Sync>;
    type RunResponder = Box<dyn Fn(&str, &[&str]) -> Result<RunOutput> + Send + Sync>;
    type StdinMatcher = Box<dyn Fn(&str, &[&str], &str) -> bool + Send + Sync>;
    type StdinResponder = Box<dyn Fn(&str, &[&str], &str) -> Result<RunOutput> + Send + Sync>;

    #[derive(Default)]
    pub(crate) struct MockCommandRunner {
        run: Vec<RunExpectation>,
        stdin: Vec<StdinExpectation>,
    }

    #[derive(Default)]
    pub(crate) struct RunExpectation {
        matcher: Option<RunMatcher>,
        responder: Option<RunResponder>,
    }

    impl RunExpectation {
        pub fn withf<F>(&mut self, f: F) -> &mut Self
        where
            F: Fn(&str, &[&str]) -> bool + Send + Sync + 'static,
        {
            self.matcher = Some(Box::new(f));
            self
        }

        pub fn returning<F>(&mut self, f: F) -> &mut Self
        where
            F: Fn(&str, &[&str]) -> Result<RunOutput> + Send + Sync + 'static,
        {
            self.responder = Some(Box::new(f));
            self
        }
    }

    #[derive(Default)]
    pub(crate) struct StdinExpectation {
        matcher: Option<StdinMatcher>,
        responder: Option<StdinResponder>,
    }

    impl StdinExpectation {
        pub fn withf<F>(&mut self, f: F) -> &mut Self
        where
            F: Fn(&str, &[&str], &str) -> bool + Send + Sync + 'static,
        {
            self.matcher = Some(Box::new(f));
            self
        }

        pub fn returning<F>(&mut self, f: F) -> &mut Self
        where
            F: Fn(&str, &[&str], &str) -> Result<RunOutput> + Send + Sync + 'static,
        {
            self.responder = Some(Box::new(f));
            self
        }
    }

    impl MockCommandRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn expect_run(&mut self) -> &mut RunExpectation {
            self.run.push(RunExpectation::default());
            self.run.last_mut().expect("just pushed")
        }

        pub fn expect_run_with_stdin(&mut self) -> &mut StdinExpectation {
            self.stdin.push(StdinExpectation::default());
            self.stdin.last_mut().expect("just pushed")
        }
    }

    #[async_trait]
    impl CommandRunner for MockCommandRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<RunOutput> {
            for expectation in &self.run {
                let matches = expectation
                    .matcher
                    .as_ref()
                    .map(|m| m(program, args))
                    .unwrap_or(true);
                if matches {
                    let responder = expectation
                        .responder
                        .as_ref()
                        .expect("expectation has no returning()");
                    return responder(program, args);
                }
            }
            panic!("unexpected command: {} {:?}", program, args);
        }

        async fn run_with_stdin(
            &self,
            program: &str,
            args: &[&str],
            stdin: &str,
        ) -> Result<RunOutput> {
            for expectation in &self.stdin {
                let matches = expectation
                    .matcher
                    .as_ref()
                    .map(|m| m(program, args, stdin))
                    .unwrap_or(true);
                if matches {
                    let responder = expectation
                        .responder
                        .as_ref()
                        .expect("expectation has no returning()");
                    return responder(program, args, stdin);
                }
            }
            panic!("unexpected stdin command: {} {:?}", program, args);
        }
    }
}

#[cfg(test)]
pub(crate) fn ok_output(stdout: &str) -> RunOutput {
    RunOutput {
        code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

#[cfg(test)]
pub(crate) fn failed_output(code: i32, stderr: &str) -> RunOutput {
    RunOutput {
        code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    }
}
