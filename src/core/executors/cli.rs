use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use regex::Regex;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{AdapterOutput, ExecutorAdapter, InvokeRequest, QUOTA_EXIT_CODE};
use crate::core::config::ExecutorDef;
use crate::core::routing::estimate_tokens;

const DEFAULT_QUOTA_PATTERNS: &[&str] = &["quota", r"rate.?limit", "429", "resource exhausted"];

/// Exit code reported when the process outlives its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Runs a local CLI agent with the prompt on stdin.
pub struct CliAdapter {
    name: String,
    command: String,
    args: Vec<String>,
    quota_pattern: Regex,
    timeout: Duration,
}

impl CliAdapter {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        quota_patterns: &[String],
        timeout: Duration,
    ) -> Result<Self> {
        let patterns: Vec<&str> = if quota_patterns.is_empty() {
            DEFAULT_QUOTA_PATTERNS.to_vec()
        } else {
            quota_patterns.iter().map(String::as_str).collect()
        };
        let quota_pattern = Regex::new(&format!("(?i){}", patterns.join("|")))?;
        Ok(Self {
            name: name.into(),
            command: command.into(),
            args,
            quota_pattern,
            timeout,
        })
    }

    pub fn from_def(def: &ExecutorDef) -> Result<Self> {
        let ExecutorDef::Cli {
            name,
            command,
            args,
            quota_patterns,
            timeout_secs,
        } = def
        else {
            bail!("executor '{}' is not a cli executor", def.name());
        };
        Self::new(
            name.clone(),
            command.clone(),
            args.clone(),
            quota_patterns,
            Duration::from_secs(*timeout_secs),
        )
    }

    /// Non-zero exits whose output mentions quota are reported as quota failures.
    fn classify(&self, exit_code: i32, stdout: &str, stderr: &str) -> i32 {
        if exit_code == 0 || exit_code == QUOTA_EXIT_CODE {
            return exit_code;
        }
        if self.quota_pattern.is_match(stderr) || self.quota_pattern.is_match(stdout) {
            QUOTA_EXIT_CODE
        } else {
            exit_code
        }
    }
}

/// Stops the stdin writer once the invocation is over.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[async_trait]
impl ExecutorAdapter for CliAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: &InvokeRequest<'_>) -> Result<AdapterOutput> {
        let prompt = request.prompt();
        let started = Instant::now();

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        if let Some(model) = request.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(dir) = request.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(account) = request.account {
            cmd.env("SWITCHYARD_ACCOUNT", account);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(executor = %self.name, command = %self.command, "Spawning executor");
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("failed to spawn '{}': {}", self.command, e))?;
        // The write runs beside the wait so a child that never drains stdin
        // cannot hold the invocation past its timeout.
        let _writer = child.stdin.take().map(|mut stdin| {
            let bytes = prompt.clone().into_bytes();
            let name = self.name.clone();
            AbortOnDrop(tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&bytes).await {
                    warn!(executor = %name, "Writing prompt to stdin failed: {}", e);
                }
            }))
        });

        // Dropping the wait future kills the child (kill_on_drop).
        let waited = tokio::select! {
            res = tokio::time::timeout(self.timeout, child.wait_with_output()) => res,
            _ = request.cancel.cancelled() => {
                bail!("{} invocation cancelled", self.name);
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let output = match waited {
            Ok(output) => output?,
            Err(_) => {
                warn!(executor = %self.name, "Executor timed out after {:?}", self.timeout);
                return Ok(AdapterOutput {
                    output: format!("timed out after {}s", self.timeout.as_secs()),
                    exit_code: TIMEOUT_EXIT_CODE,
                    duration_ms,
                    input_tokens: estimate_tokens(&prompt),
                    output_tokens: 0,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let raw_code = output.status.code().unwrap_or(-1);
        let exit_code = self.classify(raw_code, &stdout, &stderr);
        let text = if exit_code == 0 || stderr.trim().is_empty() {
            stdout.clone()
        } else if stdout.trim().is_empty() {
            stderr
        } else {
            format!("{}\n{}", stderr.trim_end(), stdout)
        };

        Ok(AdapterOutput {
            input_tokens: estimate_tokens(&prompt),
            output_tokens: estimate_tokens(&stdout),
            output: text,
            exit_code,
            duration_ms,
        })
    }
}
