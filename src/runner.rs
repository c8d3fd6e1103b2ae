//! External tool execution behind a narrow contract.
//!
//! The certificate lifecycle drives an external PKI toolchain through this
//! seam. The trait is the whole contract: run a command inside an isolated
//! image environment bound to a host directory, return captured output,
//! optionally tolerate a non-zero exit.

use async_trait::async_trait;

use crate::error::{BootstrapError, Result};

/// One external tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    /// Image providing the tool environment.
    pub image: String,
    /// User id to run as inside the environment. `None` runs as the default.
    pub user_id: Option<String>,
    /// Working directory inside the environment.
    pub workdir: String,
    /// Command argv.
    pub args: Vec<String>,
    /// Bind mounts in `host:container:mode` form.
    pub binds: Vec<String>,
    /// When set, a non-zero exit still returns the captured output.
    pub ignore_errors: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the command to completion. No timeout or cancellation is modeled;
    /// the invocation either runs to completion or fails outright.
    async fn run(&self, cmd: ToolCommand) -> Result<ToolOutput>;
}

/// Runs tool commands through the `docker` CLI.
pub struct DockerRunner {
    binary: String,
}

impl DockerRunner {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    /// Use an alternative CLI binary (e.g. podman).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for DockerRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolRunner for DockerRunner {
    async fn run(&self, cmd: ToolCommand) -> Result<ToolOutput> {
        let mut command = tokio::process::Command::new(&self.binary);
        command.arg("run").arg("--rm");
        if let Some(user) = &cmd.user_id {
            command.arg("-u").arg(user);
        }
        command.arg("-w").arg(&cmd.workdir);
        for bind in &cmd.binds {
            command.arg("-v").arg(bind);
        }
        command.arg(&cmd.image);
        command.args(&cmd.args);

        tracing::debug!(
            "[DockerRunner] Running image {} with args {:?}",
            cmd.image,
            cmd.args
        );

        let output = command.output().await.map_err(|e| {
            BootstrapError::Runner(format!("Failed to launch {}: {}", self.binary, e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() && !cmd.ignore_errors {
            return Err(BootstrapError::Runner(format!(
                "Image {} exited with status {:?}: {}",
                cmd.image,
                output.status.code(),
                stderr.trim()
            )));
        }

        Ok(ToolOutput { stdout, stderr })
    }
}
