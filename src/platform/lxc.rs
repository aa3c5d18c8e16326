use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::parse::{parse_addresses, parse_listing, parse_names};
use super::{ContainerPlatform, ShellCommand};
use crate::errors::{GatewayError, GatewayResult};
use crate::models::{ContainerAddress, ContainerListing, SandboxId};

/// Drives the `lxc` CLI. The command line may carry a wrapper such as
/// `sudo /snap/bin/lxc`.
#[derive(Clone, Debug)]
pub struct LxcPlatform {
    command: Vec<String>,
    prefix: String,
    base_image: String,
    command_timeout: Duration,
}

impl LxcPlatform {
    pub fn new(
        command_line: &str,
        prefix: impl Into<String>,
        base_image: impl Into<String>,
        command_timeout: Duration,
    ) -> Self {
        let mut command: Vec<String> = command_line
            .split_whitespace()
            .map(str::to_string)
            .collect();
        if command.is_empty() {
            command.push("lxc".to_string());
        }
        Self {
            command,
            prefix: prefix.into(),
            base_image: base_image.into(),
            command_timeout,
        }
    }

    /// The executable the command line starts with.
    pub fn program(&self) -> &str {
        &self.command[0]
    }

    fn render(&self, args: &[&str]) -> String {
        let mut parts: Vec<&str> = self.command.iter().map(String::as_str).collect();
        parts.extend_from_slice(args);
        parts.join(" ")
    }

    async fn run(&self, args: &[&str]) -> GatewayResult<String> {
        let rendered = self.render(args);
        let mut command = Command::new(&self.command[0]);
        command
            .args(&self.command[1..])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %rendered, "running platform command");
        let output = match timeout(self.command_timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(GatewayError::CommandTimedOut {
                    command: rendered,
                    timeout: self.command_timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(GatewayError::CommandFailed {
                command: rendered,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl ContainerPlatform for LxcPlatform {
    fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn address_of(&self, id: &SandboxId) -> Option<ContainerAddress> {
        let name = self.container_name(id);
        match self.run(&["list", &name, "--format", "csv", "-c", "n4"]).await {
            Ok(stdout) => parse_addresses(&stdout)
                .into_iter()
                .find(|(row, _)| *row == name)
                .and_then(|(_, address)| address),
            Err(err) => {
                warn!(sandbox = %id, %err, "address query failed");
                None
            }
        }
    }

    async fn exists(&self, id: &SandboxId) -> bool {
        let name = self.container_name(id);
        match self.run(&["list", &name, "--format", "csv", "-c", "n"]).await {
            Ok(stdout) => parse_names(&stdout).iter().any(|row| *row == name),
            Err(err) => {
                warn!(sandbox = %id, %err, "existence query failed");
                false
            }
        }
    }

    async fn launch(&self, id: &SandboxId) -> GatewayResult<()> {
        let name = self.container_name(id);
        info!(sandbox = %id, container = %name, image = %self.base_image, "launching container");
        self.run(&["launch", &self.base_image, &name]).await?;
        Ok(())
    }

    async fn list(&self) -> GatewayResult<Vec<ContainerListing>> {
        let stdout = self.run(&["list", "--format", "csv", "-c", "ns4"]).await?;
        Ok(parse_listing(&stdout, &self.prefix))
    }

    fn shell_command(&self, id: &SandboxId) -> ShellCommand {
        let mut shell = ShellCommand::new(self.command[0].clone());
        for arg in &self.command[1..] {
            shell = shell.arg(arg.clone());
        }
        shell
            .arg("exec")
            .arg(self.container_name(id))
            .arg("--env")
            .arg("TERM=xterm-256color")
            .arg("--")
            .arg("/bin/sh")
            .arg("-l")
    }
}
