//! Boundary with the host's container runtime.

mod lxc;
pub mod parse;

use async_trait::async_trait;

use crate::errors::GatewayResult;
use crate::models::{ContainerAddress, ContainerListing, SandboxId};

pub use lxc::LxcPlatform;

/// Program plus arguments for an interactive shell.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Queries answer "no result" on any command failure; only `launch` and
/// `list` report errors, and callers log rather than surface them.
#[async_trait]
pub trait ContainerPlatform: Send + Sync + 'static {
    /// Naming prefix shared by every sandbox container.
    fn prefix(&self) -> &str;

    fn container_name(&self, id: &SandboxId) -> String {
        format!("{}{}", self.prefix(), id)
    }

    async fn address_of(&self, id: &SandboxId) -> Option<ContainerAddress>;

    async fn exists(&self, id: &SandboxId) -> bool;

    async fn launch(&self, id: &SandboxId) -> GatewayResult<()>;

    /// All containers carrying the naming prefix.
    async fn list(&self) -> GatewayResult<Vec<ContainerListing>>;

    /// Interactive shell inside the sandbox's container.
    fn shell_command(&self, id: &SandboxId) -> ShellCommand;
}
