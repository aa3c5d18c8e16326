#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sandbox_gateway::models::{ContainerListing, RunState};
use sandbox_gateway::platform::ShellCommand;
use sandbox_gateway::{ContainerAddress, ContainerPlatform, GatewayError, GatewayResult, SandboxId};

/// Fixed set of running containers; nothing is ever launched.
pub struct StaticPlatform {
    addresses: HashMap<String, ContainerAddress>,
    pub queries: AtomicUsize,
}

impl StaticPlatform {
    pub fn new() -> Self {
        Self {
            addresses: HashMap::new(),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, id: &str, ip: Ipv4Addr) -> Self {
        self.addresses.insert(id.to_string(), ContainerAddress::from(ip));
        self
    }
}

#[async_trait]
impl ContainerPlatform for StaticPlatform {
    fn prefix(&self) -> &str {
        "test-sandbox-"
    }

    async fn address_of(&self, id: &SandboxId) -> Option<ContainerAddress> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.addresses.get(id.as_str()).copied()
    }

    async fn exists(&self, id: &SandboxId) -> bool {
        self.addresses.contains_key(id.as_str())
    }

    async fn launch(&self, id: &SandboxId) -> GatewayResult<()> {
        Err(GatewayError::CommandFailed {
            command: format!("launch {id}"),
            message: "launching is disabled".to_string(),
        })
    }

    async fn list(&self) -> GatewayResult<Vec<ContainerListing>> {
        let mut listings: Vec<_> = self
            .addresses
            .iter()
            .map(|(id, address)| ContainerListing {
                name: format!("{}{}", self.prefix(), id),
                run_state: RunState::Running,
                address: Some(*address),
            })
            .collect();
        listings.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(listings)
    }

    /// Stands in for `lxc exec`: announces itself, then echoes input.
    fn shell_command(&self, _id: &SandboxId) -> ShellCommand {
        ShellCommand::new("sh")
            .arg("-c")
            .arg("echo in-container; exec cat")
    }
}
