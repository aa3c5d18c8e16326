//! Command-line and environment options shared by the binaries.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::builder::FalseyValueParser;
use clap::{Args, ValueEnum};
use tracing::warn;

use crate::cache::{connect_cache, AddressCache};
use crate::platform::LxcPlatform;
use crate::{DEFAULT_BASE_IMAGE, DEFAULT_CACHE_KEY_PREFIX, DEFAULT_CACHE_URL, DEFAULT_CONTAINER_PREFIX};

#[derive(Args, Debug, Clone)]
pub struct PlatformOptions {
    /// Container CLI, optionally with a wrapper (e.g. "sudo /snap/bin/lxc")
    #[arg(long, env = "SANDBOX_LXC_BIN", default_value = "lxc")]
    pub lxc_bin: String,
    /// Prefix of every sandbox container name
    #[arg(long, env = "SANDBOX_CONTAINER_PREFIX", default_value = DEFAULT_CONTAINER_PREFIX)]
    pub container_prefix: String,
    /// Image launched when a missing sandbox is auto-created
    #[arg(long, env = "LXD_BASE_IMAGE", default_value = DEFAULT_BASE_IMAGE)]
    pub base_image: String,
    /// Upper bound for a single container CLI invocation
    #[arg(long, env = "SANDBOX_COMMAND_TIMEOUT_MS", default_value_t = 5000)]
    pub command_timeout_ms: u64,
}

impl PlatformOptions {
    pub fn build(&self) -> LxcPlatform {
        let platform = LxcPlatform::new(
            &self.lxc_bin,
            self.container_prefix.clone(),
            self.base_image.clone(),
            Duration::from_millis(self.command_timeout_ms),
        );
        if which::which(platform.program()).is_err() {
            warn!(
                program = %platform.program(),
                "container CLI not found in PATH; sandbox lookups will report not found"
            );
        }
        platform
    }
}

#[derive(Args, Debug, Clone)]
pub struct CacheOptions {
    /// Address cache URL; "none" disables the cache
    #[arg(long, env = "SANDBOX_CACHE_URL", default_value = DEFAULT_CACHE_URL)]
    pub cache_url: String,
    /// How long to wait for the cache at startup before running without it
    #[arg(long, env = "SANDBOX_CACHE_CONNECT_TIMEOUT_MS", default_value_t = 2000)]
    pub cache_connect_timeout_ms: u64,
    /// Key namespace for cached addresses
    #[arg(long, env = "SANDBOX_CACHE_KEY_PREFIX", default_value = DEFAULT_CACHE_KEY_PREFIX)]
    pub cache_key_prefix: String,
}

impl CacheOptions {
    pub async fn connect(&self) -> Arc<dyn AddressCache> {
        connect_cache(
            Some(&self.cache_url),
            &self.cache_key_prefix,
            Duration::from_millis(self.cache_connect_timeout_ms),
        )
        .await
    }
}

#[derive(Args, Debug, Clone)]
pub struct ProxyOptions {
    /// Address the proxy binds to
    #[arg(long, env = "SANDBOX_PROXY_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,
    /// Port the proxy listens on
    #[arg(long, env = "SANDBOX_PROXY_PORT", default_value_t = crate::DEFAULT_PROXY_PORT)]
    pub port: u16,
    /// Port every sandbox container serves on
    #[arg(long, env = "CONTAINER_PORT", default_value_t = crate::DEFAULT_FORWARD_PORT)]
    pub forward_port: u16,
    /// Launch a container when a request names a sandbox that does not exist
    #[arg(long, env = "AUTO_CREATE_SANDBOX", value_parser = FalseyValueParser::new())]
    pub auto_create: bool,
    /// Wait after launching a container before asking for its address
    #[arg(long, env = "SANDBOX_SETTLE_MS", default_value_t = 2000)]
    pub settle_ms: u64,
    /// Accept connections from non-loopback peers
    #[arg(long, env = "ALLOW_REMOTE", value_parser = FalseyValueParser::new())]
    pub allow_remote: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Native pseudo-terminal; supports resize
    Pty,
    /// Plain stdio pipes; resize is not available
    Pipe,
}

#[derive(Args, Debug, Clone)]
pub struct TerminalOptions {
    /// Address the terminal server binds to
    #[arg(long, env = "GINTO_TERMINAL_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,
    /// Port the terminal server listens on
    #[arg(long, env = "GINTO_TERMINAL_PORT", default_value_t = crate::DEFAULT_PTY_PORT)]
    pub port: u16,
    /// Accept connections from non-loopback peers
    #[arg(long, env = "ALLOW_REMOTE", value_parser = FalseyValueParser::new())]
    pub allow_remote: bool,
    /// Shell used for host-mode sessions
    #[arg(long, env = "SANDBOX_HOST_SHELL", default_value = "/bin/bash")]
    pub host_shell: String,
    /// Working directory for host-mode sessions (defaults to $HOME)
    #[arg(long, env = "SANDBOX_WORKDIR")]
    pub workdir: Option<PathBuf>,
    /// Directory holding the deployed service; host shells never start inside it
    #[arg(long, env = "SANDBOX_CODE_DIR")]
    pub code_dir: Option<PathBuf>,
    /// Process transport for spawned shells
    #[arg(long, env = "SANDBOX_PTY_BACKEND", value_enum, default_value_t = BackendKind::Pty)]
    pub backend: BackendKind,
    /// Interval between output polls
    #[arg(long, env = "SANDBOX_POLL_MS", default_value_t = 50)]
    pub poll_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct LogOptions {
    /// Directory for daily rolling log files; stdout only when unset
    #[arg(long, env = "SANDBOX_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestProxy {
        #[command(flatten)]
        proxy: ProxyOptions,
        #[command(flatten)]
        platform: PlatformOptions,
    }

    #[test]
    fn proxy_defaults_are_safe() {
        let opts = TestProxy::try_parse_from(["sandbox-proxy"]).unwrap();
        assert_eq!(opts.proxy.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(opts.proxy.port, 3000);
        assert_eq!(opts.proxy.forward_port, 80);
        assert!(!opts.proxy.allow_remote);
        assert!(!opts.proxy.auto_create);
        assert_eq!(opts.platform.container_prefix, "ginto-sandbox-");
        assert_eq!(opts.platform.base_image, "ginto-sandbox");
    }

    #[test]
    fn flags_enable_features() {
        let opts = TestProxy::try_parse_from([
            "sandbox-proxy",
            "--auto-create",
            "--allow-remote",
            "--forward-port",
            "8080",
        ])
        .unwrap();
        assert!(opts.proxy.auto_create);
        assert!(opts.proxy.allow_remote);
        assert_eq!(opts.proxy.forward_port, 8080);
    }
}
