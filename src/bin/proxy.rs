use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sandbox_gateway::config::{CacheOptions, LogOptions, PlatformOptions, ProxyOptions};
use sandbox_gateway::logging::init_tracing;
use sandbox_gateway::shutdown::shutdown_signal;
use sandbox_gateway::{spawn_proxy, ContainerPlatform, Dispatcher, ProxyConfig, SandboxResolver};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "sandbox-proxy",
    author,
    version,
    about = "Routes HTTP and WebSocket traffic to per-user sandbox containers"
)]
struct Options {
    #[command(flatten)]
    proxy: ProxyOptions,
    #[command(flatten)]
    platform: PlatformOptions,
    #[command(flatten)]
    cache: CacheOptions,
    #[command(flatten)]
    log: LogOptions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(options.log.log_dir.as_deref(), "sandbox-proxy.log");

    let platform: Arc<dyn ContainerPlatform> = Arc::new(options.platform.build());
    let cache = options.cache.connect().await;
    let resolver = SandboxResolver::new(
        cache,
        platform,
        Duration::from_millis(options.proxy.settle_ms),
    );

    let config = ProxyConfig {
        listen: SocketAddr::new(options.proxy.host, options.proxy.port),
        forward_port: options.proxy.forward_port,
        auto_create: options.proxy.auto_create,
        allow_remote: options.proxy.allow_remote,
    };
    if config.allow_remote {
        warn!("remote connections are allowed");
    }
    info!(
        forward_port = config.forward_port,
        auto_create = config.auto_create,
        base_image = %options.platform.base_image,
        "starting sandbox proxy"
    );

    let dispatcher = Arc::new(Dispatcher::new(resolver, config));
    let (addr, handle) = spawn_proxy(dispatcher, Box::pin(shutdown_signal()))?;
    info!("sandbox proxy ready on http://{}", addr);

    handle.await?;
    Ok(())
}
