use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sandbox_gateway::config::{LogOptions, PlatformOptions, TerminalOptions};
use sandbox_gateway::logging::init_tracing;
use sandbox_gateway::pty::target::safe_workdir;
use sandbox_gateway::shutdown::shutdown_signal;
use sandbox_gateway::{build_router, BridgeConfig, ContainerPlatform, PtyBridge};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "sandbox-pty",
    author,
    version,
    about = "Streams interactive shells (host or sandbox container) over WebSocket"
)]
struct Options {
    #[command(flatten)]
    terminal: TerminalOptions,
    #[command(flatten)]
    platform: PlatformOptions,
    #[command(flatten)]
    log: LogOptions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    let _guard = init_tracing(options.log.log_dir.as_deref(), "sandbox-pty.log");

    let code_dir = options
        .terminal
        .code_dir
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("/"));
    let workdir = safe_workdir(options.terminal.workdir.as_deref(), &code_dir);
    if options.terminal.workdir.as_deref() != Some(workdir.as_path()) {
        info!(workdir = %workdir.display(), "host shells start in fallback directory");
    }

    let platform: Arc<dyn ContainerPlatform> = Arc::new(options.platform.build());
    let config = BridgeConfig {
        allow_remote: options.terminal.allow_remote,
        host_shell: options.terminal.host_shell.clone(),
        workdir,
        backend: options.terminal.backend,
        poll_interval: Duration::from_millis(options.terminal.poll_ms.max(1)),
        termination_grace: Duration::from_secs(2),
    };
    if config.allow_remote {
        warn!("remote terminal connections are allowed");
    }

    let bridge = Arc::new(PtyBridge::new(platform, config));
    let app = build_router(bridge);

    let addr = SocketAddr::new(options.terminal.host, options.terminal.port);
    let listener = TcpListener::bind(addr).await?;
    info!("terminal server listening on ws://{}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
