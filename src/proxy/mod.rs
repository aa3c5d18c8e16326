//! Reverse proxy that routes each request to the container behind its sandbox.

mod forward;
pub mod identity;

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::errors::{ErrorBody, GatewayError, GatewayResult};
use crate::models::{HealthResponse, ProxyTarget, StatusResponse};
use crate::resolver::SandboxResolver;

pub use forward::BoxBody;
use forward::{error_response, forward_http, forward_upgrade, is_upgrade_request, json_response, HttpClient};
pub use identity::{extract_identity, Identity};

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    pub forward_port: u16,
    pub auto_create: bool,
    pub allow_remote: bool,
}

/// Both ends of an accepted client connection.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionInfo {
    pub remote: SocketAddr,
    pub local: SocketAddr,
}

pub(crate) fn is_loopback(ip: IpAddr) -> bool {
    ip.to_canonical().is_loopback()
}

pub struct Dispatcher {
    resolver: SandboxResolver,
    config: ProxyConfig,
    client: HttpClient,
}

impl Dispatcher {
    pub fn new(resolver: SandboxResolver, config: ProxyConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(5)));
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);
        Self {
            resolver,
            config,
            client,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Identity extraction plus resolution.
    pub async fn target_for(&self, uri: &Uri) -> GatewayResult<ProxyTarget> {
        let identity = extract_identity(uri).ok_or(GatewayError::MissingIdentity)?;
        let resolved = self
            .resolver
            .resolve(&identity.sandbox, self.config.auto_create)
            .await
            .ok_or_else(|| GatewayError::SandboxNotFound(identity.sandbox.to_string()))?;
        Ok(ProxyTarget {
            sandbox: identity.sandbox,
            address: resolved.address,
            port: self.config.forward_port,
            forward_path: identity.forward_path,
        })
    }

    /// Returns `Err` only for upgrade requests that cannot be served; the
    /// connection is then dropped since no structured reply makes sense.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        conn: ConnectionInfo,
    ) -> GatewayResult<Response<BoxBody>> {
        let upgrade = is_upgrade_request(&req);

        if !self.config.allow_remote && !is_loopback(conn.remote.ip()) {
            warn!(client = %conn.remote, "rejected remote connection");
            return if upgrade {
                Err(GatewayError::RemoteRejected)
            } else {
                Ok(error_response(&GatewayError::RemoteRejected))
            };
        }

        let target_str = req.uri().path_and_query().map(|pq| pq.as_str());
        match target_str {
            Some("/health") | Some("/_health") => return Ok(self.health()),
            Some("/status") | Some("/_status") => return Ok(self.status().await),
            _ => {}
        }

        let target = match self.target_for(req.uri()).await {
            Ok(target) => target,
            Err(err) if upgrade => {
                debug!(client = %conn.remote, uri = %req.uri(), %err, "dropping upgrade");
                return Err(err);
            }
            Err(err) => {
                debug!(client = %conn.remote, uri = %req.uri(), %err, "request not routable");
                return Ok(error_response(&err));
            }
        };

        info!(
            client = %conn.remote,
            method = %req.method(),
            sandbox = %target.sandbox,
            address = %target.address,
            path = %target.forward_path,
            upgrade,
            "proxy"
        );

        if upgrade {
            forward_upgrade(&self.client, req, &target, &conn).await
        } else {
            Ok(forward_http(&self.client, req, &target, &conn).await)
        }
    }

    fn health(&self) -> Response<BoxBody> {
        json_response(
            StatusCode::OK,
            &HealthResponse {
                status: "ok".to_string(),
                cache_connected: self.resolver.cache().is_connected(),
            },
        )
    }

    async fn status(&self) -> Response<BoxBody> {
        match self.resolver.platform().list().await {
            Ok(sandboxes) => json_response(StatusCode::OK, &StatusResponse { sandboxes }),
            Err(err) => {
                warn!(%err, "sandbox listing failed");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &ErrorBody {
                        error: "Failed to list sandboxes".to_string(),
                    },
                )
            }
        }
    }
}

/// Binds `dispatcher.config().listen` and serves until `shutdown` resolves.
/// Returns the bound address so callers can discover OS-assigned ports.
pub fn spawn_proxy<S>(
    dispatcher: Arc<Dispatcher>,
    mut shutdown: S,
) -> io::Result<(SocketAddr, JoinHandle<()>)>
where
    S: Future<Output = ()> + Send + 'static + Unpin,
{
    let std_listener = StdTcpListener::bind(dispatcher.config().listen)?;
    std_listener.set_nonblocking(true)?;
    let local = std_listener.local_addr()?;
    let listener = TcpListener::from_std(std_listener)?;

    let handle = tokio::spawn(async move {
        info!("proxy listening on {}", local);
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote)) => {
                            let dispatcher = dispatcher.clone();
                            let conn = ConnectionInfo { remote, local };
                            tokio::spawn(async move {
                                if let Err(err) = serve_client_stream(stream, conn, dispatcher).await {
                                    debug!(client = %remote, %err, "connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(%e, "accept error");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("shutting down proxy");
                    break;
                }
            }
        }
    });
    Ok((local, handle))
}

async fn serve_client_stream(
    stream: TcpStream,
    conn: ConnectionInfo,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), hyper::Error> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.handle(req, conn).await }
    });
    http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
}
