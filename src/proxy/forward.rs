use std::convert::Infallible;
use std::str::FromStr;

use bytes::Bytes;
use futures::future;
use http::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::io::{copy_bidirectional, AsyncWriteExt};
use tracing::{debug, error, warn};

use super::ConnectionInfo;
use crate::errors::{GatewayError, GatewayResult};
use crate::models::ProxyTarget;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;
pub(crate) type HttpClient = Client<HttpConnector, BoxBody>;

const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub(crate) fn full_body(b: impl Into<Bytes>) -> BoxBody {
    Full::new(b.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

pub(crate) fn incoming_to_box(b: Incoming) -> BoxBody {
    b.map_err(|e| -> BoxError { Box::new(e) }).boxed()
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

pub(crate) fn error_response(err: &GatewayError) -> Response<BoxBody> {
    json_response(err.status_code(), &err.body())
}

pub(crate) fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    if req.method() == Method::CONNECT {
        return false;
    }
    let has_conn_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_conn_upgrade && req.headers().contains_key(UPGRADE)
}

/// Removes RFC 7230 hop-by-hop headers, including any named by `Connection`.
pub(crate) fn strip_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Like [`strip_hop_by_hop_headers`] but keeps `Connection` and `Upgrade`,
/// which the upstream needs to switch protocols.
fn strip_for_upgrade(headers: &mut HeaderMap) {
    for name in HOP_HEADERS {
        if *name != "connection" && *name != "upgrade" {
            headers.remove(*name);
        }
    }
}

pub(crate) fn add_forwarded_headers(headers: &mut HeaderMap, conn: &ConnectionInfo) {
    let client_ip = conn.remote.ip().to_canonical().to_string();
    let forwarded_for = match headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
    {
        Some(prior) if !prior.is_empty() => format!("{prior}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", value);
    }
    if !headers.contains_key("x-forwarded-host") {
        if let Some(host) = headers.get(HOST).cloned() {
            headers.insert("x-forwarded-host", host);
        }
    }
    headers
        .entry("x-forwarded-proto")
        .or_insert(HeaderValue::from_static("http"));
    headers
        .entry("x-forwarded-port")
        .or_insert(HeaderValue::from(conn.local.port()));
}

fn upstream_uri(target: &ProxyTarget) -> GatewayResult<Uri> {
    Uri::from_str(&target.http_uri()).map_err(|err| {
        warn!(sandbox = %target.sandbox, %err, "invalid upstream uri");
        GatewayError::SandboxUnavailable
    })
}

/// Forwards a plain HTTP request. Transport failures become a 502.
pub(crate) async fn forward_http(
    client: &HttpClient,
    req: Request<Incoming>,
    target: &ProxyTarget,
    conn: &ConnectionInfo,
) -> Response<BoxBody> {
    let (mut parts, incoming) = req.into_parts();
    parts.uri = match upstream_uri(target) {
        Ok(uri) => uri,
        Err(err) => return error_response(&err),
    };
    parts.version = Version::HTTP_11;
    strip_hop_by_hop_headers(&mut parts.headers);
    add_forwarded_headers(&mut parts.headers, conn);

    let upstream_req = Request::from_parts(parts, incoming_to_box(incoming));
    match client.request(upstream_req).await {
        Ok(resp) => {
            let (mut parts, body) = resp.into_parts();
            strip_hop_by_hop_headers(&mut parts.headers);
            Response::from_parts(parts, incoming_to_box(body))
        }
        Err(err) => {
            error!(
                sandbox = %target.sandbox,
                upstream = %target.socket_addr(),
                %err,
                "upstream request failed"
            );
            error_response(&GatewayError::SandboxUnavailable)
        }
    }
}

/// Forwards an upgrade request and, once the upstream agrees to switch
/// protocols, tunnels raw bytes between the two upgraded connections.
/// An `Err` means the client connection should be dropped without a reply.
pub(crate) async fn forward_upgrade(
    client: &HttpClient,
    req: Request<Incoming>,
    target: &ProxyTarget,
    conn: &ConnectionInfo,
) -> GatewayResult<Response<BoxBody>> {
    let uri = upstream_uri(target)?;
    let (parts, incoming) = req.into_parts();

    let mut headers = parts.headers.clone();
    strip_for_upgrade(&mut headers);
    add_forwarded_headers(&mut headers, conn);

    let mut upstream_req = Request::new(incoming_to_box(incoming));
    *upstream_req.method_mut() = parts.method.clone();
    *upstream_req.uri_mut() = uri;
    *upstream_req.version_mut() = Version::HTTP_11;
    *upstream_req.headers_mut() = headers;

    let upstream_resp = client.request(upstream_req).await.map_err(|err| {
        warn!(
            sandbox = %target.sandbox,
            upstream = %target.socket_addr(),
            %err,
            "upstream upgrade failed"
        );
        GatewayError::SandboxUnavailable
    })?;

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(sandbox = %target.sandbox, status = %upstream_resp.status(), "upstream declined upgrade");
        let (parts, body) = upstream_resp.into_parts();
        return Ok(Response::from_parts(parts, incoming_to_box(body)));
    }

    let mut client_resp = Response::new(empty_body());
    *client_resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *client_resp.headers_mut() = upstream_resp.headers().clone();
    client_resp
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));

    let original_req = Request::from_parts(parts, ());
    let sandbox = target.sandbox.clone();
    tokio::spawn(async move {
        match future::try_join(
            hyper::upgrade::on(original_req),
            hyper::upgrade::on(upstream_resp),
        )
        .await
        {
            Ok((client_upgraded, upstream_upgraded)) => {
                let mut client_io = TokioIo::new(client_upgraded);
                let mut upstream_io = TokioIo::new(upstream_upgraded);
                match copy_bidirectional(&mut client_io, &mut upstream_io).await {
                    Ok((up, down)) => {
                        debug!(%sandbox, bytes_up = up, bytes_down = down, "tunnel closed")
                    }
                    Err(err) => debug!(%sandbox, %err, "tunnel ended with error"),
                }
                let _ = client_io.shutdown().await;
                let _ = upstream_io.shutdown().await;
            }
            Err(err) => warn!(%sandbox, %err, "upgrade handshake failed"),
        }
    });

    Ok(client_resp)
}
