//! HTTP control plane
//!
//! A small HTTP/1 surface next to the rsync listener: `POST /reload`
//! re-reads the config file and swaps the routing snapshot,
//! `GET /status` dumps the connection registry, and `GET /telegraf`
//! emits one InfluxDB line-protocol record. It shares nothing with
//! the rsync listener beyond the routing table and the registry.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::components::registry::ConnInfo;
use crate::error::{ProxyError, Result};
use crate::ServerCore;

const RELOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct ReloadResponse {
    message: &'static str,
}

#[derive(Serialize)]
struct StatusResponse {
    count: usize,
    connections: Vec<ConnInfo>,
}

/// Accept loop for the control listener. Returns when the shutdown
/// signal fires; an accept failure is fatal and bubbles up to the
/// server's run loop.
pub(crate) async fn serve(
    listener: TcpListener,
    core: Arc<ServerCore>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "(unknown)".to_string());

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = result.map_err(ProxyError::Io)?;
                debug!(peer_addr = %peer_addr, "control connection accepted");

                let core = Arc::clone(&core);
                let hostname = hostname.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req| {
                        handle_request(req, Arc::clone(&core), hostname.clone())
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(error = %e, "control connection error");
                    }
                });
            }
            _ = shutdown.recv() => {
                info!("control plane shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    core: Arc<ServerCore>,
    hostname: String,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::POST, "/reload") => reload(&core).await,
        (&Method::GET, "/status") => status(&core),
        (&Method::GET, "/telegraf") => telegraf(&core, &hostname),
        (_, "/reload" | "/status" | "/telegraf") => empty(StatusCode::METHOD_NOT_ALLOWED),
        _ => empty(StatusCode::NOT_FOUND),
    };
    Ok(response)
}

async fn reload(core: &Arc<ServerCore>) -> Response<Full<Bytes>> {
    match core.install_from_file().await {
        Ok(_) => {
            info!("config reloaded");
            json(
                StatusCode::OK,
                &ReloadResponse {
                    message: "Successfully reloaded",
                },
            )
        }
        Err(err) => {
            error!(error = %err, "failed to reload config");
            core.error_log.log(format_args!("load config: {err}"));
            json(
                StatusCode::INTERNAL_SERVER_ERROR,
                &ReloadResponse {
                    message: "Failed to reload config",
                },
            )
        }
    }
}

fn status(core: &Arc<ServerCore>) -> Response<Full<Bytes>> {
    let connections = core.registry.list();
    json(
        StatusCode::OK,
        &StatusResponse {
            count: connections.len(),
            connections,
        },
    )
}

fn telegraf(core: &Arc<ServerCore>, hostname: &str) -> Response<Full<Bytes>> {
    // Whole seconds, expressed in nanoseconds.
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let timestamp = secs as i64 * 1_000_000_000;
    let count = core.registry.active_count();
    let line = format!("rsync-proxy,host=\"{hostname}\" count={count} {timestamp}\n");

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(line)))
        .unwrap_or_default()
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_default()
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap_or_default()
}

/// One-shot reload request against a running proxy's control address.
/// Returns the HTTP status and the raw response body; the caller
/// decides where to print it.
pub async fn send_reload_request(http_addr: &str) -> Result<(u16, String)> {
    let uri: Uri = format!("http://{http_addr}/reload")
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::ReloadRequest {
            addr: http_addr.to_string(),
            reason: e.to_string(),
        })?;

    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::<Bytes>::default())
        .map_err(|e| ProxyError::ReloadRequest {
            addr: http_addr.to_string(),
            reason: e.to_string(),
        })?;

    let client: Client<_, Full<Bytes>> = Client::builder(TokioExecutor::new()).build_http();
    let response = tokio::time::timeout(RELOAD_REQUEST_TIMEOUT, client.request(request))
        .await
        .map_err(|_| ProxyError::ReloadRequest {
            addr: http_addr.to_string(),
            reason: "request timed out".to_string(),
        })?
        .map_err(|e| ProxyError::ReloadRequest {
            addr: http_addr.to_string(),
            reason: e.to_string(),
        })?;

    let status = response.status().as_u16();
    let body = response.into_body().collect().await?.to_bytes();
    Ok((status, String::from_utf8_lossy(&body).into_owned()))
}
