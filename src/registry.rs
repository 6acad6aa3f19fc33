//! The heartbeat-based service registry: an in-memory liveness table
//! exposed over a tiny HTTP surface, plus the heartbeat client that keeps
//! an entry alive.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::{OrpcError, Result};

/// Default path a [`Registry`] listens on, matching the Go implementation.
pub const DEFAULT_PATH: &str = "/Orpc/registry";

const SERVER_HEADER: &str = "X-Orpc-Server";
const SERVERS_HEADER: &str = "X-Orpc-Servers";

/// An in-memory liveness table: `addr -> last_heartbeat`.
///
/// `ttl == Duration::ZERO` disables expiry entirely, matching the original
/// semantics where a zero TTL means "never expire" (distinct from the
/// heartbeat interval's own "zero means default" meaning — the two are
/// never collapsed into one field).
pub struct Registry {
    servers: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl Registry {
    pub fn new(ttl: Duration) -> Arc<Registry> {
        Arc::new(Registry {
            servers: Mutex::new(HashMap::new()),
            ttl,
        })
    }

    fn record_heartbeat(&self, addr: String) {
        self.servers.lock().unwrap().insert(addr, Instant::now());
    }

    /// Snapshot of currently-alive addresses. Lazily evicts entries whose
    /// last heartbeat is older than `ttl` (unless `ttl` is zero).
    fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        if self.ttl != Duration::ZERO {
            let now = Instant::now();
            servers.retain(|_, last| now.saturating_duration_since(*last) < self.ttl);
        }
        let mut out: Vec<String> = servers.keys().cloned().collect();
        out.sort();
        out
    }

    /// Drives the HTTP server on `listener` until it is dropped or a fatal
    /// accept error occurs.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let registry = self.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let registry = registry.clone();
                    async move { handle(registry, req).await }
                });
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(%peer, error = %err, "registry connection closed");
                }
            });
        }
    }
}

async fn handle(
    registry: Arc<Registry>,
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    if req.uri().path() != DEFAULT_PATH {
        return Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap());
    }
    let response = match *req.method() {
        Method::GET => {
            let servers = registry.alive_servers();
            Response::builder()
                .status(StatusCode::OK)
                .header(SERVERS_HEADER, servers.join(","))
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
        Method::POST => match req.headers().get(SERVER_HEADER) {
            Some(value) => match value.to_str() {
                Ok(addr) => {
                    registry.record_heartbeat(addr.to_string());
                    Response::builder()
                        .status(StatusCode::OK)
                        .body(Full::new(Bytes::new()))
                        .unwrap()
                }
                Err(_) => bad_request(),
            },
            None => bad_request(),
        },
        _ => {
            warn!(method = %req.method(), "registry: unsupported verb");
            Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
    };
    Ok(response)
}

fn bad_request() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// The interval a heartbeat loop should use when the caller did not
/// specify one explicitly: `ttl - 1s`, clamped to zero.
pub fn default_interval(ttl: Duration) -> Duration {
    ttl.saturating_sub(Duration::from_secs(1))
}

/// Sends one heartbeat POST immediately, then one per `interval` tick,
/// stopping permanently (returning the error) on the first failure. There
/// is no retry: a transient outage drops the server from the registry
/// until an external supervisor restarts this loop.
pub async fn run_heartbeat(registry_url: String, own_addr: String, interval: Duration) -> Result<()> {
    let client = reqwest::Client::new();
    post_heartbeat(&client, &registry_url, &own_addr).await?;

    // tokio::time::interval panics on a zero duration; default_interval can
    // return zero for a sub-second ttl, so clamp here rather than there.
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.tick().await; // first tick fires immediately; the initial POST above already covered it
    loop {
        ticker.tick().await;
        post_heartbeat(&client, &registry_url, &own_addr).await?;
    }
}

async fn post_heartbeat(client: &reqwest::Client, registry_url: &str, own_addr: &str) -> Result<()> {
    let response = client
        .post(registry_url)
        .header(SERVER_HEADER, own_addr)
        .send()
        .await
        .map_err(|e| OrpcError::Other(Box::new(e)))?;
    if !response.status().is_success() {
        return Err(OrpcError::Protocol(format!(
            "heartbeat rejected with status {}",
            response.status()
        )));
    }
    Ok(())
}
