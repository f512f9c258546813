//! Loopback HTTP/CONNECT proxy bound to one pool entry
//!
//! Plain HTTP requests are classified: static assets dial the target
//! directly, everything else is forwarded through the entry's current
//! upstream credential. CONNECT tunnels are opaque and always go upstream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{ACCEPT, HOST, PROXY_AUTHORIZATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, instrument, warn};

use super::assets::is_static_asset;
use super::upstream::{
    basic_auth, connect_via_upstream, parse_authority, parse_target, run_tunnel,
};
use crate::error::{Result, SwivelError};
use crate::models::{materialize_template, UpstreamAddr};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request handler for one forwarder instance
pub struct Forwarder {
    entry_id: i64,
    credential_rx: watch::Receiver<String>,
}

impl Forwarder {
    pub fn new(entry_id: i64, credential_rx: watch::Receiver<String>) -> Self {
        Self {
            entry_id,
            credential_rx,
        }
    }

    /// The entry's current upstream, with sticky tokens materialized per dial
    fn upstream(&self) -> Result<UpstreamAddr> {
        let raw = self.credential_rx.borrow().clone();
        UpstreamAddr::parse(&materialize_template(&raw))
    }

    /// Handle an incoming proxy request
    #[instrument(skip(self, req), fields(entry_id = self.entry_id, method = %req.method(), uri = %req.uri()))]
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        if req.method() == Method::CONNECT {
            return self.handle_connect(req).await;
        }
        self.handle_http(req).await
    }

    /// CONNECT: no URL to classify, the tunnel always goes upstream
    async fn handle_connect(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let uri = req.uri().clone();
        let authority = uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_else(|| uri.to_string());
        let (target_host, target_port) = parse_authority(&authority)?;

        let upstream = self.upstream()?;
        let server = match tokio::time::timeout(
            CONNECT_TIMEOUT,
            connect_via_upstream(&upstream, &target_host, target_port),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(error = %e, "Upstream CONNECT failed");
                return Ok(error_response(StatusCode::BAD_GATEWAY, &e.to_string()));
            }
            Err(_) => {
                warn!("Upstream CONNECT timed out");
                return Ok(error_response(StatusCode::BAD_GATEWAY, "CONNECT timed out"));
            }
        };

        let entry_id = self.entry_id;
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let client = TokioIo::new(upgraded);
                    let _ = run_tunnel(entry_id, client, server).await;
                }
                Err(e) => debug!("CONNECT upgrade failed: {}", e),
            }
        });

        Ok(Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::new()))
            .unwrap())
    }

    /// Absolute-form HTTP: classify, then dial direct or through the upstream
    async fn handle_http(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let uri = req.uri().clone();
        let (target_host, target_port) = parse_target(&uri)?;

        let accept = req
            .headers()
            .get(ACCEPT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let static_asset = is_static_asset(uri.path(), uri.query(), accept.as_deref());

        let (parts, body) = req.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| SwivelError::Forwarder(format!("Failed to read body: {}", e)))?
            .to_bytes();

        if static_asset {
            debug!(host = %target_host, "Static asset, dialing direct");
            self.send_direct(&parts, body_bytes, &target_host, target_port)
                .await
        } else {
            self.send_via_upstream(&parts, body_bytes, &target_host, target_port)
                .await
        }
    }

    /// Dial the target itself, bypassing the upstream proxy
    async fn send_direct(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
        target_host: &str,
        target_port: u16,
    ) -> Result<Response<Full<Bytes>>> {
        let stream = dial(&format!("{}:{}", target_host, target_port)).await?;

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let host_header = if target_port == 80 {
            target_host.to_string()
        } else {
            format!("{}:{}", target_host, target_port)
        };

        let mut builder = Request::builder().method(parts.method.clone()).uri(path);
        for (name, value) in &parts.headers {
            if !is_hop_by_hop_header(name.as_str()) && name.as_str() != "host" {
                builder = builder.header(name, value);
            }
        }
        builder = builder.header(HOST, host_header);

        let request = builder
            .body(Full::new(body))
            .map_err(|e| SwivelError::Forwarder(format!("Failed to build request: {}", e)))?;

        forward_once(stream, request).await
    }

    /// Forward through the upstream proxy in absolute form
    async fn send_via_upstream(
        &self,
        parts: &http::request::Parts,
        body: Bytes,
        target_host: &str,
        target_port: u16,
    ) -> Result<Response<Full<Bytes>>> {
        let upstream = self.upstream()?;
        let stream = dial(&upstream.address).await?;

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri_str = if target_port == 80 {
            format!("http://{}{}", target_host, path)
        } else {
            format!("http://{}:{}{}", target_host, target_port, path)
        };

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri_str);
        for (name, value) in &parts.headers {
            if !is_hop_by_hop_header(name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        if let Some(auth) = basic_auth(&upstream) {
            builder = builder.header(PROXY_AUTHORIZATION, format!("Basic {}", auth));
        }

        let request = builder
            .body(Full::new(body))
            .map_err(|e| SwivelError::Forwarder(format!("Failed to build request: {}", e)))?;

        forward_once(stream, request).await
    }
}

async fn dial(addr: &str) -> Result<TcpStream> {
    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| SwivelError::ConnectFailed(format!("connect to {} timed out", addr)))?
        .map_err(|e| SwivelError::ConnectFailed(format!("connect to {} failed: {}", addr, e)))
}

/// Send one request over a fresh connection and buffer the response
async fn forward_once(
    stream: TcpStream,
    request: Request<Full<Bytes>>,
) -> Result<Response<Full<Bytes>>> {
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| SwivelError::Forwarder(format!("Handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Connection ended: {}", e);
        }
    });

    let response = tokio::time::timeout(REQUEST_TIMEOUT, sender.send_request(request))
        .await
        .map_err(|_| SwivelError::Forwarder("request timed out".to_string()))?
        .map_err(|e| SwivelError::Forwarder(format!("Request failed: {}", e)))?;

    let (parts, body) = response.into_parts();
    let body_bytes = body
        .collect()
        .await
        .map_err(|e| SwivelError::Forwarder(format!("Failed to read response: {}", e)))?
        .to_bytes();

    Ok(Response::from_parts(parts, Full::new(body_bytes)))
}

/// Accept loop for one forwarder instance
pub(super) async fn serve(
    listener: TcpListener,
    forwarder: Arc<Forwarder>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, _client_addr)) => {
                        let forwarder = forwarder.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, forwarder).await {
                                debug!("Forwarder connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Forwarder accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("Forwarder shutting down");
                    break;
                }
            }
        }
    }
}

/// Handle a single client connection
async fn handle_connection(stream: TcpStream, forwarder: Arc<Forwarder>) -> Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let forwarder = forwarder.clone();
        async move {
            match forwarder.handle(req).await {
                Ok(response) => Ok::<_, Infallible>(response),
                Err(e) => {
                    warn!("Forwarder request error: {}", e);
                    Ok(error_response(StatusCode::BAD_GATEWAY, &e.to_string()))
                }
            }
        }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(|e| SwivelError::Forwarder(e.to_string()))?;

    Ok(())
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap()
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "proxy-connection"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
