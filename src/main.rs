mod auth;
mod config;
mod forward;
mod probe;
mod relay;
mod sink;
mod socks;
mod supervisor;
#[cfg(test)]
mod testutil;

use crate::config::{Cli, ProxyConfig};
use crate::forward::{empty, status_response, ForwardError};
use crate::sink::ErrorSink;
use crate::socks::SocksConnector;
use crate::supervisor::{ReadinessWatch, Supervisor};
use clap::Parser;
use color_eyre::eyre::Result;

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::ext::ReasonPhrase;
use hyper::header::HeaderValue;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};

use hyper_util::rt::TokioIo;

/// Identification header value on CONNECT handshake responses.
const PROXY_AGENT: &str = "htsp/0.1";

/// Process-wide context shared by every connection handler.
pub(crate) struct Gateway {
    pub(crate) config: Arc<ProxyConfig>,
    pub(crate) connector: Arc<SocksConnector>,
    pub(crate) sink: Arc<ErrorSink>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();
    let config = Arc::new(ProxyConfig::from_cli(args).await?);

    let default_filter = if config.verbose { "htsp=debug" } else { "htsp=info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let sink = Arc::new(ErrorSink::open(&config.error_log)?);
    let connector = Arc::new(SocksConnector::new(
        config.socks_addr,
        config.socks_auth.clone(),
    ));

    // Graceful shutdown signal handling
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            signal::ctrl_c()
                .await
                .expect("Failed to install CTRL+C handler");
            info!("shutdown signal received");
            cancel.cancel();
        });
    }

    // Block until the upstream circuit is certified reachable; no traffic is
    // accepted before that.
    let mut supervisor = Supervisor::new(
        config.socks_addr,
        config.upstream_exe.clone(),
        config.upstream_process.clone(),
    );
    let readiness = supervisor.watch();
    supervisor.ensure_upstream_ready(&cancel).await;
    if cancel.is_cancelled() {
        info!("exiting before the upstream became ready");
        return Ok(());
    }

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!(
        "HTTP gateway listening on http://{} -> SOCKS5 {}",
        config.listen_addr, config.socks_addr
    );

    let gateway = Arc::new(Gateway {
        config,
        connector,
        sink,
    });
    serve(listener, gateway, readiness, cancel).await;
    info!("gateway shut down");

    Ok(())
}

/// Accept loop: one spawned handling unit per inbound connection, each
/// serving exactly one logical exchange. Held shut until the readiness gate
/// opens, and drained by cancelling the token.
pub(crate) async fn serve(
    listener: TcpListener,
    gateway: Arc<Gateway>,
    mut readiness: ReadinessWatch,
    cancel: CancellationToken,
) {
    tokio::select! {
        res = readiness.ready() => {
            if res.is_err() {
                return;
            }
        }
        _ = cancel.cancelled() => return,
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("listener shutting down");
                break;
            }
            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    let gateway = gateway.clone();
                    let cancel = cancel.clone();
                    tokio::task::spawn(async move {
                        let io = TokioIo::new(stream);
                        let gw = gateway.clone();
                        let token = cancel.clone();
                        let service = service_fn(move |req| proxy(req, gw.clone(), token.clone()));

                        if let Err(err) = http1::Builder::new()
                            .preserve_header_case(true)
                            .title_case_headers(true)
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            debug!("connection from {} ended: {}", peer_addr, err);
                            gateway.sink.record("connection handler failed", &err);
                        }
                    });
                }
                Err(e) => {
                    warn!("accept error: {} (continuing)", e);
                }
            }
        }
    }
}

/// Route one parsed request: CONNECT becomes an opaque tunnel, everything
/// else is reconstructed and forwarded. A failing handler never affects any
/// other connection.
async fn proxy(
    req: Request<hyper::body::Incoming>,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) -> std::result::Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if Method::CONNECT == req.method() {
        let Some(authority) = connect_authority(req.uri()) else {
            warn!("CONNECT target is not host:port: {:?}", req.uri());
            return Ok(status_response(
                http::StatusCode::BAD_REQUEST,
                "CONNECT target must be host:port",
            ));
        };

        // The upstream session is negotiated before the handshake response,
        // so a failed circuit never produces a half-open tunnel.
        match gateway.connector.connect(&authority).await {
            Ok(upstream) => {
                let sink = gateway.sink.clone();
                tokio::task::spawn(async move {
                    match hyper::upgrade::on(req).await {
                        Ok(upgraded) => {
                            let client = TokioIo::new(upgraded);
                            let (sent, received) = relay::relay(client, upstream, &cancel).await;
                            debug!(
                                "tunnel to {} closed ({} bytes out, {} bytes in)",
                                authority, sent, received
                            );
                        }
                        Err(e) => sink.record("CONNECT upgrade failed", &e),
                    }
                });

                let mut resp = Response::new(empty());
                resp.extensions_mut()
                    .insert(ReasonPhrase::from_static(b"Connection Established"));
                resp.headers_mut()
                    .insert("proxy-agent", HeaderValue::from_static(PROXY_AGENT));
                Ok(resp)
            }
            Err(e) => {
                gateway.sink.record(
                    &format!("SOCKS5 connect for CONNECT {} failed", authority),
                    &e,
                );
                Ok(status_response(
                    http::StatusCode::BAD_GATEWAY,
                    "upstream SOCKS5 connect failed",
                ))
            }
        }
    } else {
        let timeout = gateway.config.upstream_timeout;
        match forward::forward(req, &gateway.connector, timeout).await {
            Ok(resp) => Ok(resp),
            Err(err @ ForwardError::Timeout(_)) => {
                gateway.sink.record("forwarded request timed out", &err);
                Ok(status_response(
                    http::StatusCode::GATEWAY_TIMEOUT,
                    "upstream request timed out",
                ))
            }
            Err(err) => {
                gateway.sink.record("forwarded request failed", &err);
                Ok(status_response(
                    http::StatusCode::BAD_GATEWAY,
                    "upstream request failed",
                ))
            }
        }
    }
}

/// CONNECT targets must be an explicit `host:port` pair.
fn connect_authority(uri: &http::Uri) -> Option<String> {
    let authority = uri.authority()?;
    authority.port_u16()?;
    Some(authority.to_string())
}
