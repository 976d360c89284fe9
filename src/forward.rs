use std::time::Duration;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::socks::{SocksConnector, SocksError};

/// Headers that are meaningful for a single connection leg only and must not
/// cross the proxy boundary in either direction.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "proxy-connection",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("upstream exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Socks(#[from] SocksError),

    #[error("upstream HTTP exchange failed: {0}")]
    Http(#[from] hyper::Error),
}

pub(crate) fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Error responses close the connection: the gateway serves exactly one
/// logical exchange per accepted socket.
pub(crate) fn status_response(
    status: http::StatusCode,
    msg: &'static str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut resp = Response::new(full(msg));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    resp
}

pub(crate) fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.as_str() == *h)
}

/// Copy a header map minus the hop-by-hop set, preserving arrival order and
/// duplicate values.
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// A declared request body length. A malformed value is treated as "no body"
/// rather than failing the whole request.
fn declared_content_length(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(header::CONTENT_LENGTH)?;
    value.to_str().ok()?.trim().parse().ok()
}

/// The effective upstream target of a forwarded request.
#[derive(Debug)]
struct Target {
    /// Absolute URL put on the outbound request line.
    uri: Uri,
    /// `host[:port]` for a substitute Host header.
    host_header: String,
    /// `host:port` handed to the SOCKS5 connect.
    socks_authority: String,
}

/// Resolve the request target: an absolute URL is used as-is, an origin-form
/// path requires a Host header to combine with. Returns None for a client
/// protocol error (no upstream contact may be attempted).
fn resolve_target(uri: &Uri, headers: &HeaderMap) -> Option<Target> {
    let absolute = if uri.scheme().is_some() && uri.authority().is_some() {
        uri.clone()
    } else {
        let host = headers.get(header::HOST)?.to_str().ok()?.trim();
        if host.is_empty() {
            return None;
        }
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("http://{}{}", host, path).parse().ok()?
    };

    let authority = absolute.authority()?.clone();
    let port = absolute.port_u16().unwrap_or(80);
    Some(Target {
        socks_authority: format!("{}:{}", authority.host(), port),
        host_header: authority.as_str().to_string(),
        uri: absolute,
    })
}

/// Reconstruct the client's request as an absolute-URL request, issue it
/// through a fresh upstream SOCKS5 session and hand back the full response.
///
/// Redirects are never followed (the local client must see and re-issue them
/// itself) and the whole upstream exchange is bounded by `deadline`.
pub async fn forward(
    req: Request<Incoming>,
    connector: &SocksConnector,
    deadline: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
    let (parts, body) = req.into_parts();

    let Some(target) = resolve_target(&parts.uri, &parts.headers) else {
        debug!(
            "rejecting {} {} without absolute URL or Host header",
            parts.method, parts.uri
        );
        return Ok(status_response(
            http::StatusCode::BAD_REQUEST,
            "request target requires an absolute URL or a Host header",
        ));
    };
    debug!("forwarding {} {}", parts.method, target.uri);

    let body_bytes = match declared_content_length(&parts.headers) {
        Some(_) => body.collect().await?.to_bytes(),
        None => Bytes::new(),
    };

    let mut headers = strip_hop_by_hop(&parts.headers);
    // Re-derived by hyper from the body that is actually sent.
    headers.remove(header::CONTENT_LENGTH);
    if !headers.contains_key(header::HOST) {
        if let Ok(value) = HeaderValue::from_str(&target.host_header) {
            headers.insert(header::HOST, value);
        }
    }

    let mut out_req = Request::new(full(body_bytes));
    *out_req.method_mut() = parts.method.clone();
    *out_req.uri_mut() = target.uri.clone();
    *out_req.headers_mut() = headers;

    let exchange = async {
        let stream = connector.connect(&target.socks_authority).await?;
        let io = TokioIo::new(stream);

        let (mut sender, conn) = Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(io)
            .await?;
        tokio::task::spawn(async move {
            if let Err(err) = conn.await {
                debug!("upstream connection ended with error: {}", err);
            }
        });

        let resp = sender.send_request(out_req).await?;
        let (resp_parts, resp_body) = resp.into_parts();
        let resp_bytes = resp_body.collect().await?.to_bytes();
        Ok::<_, ForwardError>((resp_parts, resp_bytes))
    };
    let (resp_parts, resp_bytes) = tokio::time::timeout(deadline, exchange)
        .await
        .map_err(|_| ForwardError::Timeout(deadline))??;

    let mut resp = Response::new(full(resp_bytes));
    *resp.status_mut() = resp_parts.status;
    *resp.headers_mut() = strip_hop_by_hop(&resp_parts.headers);
    resp.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    Ok(resp)
}
