//! In-process fixtures shared by the unit tests: a minimal SOCKS5 server, a
//! canned HTTP origin, and a fully wired gateway harness.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{Cli, ProxyConfig};
use crate::sink::ErrorSink;
use crate::socks::SocksConnector;
use crate::supervisor::Supervisor;
use crate::{serve, Gateway};
use clap::Parser;

/// Echo every received byte back until the peer closes.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
                let _ = wr.shutdown().await;
            });
        }
    });
    addr
}

/// Accept connections, swallow whatever arrives and never answer.
pub async fn spawn_blackhole_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
            });
        }
    });
    addr
}

/// Minimal no-auth SOCKS5 server. Literal IPv4 targets are connected as
/// requested; domain targets are all routed to `default_target`.
pub async fn spawn_socks5_stub(default_target: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(requested) = socks5_accept(&mut stream).await else {
                    return;
                };
                let dest = requested.unwrap_or(default_target);
                let Ok(mut upstream) = TcpStream::connect(dest).await else {
                    return;
                };
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
            });
        }
    });
    addr
}

/// Drive the greeting and connect request, reply with success.
/// Returns the literal IPv4 target if the client asked for one.
async fn socks5_accept(stream: &mut TcpStream) -> io::Result<Option<SocketAddr>> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[0x05, 0x00]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    let requested = match request[3] {
        0x01 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            Some(SocketAddr::from((addr, u16::from_be_bytes(port))))
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            let mut port = [0u8; 2];
            stream.read_exact(&mut port).await?;
            None
        }
        0x04 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await?;
            None
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported ATYP {}", other),
            ))
        }
    };
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(requested)
}

/// Canned HTTP origin capturing every request it receives.
pub struct Origin {
    pub addr: SocketAddr,
    pub requests: mpsc::UnboundedReceiver<String>,
}

pub async fn spawn_http_origin(response: &'static str) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                if let Some(request) = read_http_message(&mut stream).await {
                    let _ = tx.send(request);
                    let _ = stream.write_all(response.as_bytes()).await;
                }
                let _ = stream.shutdown().await;
            });
        }
    });
    Origin { addr, requests: rx }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Read one HTTP request: head plus any Content-Length body.
async fn read_http_message(stream: &mut TcpStream) -> Option<String> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    let head_end = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(String::from_utf8_lossy(&buf).into_owned())
}

/// A gateway wired to a live SOCKS5 endpoint, serving on an ephemeral port.
pub struct GatewayHarness {
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
    pub error_log: PathBuf,
    _log_dir: TempDir,
}

/// Start a gateway whose SOCKS5 stub routes domain targets to `origin`.
pub async fn start_gateway(origin: SocketAddr, timeout_secs: u64) -> GatewayHarness {
    let socks = spawn_socks5_stub(origin).await;
    start_gateway_with_socks(socks, timeout_secs).await
}

/// Start a gateway against an arbitrary SOCKS5 address, which must be
/// accepting connections while the supervisor certifies readiness.
pub async fn start_gateway_with_socks(socks: SocketAddr, timeout_secs: u64) -> GatewayHarness {
    let log_dir = tempfile::tempdir().unwrap();
    let error_log = log_dir.path().join("log.txt");

    let socks_arg = socks.to_string();
    let timeout_arg = timeout_secs.to_string();
    let cli = Cli::parse_from([
        "htsp",
        "--socks",
        socks_arg.as_str(),
        "--error-log",
        error_log.to_str().unwrap(),
        "--upstream-timeout",
        timeout_arg.as_str(),
        "--upstream-process",
        "no-such-upstream-process",
    ]);
    let config = Arc::new(ProxyConfig::from_cli(cli).await.unwrap());
    let sink = Arc::new(ErrorSink::open(&config.error_log).unwrap());
    let connector = Arc::new(SocksConnector::new(
        config.socks_addr,
        config.socks_auth.clone(),
    ));

    let cancel = CancellationToken::new();
    let mut supervisor = Supervisor::new(
        config.socks_addr,
        PathBuf::from("does-not-exist"),
        config.upstream_process.clone(),
    )
    .with_poll_interval(Duration::from_millis(25));
    let readiness = supervisor.watch();
    supervisor.ensure_upstream_ready(&cancel).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let gateway = Arc::new(Gateway {
        config,
        connector,
        sink,
    });
    tokio::spawn(serve(listener, gateway, readiness, cancel.clone()));

    GatewayHarness {
        addr,
        cancel,
        error_log,
        _log_dir: log_dir,
    }
}

/// Send one raw request and collect everything until the gateway closes.
pub async fn http_exchange(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Read a response head byte-wise up to the blank line.
pub async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
    }
    String::from_utf8_lossy(&buf).into_owned()
}
