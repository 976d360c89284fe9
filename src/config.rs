use clap::{Args, Parser};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::Auth;

/// Upstream SOCKS5 authentication credentials
#[derive(Debug, Clone, Args)]
pub struct Auths {
    /// SOCKS5 username for the upstream circuit (optional)
    #[arg(short = 'u', long)]
    pub username: Option<String>,

    /// SOCKS5 password for the upstream circuit (optional)
    #[arg(short = 'P', long)]
    pub password: Option<String>,
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "HTTP proxy gateway over an upstream SOCKS5 circuit",
    long_about = "htsp accepts plain HTTP traffic (including CONNECT tunnels) on a local\n\
        address and relays it through an upstream SOCKS5 endpoint, so HTTP-only\n\
        clients can use a SOCKS5-only network path.\n\n\
        At startup the gateway blocks until the upstream endpoint is reachable,\n\
        optionally launching a local provider executable, and only then starts\n\
        accepting traffic."
)]
pub struct Cli {
    /// Local address to listen on for HTTP clients
    #[arg(long, default_value = "127.0.0.1:8080", value_name = "HOST:PORT")]
    pub listen: String,

    /// Upstream SOCKS5 address or hostname:port
    #[arg(long, default_value = "127.0.0.1:9050", value_name = "HOST:PORT")]
    pub socks: String,

    /// Enable verbose (debug) logging
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// File receiving one timestamped entry per failure
    #[arg(long = "error-log", default_value = "log.txt", value_name = "PATH")]
    pub error_log: PathBuf,

    /// Upstream provider executable launched if the endpoint is down
    /// (default: ./tor, ./tor.exe on Windows)
    #[arg(long = "upstream-exe", value_name = "PATH")]
    pub upstream_exe: Option<PathBuf>,

    /// Process name that identifies an already-running upstream provider
    #[arg(long = "upstream-process", default_value = "tor", value_name = "NAME")]
    pub upstream_process: String,

    /// Timeout in seconds for a whole forwarded upstream exchange
    #[arg(long = "upstream-timeout", default_value_t = 30)]
    pub upstream_timeout: u64,

    /// Upstream SOCKS5 authentication credentials
    #[command(flatten)]
    pub auth: Option<Auths>,
}

/// Gateway configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub socks_addr: SocketAddr,
    pub verbose: bool,
    pub error_log: PathBuf,
    pub upstream_exe: PathBuf,
    pub upstream_process: String,
    pub upstream_timeout: Duration,
    pub socks_auth: Option<Auth>,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub async fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let listen_addr = resolve_addr(&args.listen).await?;
        let socks_addr = resolve_addr(&args.socks).await?;

        let socks_auth = args.auth.as_ref().and_then(|a| match (&a.username, &a.password) {
            (Some(u), Some(p)) => Some(Auth::new(u.clone(), p.clone())),
            _ => None,
        });

        Ok(Self {
            listen_addr,
            socks_addr,
            verbose: args.verbose,
            error_log: args.error_log,
            upstream_exe: args.upstream_exe.unwrap_or_else(default_upstream_exe),
            upstream_process: args.upstream_process,
            upstream_timeout: Duration::from_secs(args.upstream_timeout),
            socks_auth,
        })
    }
}

async fn resolve_addr(hostport: &str) -> color_eyre::Result<SocketAddr> {
    match tokio::net::lookup_host(hostport).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => Ok(addr),
            None => Err(color_eyre::eyre::eyre!("No addresses found for {}", hostport)),
        },
        Err(e) => Err(color_eyre::eyre::eyre!("Failed to resolve {}: {}", hostport, e)),
    }
}

/// The provider executable is looked for in the working directory, mirroring
/// a bundle where the gateway and the provider ship side by side.
fn default_upstream_exe() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("tor.exe")
    } else {
        PathBuf::from("tor")
    }
}
