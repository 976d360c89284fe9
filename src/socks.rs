use crate::auth::Auth;
use std::net::SocketAddr;
use tokio_socks::tcp::Socks5Stream;

/// Error type for SOCKS5 connection operations
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("SOCKS5 connection failed: {0}")]
    ConnectionFailed(#[from] tokio_socks::Error),
}

/// Result type for SOCKS5 operations
pub type SocksResult<T> = Result<T, SocksError>;

/// Opens upstream SOCKS5 sessions for forwarded requests and tunnels.
///
/// Every request and every tunnel negotiates a fresh session; nothing is
/// pooled or reused, so each caller owns its stream for the whole exchange.
#[derive(Debug)]
pub struct SocksConnector {
    socks_addr: SocketAddr,
    auth: Option<Auth>,
}

impl SocksConnector {
    pub fn new(socks_addr: SocketAddr, auth: Option<Auth>) -> Self {
        Self { socks_addr, auth }
    }

    /// Open a SOCKS5 stream to the target `host:port` through the upstream circuit.
    pub async fn connect(
        &self,
        target_addr: &str,
    ) -> SocksResult<Socks5Stream<tokio::net::TcpStream>> {
        match &self.auth {
            Some(auth) => Socks5Stream::connect_with_password(
                self.socks_addr,
                target_addr,
                &auth.username,
                &auth.password,
            )
            .await
            .map_err(Into::into),
            None => Socks5Stream::connect(self.socks_addr, target_addr)
                .await
                .map_err(Into::into),
        }
    }

    /// Get the upstream SOCKS5 server address
    #[allow(dead_code)]
    pub fn socks_addr(&self) -> SocketAddr {
        self.socks_addr
    }
}
