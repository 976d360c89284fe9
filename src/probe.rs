use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

/// Check whether a TCP endpoint accepts connections within `timeout`.
///
/// Only a fully completed connect counts as reachable: refusal, timeout and
/// unreachable-network all collapse to `false`. The transient socket is the
/// only side effect, and no error ever escapes to the caller.
pub async fn is_reachable(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
