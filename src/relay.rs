use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// At most one chunk is in flight per direction; a slow reader throttles the
/// opposite writer through the transport itself.
const CHUNK_SIZE: usize = 8192;

/// Bidirectionally copy bytes between two streams until either side closes.
///
/// A zero-length read is an orderly close of that side and ends the relay; a
/// write failure (broken pipe, reset) is treated the same way, as normal
/// termination rather than an application error. Cancelling the token ends
/// the relay promptly. Both streams are shut down exactly once on every exit
/// path. Returns the byte counts copied client->upstream and upstream->client.
///
/// There is no overall deadline: a tunnel lives as long as both peers keep it
/// open, which long-lived TLS sessions require. Stalled or hostile peers can
/// therefore hold a handling unit indefinitely until shutdown.
pub async fn relay<C, U>(
    mut client: C,
    mut upstream: U,
    cancel: &CancellationToken,
) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = [0u8; CHUNK_SIZE];
    let mut upstream_buf = [0u8; CHUNK_SIZE];
    let mut from_client = 0u64;
    let mut from_upstream = 0u64;

    loop {
        tokio::select! {
            res = client.read(&mut client_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = upstream.write_all(&client_buf[..n]).await {
                            debug!("tunnel upstream write ended: {}", e);
                            break;
                        }
                        from_client += n as u64;
                    }
                    Err(e) => {
                        debug!("tunnel client read ended: {}", e);
                        break;
                    }
                }
            }
            res = upstream.read(&mut upstream_buf) => {
                match res {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Err(e) = client.write_all(&upstream_buf[..n]).await {
                            debug!("tunnel client write ended: {}", e);
                            break;
                        }
                        from_upstream += n as u64;
                    }
                    Err(e) => {
                        debug!("tunnel upstream read ended: {}", e);
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                debug!("tunnel cancelled by shutdown");
                break;
            }
        }
    }

    if let Err(e) = upstream.shutdown().await {
        debug!("upstream shutdown: {}", e);
    }
    if let Err(e) = client.shutdown().await {
        debug!("client shutdown: {}", e);
    }

    (from_client, from_upstream)
}
