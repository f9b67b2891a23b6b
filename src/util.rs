use n0_error::{Result, StackResultExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

pub(crate) use self::peek::PeekBuffer;

mod peek;

/// Bidirectionally forward data between a client reader/writer pair and a
/// backend reader/writer pair.
///
/// Each direction runs until EOF and then shuts down its write side. Returns
/// the byte counts forwarded (client-to-backend, backend-to-client).
pub(crate) async fn forward_bidi(
    client_recv: &mut (impl AsyncRead + Send + Unpin),
    client_send: &mut (impl AsyncWrite + Send + Unpin),
    backend_recv: &mut (impl AsyncRead + Send + Unpin),
    backend_send: &mut (impl AsyncWrite + Send + Unpin),
) -> Result<(u64, u64)> {
    let (up, down) = tokio::join!(
        async {
            let res = tokio::io::copy(client_recv, backend_send).await;
            backend_send.shutdown().await.ok();
            trace!(?res, "client-to-backend finished");
            res
        },
        async {
            let res = tokio::io::copy(backend_recv, client_send).await;
            client_send.shutdown().await.ok();
            trace!(?res, "backend-to-client finished");
            res
        }
    );
    let up = up.context("failed to copy client-to-backend")?;
    let down = down.context("failed to copy backend-to-client")?;
    Ok((up, down))
}
