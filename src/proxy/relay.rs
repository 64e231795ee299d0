use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Copy bytes between two duplex streams until both directions finish.
/// Each direction runs independently; when one side's read half reaches
/// EOF the peer's write half is shut down (half-close), and the other
/// direction keeps draining. Returns (client→target, target→client)
/// byte counts, or the first I/O error.
pub async fn relay<A, B>(client: &mut A, target: &mut B) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + ?Sized,
    B: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let (to_target, to_client) = tokio::io::copy_bidirectional(client, target).await?;
    debug!(
        to_target = to_target,
        to_client = to_client,
        "relay finished"
    );
    Ok((to_target, to_client))
}
