//! Unified shutdown handling for the ingestion service
//!
//! A single cancellation token fans out to every component; Ctrl+C cancels
//! it. Components guard their blocking waits with this token so shutdown
//! stays deterministic.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Create a cancellation token that fires on Ctrl+C.
///
/// The caller can also cancel the returned token directly for programmatic
/// shutdown.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();

    let trigger = token.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, initiating shutdown");
            trigger.cancel();
        }
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_cancel_propagates() {
        let token = shutdown_token();
        assert!(!token.is_cancelled());
        token.cancel();
        token.cancelled().await;
    }
}
