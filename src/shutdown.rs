//! Graceful shutdown coordinator.
//!
//! Listens for SIGINT (Ctrl+C), SIGTERM, and SIGHUP, then cancels a
//! [`tokio_util::sync::CancellationToken`] so running work can stop at its
//! next checkpoint. A second signal force-exits.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Install signal handlers and return a [`CancellationToken`] that is
/// cancelled on the first SIGINT / SIGTERM / SIGHUP.
pub(crate) fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let count = Arc::new(AtomicU32::new(0));

    let handler_token = token.clone();
    tokio::spawn(async move {
        #[cfg(unix)]
        let (mut sigterm, mut sighup) = {
            use tokio::signal::unix::{signal, SignalKind};
            match (
                signal(SignalKind::terminate()),
                signal(SignalKind::hangup()),
            ) {
                (Ok(term), Ok(hup)) => (term, hup),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::warn!(error = %e, "Could not register signal handlers; only Ctrl+C will stop the run");
                    wait_for_ctrl_c(&handler_token, &count).await;
                    return;
                }
            }
        };

        loop {
            #[cfg(unix)]
            {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                    _ = sighup.recv() => {}
                }
            }

            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_err() {
                    tracing::warn!("Could not listen for Ctrl+C");
                    return;
                }
            }

            on_signal(&handler_token, &count);
        }
    });

    token
}

#[cfg(unix)]
async fn wait_for_ctrl_c(token: &CancellationToken, count: &AtomicU32) {
    while tokio::signal::ctrl_c().await.is_ok() {
        on_signal(token, count);
    }
}

fn on_signal(token: &CancellationToken, count: &AtomicU32) {
    let prev = count.fetch_add(1, Ordering::SeqCst);
    if prev == 0 {
        tracing::info!("Received shutdown signal, stopping after the current step...");
        tracing::info!("Press Ctrl+C again to force exit");
        token.cancel();
    } else {
        tracing::warn!("Force exit requested");
        std::process::exit(130);
    }
}

/// Child of `parent` that is also cancelled once `budget` elapses.
///
/// Background invocations run under one of these so they stop when either
/// the user or the wall clock says so.
pub(crate) fn budget_token(parent: &CancellationToken, budget: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(budget) => {
                tracing::debug!(budget_secs = budget.as_secs(), "Background budget elapsed");
                timer.cancel();
            }
            _ = timer.cancelled() => {}
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_tokens_observe_parent_cancel() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    /// Signal delivery can't be safely tested in a shared test binary.
    #[tokio::test]
    async fn install_returns_live_token() {
        let token = install_signal_handler();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn budget_token_cancels_when_budget_elapses() {
        let parent = CancellationToken::new();
        let token = budget_token(&parent, Duration::from_millis(50));
        assert!(!token.is_cancelled());

        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
        assert!(token.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn budget_token_follows_parent() {
        let parent = CancellationToken::new();
        let token = budget_token(&parent, Duration::from_secs(3600));
        parent.cancel();
        assert!(token.is_cancelled());
    }
}
