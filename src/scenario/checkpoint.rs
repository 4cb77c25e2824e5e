//! Human-in-the-loop checkpoints, e.g. approving a PayPal payment in a browser.

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Blocks a scenario until something outside the harness says go.
///
/// `wait` has no timeout. Returning `false` declines; the dependent steps are
/// then reported as skipped.
pub trait ExternalSignal: Send + Sync {
    fn wait<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, bool>;
}

/// Waits for ENTER on stdin. EOF or a read error declines.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinSignal;

impl ExternalSignal for StdinSignal {
    fn wait<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            println!("\n=== approval required ===\n{}\npress ENTER to continue", prompt);
            let mut line = String::new();
            match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
                Ok(read) => read > 0,
                Err(err) => {
                    tracing::warn!(error = %err, "stdin unavailable, declining checkpoint");
                    false
                }
            }
        })
    }
}

/// Declines every checkpoint. Used for unattended runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipSignal;

impl ExternalSignal for SkipSignal {
    fn wait<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, bool> {
        tracing::info!(prompt, "checkpoint declined (non-interactive run)");
        Box::pin(async { false })
    }
}
