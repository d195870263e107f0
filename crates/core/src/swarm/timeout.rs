//! # Timeout-Guarded Execution
//!
//! Runs a blocking worker call on its own named OS thread and waits for the
//! result for at most a fixed budget. When the budget runs out the caller
//! stops waiting; the thread keeps running detached and whatever it
//! eventually returns is dropped with the channel.

use anyhow::{Context, Result};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::error::ApiaryError;

/// Default budget for one research or review call
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Outcome of a guarded call that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guarded<T> {
    /// The call returned within its budget
    Completed(T),
    /// The budget ran out first
    TimedOut,
}

impl<T> Guarded<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Guarded::TimedOut)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `f` on a dedicated thread, waiting at most `timeout` for it
///
/// Errors returned by `f` come back unchanged. A panic inside `f` becomes
/// [`ApiaryError::WorkerPanicked`]. The thread holds nothing but `f` and
/// the sending half of a one-shot channel.
pub async fn run_with_timeout<T, F>(label: &str, timeout: Duration, f: F) -> Result<Guarded<T>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let thread_name: String = format!("apiary-{}", label)
        .chars()
        .filter(|c| *c != '\0')
        .collect();

    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(f));
            // Receiver is gone once the caller has timed out
            let _ = tx.send(outcome);
        })
        .with_context(|| format!("Failed to spawn worker thread for '{}'", label))?;

    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(Ok(result))) => result.map(Guarded::Completed),
        Ok(Ok(Err(payload))) => Err(ApiaryError::WorkerPanicked {
            label: label.to_string(),
            message: panic_message(payload.as_ref()),
        }
        .into()),
        Ok(Err(_)) => Err(ApiaryError::WorkerPanicked {
            label: label.to_string(),
            message: "worker exited without a result".to_string(),
        }
        .into()),
        Err(_) => {
            tracing::warn!("'{}' exceeded its {:?} budget, abandoning it", label, timeout);
            Ok(Guarded::TimedOut)
        }
    }
}
