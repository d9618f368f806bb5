// src/timeout.rs
//! Bounded race helpers.
//!
//! Two flavours are provided:
//!
//! - [`with_timeout`] races the operation against a timer and drops (cancels) it when the
//!   timer wins.
//! - [`race_detached`] spawns the operation onto the runtime first. When the timer wins,
//!   the caller gets [`RaceError::TimedOut`] but the task keeps running to completion, so
//!   any side effects it performs (cache fills, health counters) still land afterwards.

use std::future::Future;
use std::time::Duration;

use log::debug;

#[derive(Debug, thiserror::Error)]
pub enum RaceError {
    #[error("operation timed out after {after:?}")]
    TimedOut { after: Duration },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
    #[error("detached operation aborted: {0}")]
    Aborted(String),
}

impl RaceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, RaceError::TimedOut { .. })
    }
}

/// Runs `operation` against a timer of `limit`; whichever settles first wins.
/// The losing operation is dropped.
pub async fn with_timeout<T, F>(operation: F, limit: Duration) -> Result<T, RaceError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result.map_err(RaceError::Failed),
        Err(_) => Err(RaceError::TimedOut { after: limit }),
    }
}

/// Spawns `operation` and races its handle against a timer.
///
/// On timeout the spawned task is NOT cancelled; its result is simply ignored.
pub async fn race_detached<T, F>(operation: F, limit: Duration) -> Result<T, RaceError>
where
    F: Future<Output = anyhow::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(operation);
    match tokio::time::timeout(limit, handle).await {
        Ok(Ok(result)) => result.map_err(RaceError::Failed),
        Ok(Err(join_error)) => Err(RaceError::Aborted(join_error.to_string())),
        Err(_) => {
            debug!("detached operation still running after {:?}", limit);
            Err(RaceError::TimedOut { after: limit })
        }
    }
}
