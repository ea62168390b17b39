//! Cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::AlsError;

/// Shared flag checked between entity solves, half-iterations and selection
/// candidates. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Trip the flag from a background thread once `limit` has elapsed.
    pub fn cancel_after(&self, limit: Duration) {
        let handle = self.clone();
        thread::spawn(move || {
            thread::sleep(limit);
            log::warn!("time limit of {:.1}s reached, cancelling", limit.as_secs_f64());
            handle.cancel();
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<(), AlsError> {
        if self.is_cancelled() {
            Err(AlsError::Cancelled)
        } else {
            Ok(())
        }
    }
}
