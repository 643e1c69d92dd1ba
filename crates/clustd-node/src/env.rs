//! Production environment: OS clock and OS entropy.

use std::{
    future::Future,
    time::{Duration, Instant},
};

use clustd_core::Environment;
use tracing::error;

/// Environment backed by the system clock, tokio timers and `getrandom`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        // IVs and tickets must never come from a fallback source.
        if let Err(e) = getrandom::fill(buffer) {
            error!(error = %e, "OS entropy unavailable");
            std::process::abort();
        }
    }
}
