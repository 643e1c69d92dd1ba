//! Manual environment for unit tests: a clock that only moves when told.

use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use rand::{RngCore, SeedableRng, rngs::StdRng};

use crate::env::Environment;

struct Inner {
    now: Instant,
    rng: StdRng,
}

#[derive(Clone)]
pub(crate) struct ManualEnv {
    inner: Arc<Mutex<Inner>>,
}

impl ManualEnv {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                now: Instant::now(),
                rng: StdRng::seed_from_u64(seed),
            })),
        }
    }

    pub(crate) fn advance(&self, duration: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.now += duration;
    }
}

impl Environment for ManualEnv {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).now
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        self.advance(duration);
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).rng.fill_bytes(buffer);
    }
}
