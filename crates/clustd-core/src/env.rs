//! Environment abstraction for deterministic testing.
//!
//! State machines in this crate never read the clock or an RNG directly.
//! Time and randomness come from an [`Environment`], implemented by
//! `SystemEnv` in `clustd-node` (OS clock, OS entropy) and `SimEnv` in
//! `clustd-harness` (turmoil virtual time, seeded RNG).
//!
//! # Invariants
//!
//! - Monotonicity: `now()` never goes backwards
//! - Determinism: given the same seed, `random_bytes()` yields the same bytes

use std::{future::Future, time::Duration, time::Instant};

/// Time, randomness and sleeping.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> Instant;

    /// Sleep for `duration`. Only driver code awaits this; state machines
    /// return deadlines instead.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    ///
    /// Production implementations must use a cryptographically secure source:
    /// IVs and session tickets come from here.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u32`, used for session tickets.
    fn random_u32(&self) -> u32 {
        let mut bytes = [0u8; 4];
        self.random_bytes(&mut bytes);
        u32::from_be_bytes(bytes)
    }
}
