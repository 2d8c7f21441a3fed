// Copyright wren-quic developers. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide collaborators injected into every connection
//!
//! Tests inject a deterministic clock and RNG; production wires the real
//! ones. Nothing in the transport reaches for ambient globals.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};
use wren_quic_core::{random, stateless_reset, time::Clock, time::Timestamp};

pub struct Runtime {
    clock: Box<dyn Clock + Send + Sync>,
    random: Mutex<Box<dyn random::Generator>>,
    memory: MemoryLimiter,
    reset_signer: stateless_reset::Signer,
}

impl Runtime {
    pub fn new(
        clock: Box<dyn Clock + Send + Sync>,
        random: Box<dyn random::Generator>,
        memory_limit: usize,
        reset_secret: [u8; 32],
    ) -> Arc<Self> {
        Arc::new(Self {
            clock,
            random: Mutex::new(random),
            memory: MemoryLimiter::new(memory_limit),
            reset_signer: stateless_reset::Signer::new(reset_secret),
        })
    }

    #[inline]
    pub fn now(&self) -> Timestamp {
        self.clock.get_time()
    }

    #[inline]
    pub fn memory(&self) -> &MemoryLimiter {
        &self.memory
    }

    #[inline]
    pub fn reset_signer(&self) -> &stateless_reset::Signer {
        &self.reset_signer
    }

    /// Fills `dest` with unpredictable bytes for wire-visible values
    pub fn public_random(&self, dest: &mut [u8]) {
        self.random
            .lock()
            .expect("random generator poisoned")
            .public_random_fill(dest);
    }

    pub fn private_random(&self, dest: &mut [u8]) {
        self.random
            .lock()
            .expect("random generator poisoned")
            .private_random_fill(dest);
    }
}

impl core::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Runtime")
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

/// Bounds the total buffered bytes across every connection in the process
///
/// Reservations that would exceed the bound fail and the caller drops the
/// data silently; both spec'd behaviors for memory pressure.
#[derive(Debug)]
pub struct MemoryLimiter {
    limit: usize,
    used: AtomicUsize,
}

impl MemoryLimiter {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
        }
    }

    /// Attempts to reserve `bytes`; returns false under memory pressure
    pub fn reserve(&self, bytes: usize) -> bool {
        let mut current = self.used.load(Ordering::Relaxed);
        loop {
            let Some(next) = current.checked_add(bytes) else {
                return false;
            };
            if next > self.limit {
                return false;
            }
            match self.used.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "released more memory than reserved");
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

pub mod testing {
    use super::*;
    use wren_quic_core::time;

    /// A runtime with a manual clock and deterministic randomness
    pub fn runtime(clock: time::testing::Clock) -> Arc<Runtime> {
        Runtime::new(
            Box::new(clock),
            Box::new(random::testing::Generator::default()),
            16 * 1024 * 1024,
            [0x17; 32],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_limiter_test() {
        let limiter = MemoryLimiter::new(100);

        assert!(limiter.reserve(60));
        assert!(limiter.reserve(40));
        assert!(!limiter.reserve(1), "over-limit reservations fail");

        limiter.release(50);
        assert!(limiter.reserve(10));
        assert_eq!(limiter.used(), 60);
    }
}
