//! Production Environment implementation using the tokio clock and OS RNG.
//!
//! `SystemEnv` is the production implementation of the Environment trait.
//!
//! # Capabilities
//!
//! - Monotonic time from `tokio::time::Instant`, which follows the real clock
//!   in production and the paused clock in `#[tokio::test(start_paused)]`
//! - OS RNG (getrandom) for temporary record ids
//! - Tokio async sleep for actual wall-clock delays

use std::time::Duration;

use nereo_core::Environment;

/// Production environment using the tokio clock and OS randomness.
///
/// # Panics
///
/// Panics if the OS RNG fails. RNG failure indicates an OS-level problem the
/// client cannot recover from.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_env_random_bytes_are_random() {
        let env = SystemEnv::new();

        let mut bytes1 = [0u8; 32];
        let mut bytes2 = [0u8; 32];

        env.random_bytes(&mut bytes1);
        env.random_bytes(&mut bytes2);

        // Extremely unlikely to be equal if random
        assert_ne!(bytes1, bytes2, "Random bytes should differ");
    }

    #[tokio::test(start_paused = true)]
    async fn system_env_sleep_follows_tokio_clock() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_secs(30)).await;
        let elapsed = env.now() - start;

        assert!(elapsed >= Duration::from_secs(30), "Sleep should wait at least 30s");
    }
}
