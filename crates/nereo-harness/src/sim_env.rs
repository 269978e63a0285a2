//! Virtual-clock environment.
//!
//! Time only moves when the harness moves it: [`SimEnv::advance`] or an
//! awaited [`Environment::sleep`]. Randomness comes from a seeded ChaCha RNG,
//! so a run is fully determined by its seed and its operations.

use std::{
    fmt,
    ops::{Add, Sub},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use nereo_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Default seed of [`SimEnv::new`].
pub const DEFAULT_SEED: u64 = 0x6e65_7265_6f;

/// Point on the virtual timeline, measured from the start of the run.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Start of the run.
    pub const EPOCH: Self = Self(Duration::ZERO);

    /// Time since the start of the run.
    pub fn since_epoch(self) -> Duration {
        self.0
    }

    /// Milliseconds since the start of the run.
    pub fn as_millis(self) -> u64 {
        self.0.as_millis() as u64
    }
}

impl fmt::Debug for SimInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t+{}ms", self.as_millis())
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for SimInstant {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        Self(self.0 + rhs)
    }
}

/// Environment with a manually advanced clock and a seeded RNG.
///
/// Clones share the clock and the RNG.
#[derive(Clone)]
pub struct SimEnv {
    nanos: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha8Rng>>,
    seed: u64,
}

impl fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimEnv").field("now", &self.now()).field("seed", &self.seed).finish()
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEnv {
    /// Environment at [`SimInstant::EPOCH`] with [`DEFAULT_SEED`].
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Environment at [`SimInstant::EPOCH`] with the given seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            seed,
        }
    }

    /// Seed the RNG was created with.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        self.nanos.fetch_add(duration.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Move the clock to `instant`. Earlier instants are ignored.
    pub fn advance_to(&self, instant: SimInstant) {
        self.nanos.fetch_max(instant.since_epoch().as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(Duration::from_nanos(self.nanos.load(Ordering::SeqCst)))
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let env = self.clone();
        async move {
            env.advance(duration);
            tokio::task::yield_now().await;
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_only_moves_when_advanced() {
        let env = SimEnv::new();
        assert_eq!(env.now(), SimInstant::EPOCH);

        env.advance(Duration::from_millis(1500));
        assert_eq!(env.now().as_millis(), 1500);

        env.advance_to(SimInstant::EPOCH + Duration::from_millis(200));
        assert_eq!(env.now().as_millis(), 1500);
    }

    #[test]
    fn clones_share_the_clock() {
        let env = SimEnv::new();
        let other = env.clone();
        other.advance(Duration::from_secs(6));
        assert_eq!(env.now() - SimInstant::EPOCH, Duration::from_secs(6));
    }

    #[test]
    fn same_seed_same_bytes() {
        let a = SimEnv::with_seed(7);
        let b = SimEnv::with_seed(7);
        assert_eq!(a.random_u64(), b.random_u64());
        assert_ne!(SimEnv::with_seed(8).random_u64(), SimEnv::with_seed(7).random_u64());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn sleep_advances_virtual_time() {
        let env = SimEnv::new();
        env.sleep(Duration::from_millis(15_000)).await;
        assert_eq!(env.now().as_millis(), 15_000);
    }

    #[test]
    fn instant_difference_saturates() {
        let early = SimInstant::EPOCH;
        let late = early + Duration::from_secs(1);
        assert_eq!(early - late, Duration::ZERO);
    }
}
