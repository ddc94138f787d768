//! Deterministic sources for the worker.
//!
//! When a run carries a [`DeterminismConfig`], the worker installs a seeded
//! PRNG and (optionally) a fake clock before any user code executes. These
//! are the process-wide entry points inside the worker: capability and root
//! functions that need randomness or time read them from here so replays
//! are bit-identical. Budget accounting always uses the real monotonic
//! clock.

use std::cell::RefCell;
use std::time::Instant;

use cordon_core::policy::DeterminismConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Clock used for event timestamps. The fake variant returns
/// `start + n * step` and advances `n` on every read: each read observes
/// progress.
#[derive(Debug)]
pub enum Clock {
    Real(Instant),
    Fake { start: f64, step: f64, n: u64 },
}

impl Clock {
    pub fn real() -> Self {
        Clock::Real(Instant::now())
    }

    pub fn now_s(&mut self) -> f64 {
        match self {
            Clock::Real(t0) => t0.elapsed().as_secs_f64(),
            Clock::Fake { start, step, n } => {
                let v = *start + *n as f64 * *step;
                *n += 1;
                v
            }
        }
    }
}

struct DetState {
    rng: StdRng,
    seed: u64,
}

thread_local! {
    static DET: RefCell<Option<DetState>> = const { RefCell::new(None) };
}

/// Install deterministic sources for this worker thread and return the
/// clock to use for event timestamps.
pub fn install(cfg: Option<&DeterminismConfig>) -> Clock {
    let Some(cfg) = cfg else {
        return Clock::real();
    };
    DET.with(|det| {
        *det.borrow_mut() = Some(DetState {
            rng: StdRng::seed_from_u64(cfg.seed),
            seed: cfg.seed,
        });
    });
    match cfg.fake_time {
        Some(start) => Clock::Fake {
            start,
            step: cfg.time_step,
            n: 0,
        },
        None => Clock::real(),
    }
}

/// Remove installed sources (run teardown).
pub fn reset() {
    DET.with(|det| *det.borrow_mut() = None);
}

/// Draw from the seeded stream when determinism is installed, otherwise
/// from the thread RNG.
pub fn random() -> f64 {
    DET.with(|det| match det.borrow_mut().as_mut() {
        Some(state) => state.rng.r#gen::<f64>(),
        None => rand::thread_rng().r#gen::<f64>(),
    })
}

/// Draw a uniform integer in `[low, high)` from the deterministic stream.
pub fn randrange(low: i64, high: i64) -> i64 {
    if low >= high {
        return low;
    }
    DET.with(|det| match det.borrow_mut().as_mut() {
        Some(state) => state.rng.gen_range(low..high),
        None => rand::thread_rng().gen_range(low..high),
    })
}

/// Independent generator that auto-seeds with the installed seed when no
/// explicit seed is given. Reseeding an installed stream is disabled by
/// construction: callers get a fresh generator instead.
pub struct DetRandom {
    rng: StdRng,
}

impl DetRandom {
    pub fn new(seed: Option<u64>) -> Self {
        let seed = seed.unwrap_or_else(|| {
            DET.with(|det| det.borrow().as_ref().map(|s| s.seed).unwrap_or(0))
        });
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn random(&mut self) -> f64 {
        self.rng.r#gen::<f64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_clock_is_monotonic() {
        let mut c = Clock::real();
        let a = c.now_s();
        let b = c.now_s();
        assert!(b >= a);
    }

    #[test]
    fn fake_clock_advances_per_read() {
        let mut c = Clock::Fake {
            start: 100.0,
            step: 0.5,
            n: 0,
        };
        assert_eq!(c.now_s(), 100.0);
        assert_eq!(c.now_s(), 100.5);
        assert_eq!(c.now_s(), 101.0);
    }

    #[test]
    fn seeded_stream_replays() {
        let cfg = DeterminismConfig {
            seed: 42,
            ..Default::default()
        };
        install(Some(&cfg));
        let a = (random(), random());
        install(Some(&cfg));
        let b = (random(), random());
        reset();
        assert_eq!(a, b);
    }

    #[test]
    fn det_random_auto_seeds_from_installed_seed() {
        let cfg = DeterminismConfig {
            seed: 7,
            ..Default::default()
        };
        install(Some(&cfg));
        let mut a = DetRandom::new(None);
        let mut b = DetRandom::new(Some(7));
        assert_eq!(a.random(), b.random());
        reset();
    }
}
