use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::settings::BackoffSettings;

/// Jittered exponential delay between stream reconnect attempts.
///
/// The first attempt after a reset goes out immediately; each consecutive
/// failure multiplies the base delay until it reaches the cap.
#[derive(Debug)]
pub struct ExponentialBackoff {
    settings: BackoffSettings,
    current_base_millis: u64,
    rng: StdRng,
}

impl ExponentialBackoff {
    pub fn new(settings: BackoffSettings) -> Self {
        Self {
            settings,
            current_base_millis: 0,
            rng: StdRng::from_entropy(),
        }
    }

    #[cfg(test)]
    fn with_seed(settings: BackoffSettings, seed: u64) -> Self {
        Self {
            settings,
            current_base_millis: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Returns the delay to wait before the next attempt and advances the base.
    pub fn next_delay(&mut self) -> Duration {
        let delay = jittered_delay_millis(self.current_base_millis, &self.settings, &mut self.rng);
        self.current_base_millis = if self.current_base_millis == 0 {
            self.settings.initial_delay_ms
        } else {
            ((self.current_base_millis as f64) * self.settings.multiplier)
                .min(self.settings.max_delay_ms as f64) as u64
        };
        Duration::from_millis(delay)
    }

    /// Called after a successful round-trip.
    pub fn reset(&mut self) {
        self.current_base_millis = 0;
    }
}

fn jittered_delay_millis<R: Rng + ?Sized>(
    base_millis: u64,
    settings: &BackoffSettings,
    rng: &mut R,
) -> u64 {
    if base_millis == 0 {
        return 0;
    }
    let base = base_millis as f64;
    let jitter = settings.jitter * base * rng.gen_range(-1.0..=1.0);
    (base + jitter)
        .round()
        .clamp(0.0, settings.max_delay_ms as f64) as u64
}
