//! Inter-arrival sample rate estimation

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use crate::RATE_WINDOW;

/// Circular buffer of the last [`RATE_WINDOW`] arrival times.
///
/// The rate is the number of intervals in the window over the span from the
/// oldest to the newest timestamp. Until the window has filled, and whenever
/// the span isn't positive, the rate is zero.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    stamps: [Option<Instant>; RATE_WINDOW],
    count: u64,
}

impl Default for RateEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateEstimator {
    pub fn new() -> Self {
        Self {
            stamps: [None; RATE_WINDOW],
            count: 0,
        }
    }

    pub fn record(&mut self, timestamp: Instant) {
        let idx = (self.count % RATE_WINDOW as u64) as usize;
        self.stamps[idx] = Some(timestamp);
        self.count += 1;
    }

    /// Samples per second over the most recent full window
    pub fn current_rate(&self) -> f64 {
        if self.count < RATE_WINDOW as u64 {
            return 0.0;
        }
        let newest = ((self.count - 1) % RATE_WINDOW as u64) as usize;
        // The slot after the newest is the one that gets overwritten next,
        // i.e. the oldest we still hold
        let oldest = (newest + 1) % RATE_WINDOW;
        match (self.stamps[newest], self.stamps[oldest]) {
            (Some(newest), Some(oldest)) => {
                // checked_duration_since is None if the clock went backwards
                let span = match newest.checked_duration_since(oldest) {
                    Some(span) => span.as_secs_f64(),
                    None => return 0.0,
                };
                if span <= 0.0 {
                    0.0
                } else {
                    (RATE_WINDOW - 1) as f64 / span
                }
            }
            _ => 0.0,
        }
    }

    /// Number of timestamps recorded since creation or the last reset
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Rate estimate published by the capture thread, readable from anywhere.
/// Readers may see a slightly stale value.
#[derive(Debug, Default)]
pub struct SharedRate(AtomicU64);

impl SharedRate {
    pub fn new() -> Self {
        Self(AtomicU64::new(0f64.to_bits()))
    }

    pub fn store(&self, rate: f64) {
        self.0.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}
