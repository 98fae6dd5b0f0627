//! Raw-counter rate cache.
//!
//! Upstream reports disk and network I/O as monotonically increasing byte
//! counters. The cache keeps the previous raw sample per
//! `(endpoint, guest kind, vmid, counter)` and turns two consecutive
//! samples into a rate. A counter that shrank (VM restart, counter wrap)
//! yields 0, never a negative or absurd value.

use std::collections::HashMap;
use std::sync::Mutex;

use pulse_api_types::GuestKind;

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct RateKey {
    pub endpoint: String,
    pub kind: GuestKind,
    pub vmid: u64,
    pub counter: &'static str,
}

#[derive(Clone, Copy)]
struct RawSample {
    value: u64,
    time: f64,
}

#[derive(Default)]
pub struct RateCache {
    samples: Mutex<HashMap<RateKey, RawSample>>,
}

impl RateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the stored sample and return the rate since the previous
    /// one, in units per second. The first sample of a key yields 0.
    pub fn rate(&self, key: RateKey, time: f64, value: u64) -> f64 {
        let mut samples = self.samples.lock().unwrap();
        let previous = samples.insert(key, RawSample { value, time });
        match previous {
            Some(prev) if time > prev.time && value >= prev.value => {
                (value - prev.value) as f64 / (time - prev.time)
            }
            // wrap/reset, out-of-order sample, or nothing to compare against
            _ => 0.0,
        }
    }

    /// Drop samples older than `before`; called occasionally so removed
    /// guests do not accumulate.
    pub fn sweep(&self, before: f64) {
        self.samples
            .lock()
            .unwrap()
            .retain(|_, sample| sample.time >= before);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(counter: &'static str) -> RateKey {
        RateKey {
            endpoint: "pve1".into(),
            kind: GuestKind::Qemu,
            vmid: 100,
            counter,
        }
    }

    #[test]
    fn first_sample_yields_zero() {
        let cache = RateCache::new();
        assert_eq!(cache.rate(key("netin"), 10.0, 1000), 0.0);
    }

    #[test]
    fn steady_counter_yields_rate() {
        let cache = RateCache::new();
        cache.rate(key("netin"), 10.0, 1000);
        let rate = cache.rate(key("netin"), 20.0, 6000);
        assert_eq!(rate, 500.0);
    }

    #[test]
    fn counter_wrap_clamps_to_zero() {
        let cache = RateCache::new();
        cache.rate(key("diskread"), 10.0, i64::MAX as u64);
        let rate = cache.rate(key("diskread"), 20.0, 5);
        assert_eq!(rate, 0.0);
        // and the next delta is computed from the post-reset sample
        let rate = cache.rate(key("diskread"), 30.0, 1005);
        assert_eq!(rate, 100.0);
    }

    #[test]
    fn distinct_endpoints_do_not_share_samples() {
        let cache = RateCache::new();
        cache.rate(key("netin"), 10.0, 1000);
        let other = RateKey {
            endpoint: "pve2".into(),
            ..key("netin")
        };
        assert_eq!(cache.rate(other, 20.0, 9000), 0.0);
    }

    #[test]
    fn sweep_drops_stale_samples() {
        let cache = RateCache::new();
        cache.rate(key("netin"), 10.0, 1000);
        cache.rate(key("netout"), 50.0, 1000);
        cache.sweep(40.0);
        assert_eq!(cache.len(), 1);
    }
}
