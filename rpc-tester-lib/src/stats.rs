//! Streaming latency statistics.
//!
//! [`LatencyAccumulator`] keeps a running mean, an exact running max and
//! an extended P² estimator for a fixed set of quantiles, all in constant
//! memory and O(1) work per sample.

/// Target probabilities tracked by every accumulator.
pub const QUANTILES: [f64; 4] = [0.5, 0.95, 0.99, 0.999];

const NUM_QUANTILES: usize = QUANTILES.len();
const NUM_MARKERS: usize = 2 * NUM_QUANTILES + 3;

/// Extended P² quantile estimator (Raatikainen).
///
/// Markers sit at probabilities `0, p1/2, p1, (p1+p2)/2, p2, ..., pm, (1+pm)/2, 1`.
/// The first [`NUM_MARKERS`] samples are kept sorted as the initial marker
/// heights; afterwards only the markers are adjusted. Quantiles are read by
/// interpolating between the markers at their actual positions, which is
/// exact as long as the markers still hold the initial samples.
#[derive(Debug, Clone)]
struct ExtendedP2 {
    count: u64,
    heights: [f64; NUM_MARKERS],
    positions: [f64; NUM_MARKERS],
    desired: [f64; NUM_MARKERS],
    increments: [f64; NUM_MARKERS],
}

impl ExtendedP2 {
    fn new() -> Self {
        let mut increments = [0.0; NUM_MARKERS];
        let mut prev = 0.0;
        for (i, &p) in QUANTILES.iter().enumerate() {
            increments[2 * i + 1] = (prev + p) / 2.0;
            increments[2 * i + 2] = p;
            prev = p;
        }
        increments[NUM_MARKERS - 2] = (1.0 + prev) / 2.0;
        increments[NUM_MARKERS - 1] = 1.0;

        let mut positions = [0.0; NUM_MARKERS];
        let mut desired = [0.0; NUM_MARKERS];
        for i in 0..NUM_MARKERS {
            positions[i] = (i + 1) as f64;
            desired[i] = 1.0 + (NUM_MARKERS - 1) as f64 * increments[i];
        }

        Self {
            count: 0,
            heights: [0.0; NUM_MARKERS],
            positions,
            desired,
            increments,
        }
    }

    fn push(&mut self, x: f64) {
        let n = self.count as usize;
        self.count += 1;

        if n < NUM_MARKERS {
            self.heights[n] = x;
            if n + 1 == NUM_MARKERS {
                self.heights.sort_by(f64::total_cmp);
            }
            return;
        }

        let last = NUM_MARKERS - 1;
        let cell = if x < self.heights[0] {
            self.heights[0] = x;
            1
        } else if x >= self.heights[last] {
            self.heights[last] = x;
            last
        } else {
            // first marker strictly above x
            self.heights[1..]
                .iter()
                .position(|&h| x < h)
                .map_or(last, |i| i + 1)
        };

        for position in &mut self.positions[cell..] {
            *position += 1.0;
        }
        for (desired, increment) in self.desired.iter_mut().zip(self.increments) {
            *desired += increment;
        }

        for i in 1..last {
            let d = self.desired[i] - self.positions[i];
            let gap_up = self.positions[i + 1] - self.positions[i];
            let gap_down = self.positions[i - 1] - self.positions[i];

            if (d >= 1.0 && gap_up > 1.0) || (d <= -1.0 && gap_down < -1.0) {
                let sign = d.signum();
                let candidate = self.parabolic(i, sign);
                self.heights[i] =
                    if self.heights[i - 1] < candidate && candidate < self.heights[i + 1] {
                        candidate
                    } else {
                        self.linear(i, sign)
                    };
                self.positions[i] += sign;
            }
        }
    }

    fn parabolic(&self, i: usize, d: f64) -> f64 {
        let (q, n) = (&self.heights, &self.positions);
        q[i] + d / (n[i + 1] - n[i - 1])
            * ((n[i] - n[i - 1] + d) * (q[i + 1] - q[i]) / (n[i + 1] - n[i])
                + (n[i + 1] - n[i] - d) * (q[i] - q[i - 1]) / (n[i] - n[i - 1]))
    }

    fn linear(&self, i: usize, d: f64) -> f64 {
        let j = if d > 0.0 { i + 1 } else { i - 1 };
        let (q, n) = (&self.heights, &self.positions);
        q[i] + d * (q[j] - q[i]) / (n[j] - n[i])
    }

    /// Estimate of the `index`-th tracked quantile.
    fn quantile(&self, index: usize) -> f64 {
        let n = self.count as usize;
        if n == 0 {
            return 0.0;
        }
        if n < NUM_MARKERS {
            // too few samples for markers: nearest rank on the sorted initial samples
            let mut samples = [0.0; NUM_MARKERS];
            samples[..n].copy_from_slice(&self.heights[..n]);
            samples[..n].sort_by(f64::total_cmp);
            let rank = (QUANTILES[index] * n as f64).ceil() as usize;
            return samples[rank.clamp(1, n) - 1];
        }

        // 1-based sample rank of the quantile, markers span ranks 1..=n
        let rank = 1.0 + (n - 1) as f64 * QUANTILES[index];
        let (q, pos) = (&self.heights, &self.positions);
        let upper = pos[1..]
            .iter()
            .position(|&p| rank <= p)
            .map_or(NUM_MARKERS - 1, |i| i + 1);
        let lower = upper - 1;
        let t = (rank - pos[lower]) / (pos[upper] - pos[lower]);
        q[lower] + t * (q[upper] - q[lower])
    }
}

/// Latency statistics of one job, in microseconds.
#[derive(Debug, Clone)]
pub struct LatencyAccumulator {
    count: u64,
    mean: f64,
    max: f64,
    quantiles: ExtendedP2,
}

impl Default for LatencyAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyAccumulator {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            max: 0.0,
            quantiles: ExtendedP2::new(),
        }
    }

    /// Record one sample.
    pub fn record(&mut self, micros: u64) {
        let x = micros as f64;
        self.count += 1;
        self.mean += (x - self.mean) / self.count as f64;
        if self.count == 1 || x > self.max {
            self.max = x;
        }
        self.quantiles.push(x);
    }

    #[inline]
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Truncated integer summary, as reported.
    pub fn summary(&self) -> LatencySummary {
        let mut quantiles = [0; NUM_QUANTILES];
        for (index, q) in quantiles.iter_mut().enumerate() {
            *q = self.quantiles.quantile(index).min(self.max) as u64;
        }
        LatencySummary {
            average: self.mean as u64,
            quantiles,
            max: self.max as u64,
        }
    }
}

/// Reported latencies in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub average: u64,
    /// Values for [`QUANTILES`], in the same order.
    pub quantiles: [u64; NUM_QUANTILES],
    pub max: u64,
}

impl LatencySummary {
    /// Report key of a tracked quantile, e.g. `p0.95`.
    pub fn quantile_key(probability: f64) -> String {
        format!("p{probability}")
    }

    /// `(key, value)` pairs for the tracked quantiles, in ascending order.
    pub fn quantile_entries(&self) -> impl Iterator<Item = (String, u64)> + '_ {
        QUANTILES
            .iter()
            .zip(self.quantiles)
            .map(|(&p, v)| (Self::quantile_key(p), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assert_ordered(s: &LatencySummary) {
        assert!(s.quantiles.windows(2).all(|w| w[0] <= w[1]), "{s:?}");
        assert!(s.quantiles[3] <= s.max, "{s:?}");
        assert!(s.average <= s.max, "{s:?}");
    }

    #[test]
    fn test_empty_accumulator_reports_zero() {
        let acc = LatencyAccumulator::new();
        assert_eq!(acc.count(), 0);
        assert_eq!(acc.summary(), LatencySummary::default());
    }

    #[test]
    fn test_single_sample() {
        let mut acc = LatencyAccumulator::new();
        acc.record(17);
        let s = acc.summary();
        assert_eq!(
            s,
            LatencySummary {
                average: 17,
                quantiles: [17; 4],
                max: 17,
            }
        );
    }

    #[test]
    fn test_mean_is_truncated() {
        let mut acc = LatencyAccumulator::new();
        for v in [1, 2] {
            acc.record(v);
        }
        assert_eq!(acc.mean(), 1.5);
        assert_eq!(acc.summary().average, 1);
    }

    #[test]
    fn test_quantile_keys() {
        let keys: Vec<_> = LatencySummary::default()
            .quantile_entries()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["p0.5", "p0.95", "p0.99", "p0.999"]);
    }

    #[test]
    fn test_estimate_does_not_jump_once_markers_fill() {
        let mut acc = LatencyAccumulator::new();
        for v in 0..10 {
            acc.record(v);
        }
        assert_eq!(acc.summary().quantiles, [4, 9, 9, 9]);

        // the 11th sample fills the markers: still the exact median
        acc.record(10);
        assert_eq!(acc.summary().quantiles, [5, 9, 9, 9]);

        for v in 11..200 {
            acc.record(v);
            let s = acc.summary();
            assert_ordered(&s);
            let median = v / 2;
            assert!(s.quantiles[0].abs_diff(median) <= 2, "n = {}: {s:?}", v + 1);
        }
    }

    #[test]
    fn test_initial_samples_are_order_independent() {
        let mut forward = LatencyAccumulator::new();
        let mut reversed = LatencyAccumulator::new();
        for v in 0..11 {
            forward.record(v * 3);
            reversed.record(30 - v * 3);
        }
        assert_eq!(forward.summary(), reversed.summary());
        assert_eq!(forward.summary().quantiles[0], 15);
    }

    #[test]
    fn test_uniform_distribution_converges() {
        let mut acc = LatencyAccumulator::new();
        // deterministic permutation of 0..100_000
        const N: u64 = 100_000;
        for i in 0..N {
            acc.record((i * 7919) % N);
        }

        let s = acc.summary();
        assert_ordered(&s);
        assert_eq!(s.max, N - 1);

        let within = |estimate: u64, expected: f64| {
            let err = (estimate as f64 - expected).abs() / N as f64;
            assert!(err < 0.01, "estimate {estimate}, expected ~{expected}");
        };
        within(s.average, (N - 1) as f64 / 2.0);
        for (&p, estimate) in QUANTILES.iter().zip(s.quantiles) {
            within(estimate, p * N as f64);
        }
    }

    #[test]
    fn test_long_tail_distribution() {
        let mut acc = LatencyAccumulator::new();
        // 99% fast calls around 100us, 1% slow calls around 10ms
        for i in 0..50_000u64 {
            let v = if i % 100 == 0 {
                10_000 + (i % 1000)
            } else {
                90 + (i % 20)
            };
            acc.record(v);
        }

        let s = acc.summary();
        assert_ordered(&s);
        let [p50, p95, _, p999] = s.quantiles;
        assert!((90..110).contains(&p50), "{s:?}");
        assert!(p95 < 1_000, "{s:?}");
        assert!(p999 >= 10_000, "{s:?}");
        assert_eq!(s.max, 10_900);
    }

    proptest! {
        #[test]
        fn prop_max_is_exact(samples in prop::collection::vec(0u64..10_000_000, 1..2000)) {
            let mut acc = LatencyAccumulator::new();
            for &v in &samples {
                acc.record(v);
            }
            prop_assert_eq!(acc.summary().max, *samples.iter().max().unwrap());
            prop_assert_eq!(acc.count(), samples.len() as u64);
        }

        #[test]
        fn prop_quantiles_are_monotone(samples in prop::collection::vec(0u64..1_000_000, 0..2000)) {
            let mut acc = LatencyAccumulator::new();
            for &v in &samples {
                acc.record(v);
            }
            let s = acc.summary();
            let [p50, p95, p99, p999] = s.quantiles;
            prop_assert!(p50 <= p95);
            prop_assert!(p95 <= p99);
            prop_assert!(p99 <= p999);
            prop_assert!(p999 <= s.max);
        }
    }
}
