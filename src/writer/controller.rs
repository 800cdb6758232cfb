//! Pure adaptive batch-size controller (§4.8 step 5), independently unit-testable without a
//! database.

/// Given the batch size and elapsed time of the batch that just committed, propose the next
/// batch size. Raises when comfortably under target, lowers when comfortably over, otherwise
/// holds steady; always clamped to `[min_size, max_size]`.
pub fn next_batch_size(
    last_size: u32,
    last_latency_ms: u64,
    target_ms: u64,
    min_size: u32,
    max_size: u32,
) -> u32 {
    let target = target_ms.max(1) as f64;
    let latency = last_latency_ms as f64;
    let proposed = if latency < target * 0.8 {
        (last_size as f64 * 1.25).ceil() as u32
    } else if latency > target * 1.25 {
        (last_size as f64 * 0.75).floor() as u32
    } else {
        last_size
    };
    proposed.clamp(min_size, max_size)
}

/// Exponential moving average of batch latency, used for the metrics the writer reports (§4.8).
#[derive(Debug, Clone, Copy)]
pub struct LatencyEma {
    alpha: f64,
    value: Option<f64>,
}

impl LatencyEma {
    pub fn new(alpha: f64) -> Self {
        LatencyEma { alpha, value: None }
    }

    pub fn observe(&mut self, latency_ms: u64) -> f64 {
        let latency = latency_ms as f64;
        let next = match self.value {
            None => latency,
            Some(prev) => self.alpha * latency + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raises_when_well_under_target() {
        let next = next_batch_size(64, 100, 500, 8, 1024);
        assert!(next > 64);
    }

    #[test]
    fn lowers_when_well_over_target() {
        let next = next_batch_size(64, 900, 500, 8, 1024);
        assert!(next < 64);
    }

    #[test]
    fn holds_steady_within_tolerance() {
        let next = next_batch_size(64, 500, 500, 8, 1024);
        assert_eq!(next, 64);
    }

    #[test]
    fn clamps_to_bounds() {
        assert_eq!(next_batch_size(1000, 1, 500, 8, 1024), 1024);
        assert_eq!(next_batch_size(10, 100_000, 500, 8, 1024), 8);
    }

    #[test]
    fn ema_converges_toward_constant_observations() {
        let mut ema = LatencyEma::new(0.5);
        ema.observe(100);
        ema.observe(100);
        let v = ema.observe(100);
        assert!((v - 100.0).abs() < 1e-6);
    }
}
