use rand::Rng;
use std::time::Duration;

/// Spread `base` by ±20% so nodes started together do not contend in lockstep
pub fn jittered(base: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.8..=1.2);
    let millis = (base.as_millis() as f64 * factor).max(1.0);
    Duration::from_millis(millis as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..200 {
            let d = jittered(base);
            assert!(d >= Duration::from_millis(800), "{:?}", d);
            assert!(d <= Duration::from_millis(1200), "{:?}", d);
        }
    }

    #[test]
    fn jitter_never_returns_zero() {
        assert!(jittered(Duration::ZERO) >= Duration::from_millis(1));
    }
}
