use rand::Rng;
use std::time::Duration;

/// Delay before reconnect attempt `attempt` (0-based): doubling from `base`,
/// capped at `max`, plus up to 25% random jitter.
pub fn reconnect_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(max);
    let jitter_ms = (capped.as_millis() as u64) / 4;
    if jitter_ms == 0 {
        return capped;
    }
    let mut rng = rand::thread_rng();
    capped + Duration::from_millis(rng.gen_range(0..=jitter_ms))
}
