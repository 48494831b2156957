use rand::Rng;
use std::time::Duration;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Random follower delay before a dispatch request, in steps of 100 ms.
pub fn dispatch_jitter(max_ms: u64) -> Duration {
    let steps = max_ms / 100;
    let step = rand::thread_rng().gen_range(0..=steps);
    Duration::from_millis(step * 100)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_stays_in_range() {
        for _ in 0..100 {
            let timeout = random_election_timeout(150, 300);
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout <= Duration::from_millis(300));
        }
    }

    #[test]
    fn jitter_uses_100ms_steps() {
        for _ in 0..100 {
            let jitter = dispatch_jitter(2_100);
            assert_eq!(jitter.as_millis() % 100, 0);
            assert!(jitter <= Duration::from_millis(2_100));
        }
        assert_eq!(dispatch_jitter(0), Duration::ZERO);
    }
}
