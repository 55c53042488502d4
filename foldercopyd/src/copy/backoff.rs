use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Exponential delay with additive random jitter: `min(base * 2^attempt, max) + [0, jitter]`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    /// 1, 2, 4, 8, 16 seconds plus up to one second of jitter.
    pub fn standard() -> Self {
        Self::new(
            Duration::from_secs(1),
            Duration::from_secs(16),
            Duration::from_secs(1),
        )
    }

    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, Duration::ZERO)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter_ms = self.jitter.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let extra = if jitter_ms > 0 {
            rng.gen_range(0..=jitter_ms)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(extra))
    }

    /// Runs `op` up to `attempts` times, sleeping between failures. Returns the last error.
    pub async fn retry<T, E, F, Fut>(&self, attempts: u32, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= attempts => return Err(err),
                Err(err) => {
                    let delay = self.delay(attempt);
                    warn!(
                        what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_without_jitter_doubles_until_capped() {
        let backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(800),
            Duration::ZERO,
        );
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<_> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng))
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn jitter_is_added_on_top_of_the_exponential_part() {
        let backoff = Backoff::standard();
        let mut rng = StdRng::seed_from_u64(42);
        let delay = backoff.delay_with_rng(2, &mut rng);
        assert!(delay >= Duration::from_secs(4));
        assert!(delay <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = Backoff::standard()
            .retry(6, "load", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(format!("fail {n}")) } else { Ok(n) }
            })
            .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_last_error_after_all_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = Backoff::standard()
            .retry(6, "load", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(format!("fail {n}"))
            })
            .await;
        assert_eq!(result, Err("fail 5".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }
}
