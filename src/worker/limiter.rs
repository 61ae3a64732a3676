use std::time::{Duration, Instant};

/// Token bucket limiting worker status reports.
///
/// Refills one token every `interval`, holds at most `burst` tokens, and
/// starts full.
#[derive(Debug)]
pub struct TokenBucket {
    interval: Duration,
    burst: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(interval: Duration, burst: u32) -> Self {
        Self {
            interval,
            burst: f64::from(burst.max(1)),
            tokens: f64::from(burst.max(1)),
            last_refill: Instant::now(),
        }
    }

    /// Take one token if available.
    pub fn allow(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        let gained = elapsed.as_secs_f64() / self.interval.as_secs_f64();
        self.tokens = (self.tokens + gained).min(self.burst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_deny() {
        let mut bucket = TokenBucket::new(Duration::from_secs(1), 1);
        assert!(bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn refills_over_time() {
        let mut bucket = TokenBucket::new(Duration::from_millis(20), 1);
        assert!(bucket.allow());
        assert!(!bucket.allow());
        std::thread::sleep(Duration::from_millis(30));
        assert!(bucket.allow());
    }

    /// Hammering the bucket for ten intervals yields at most
    /// burst + intervals grants (the scaled version of "100 ticks per
    /// second for 10 s publishes at most 11 status updates").
    #[test]
    fn sustained_rate_is_bounded() {
        let interval = Duration::from_millis(50);
        let mut bucket = TokenBucket::new(interval, 1);
        let deadline = Instant::now() + interval * 10;
        let mut granted = 0;
        while Instant::now() < deadline {
            if bucket.allow() {
                granted += 1;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(granted <= 11, "granted {granted} reports, expected <= 11");
        assert!(granted >= 8, "granted {granted} reports, expected >= 8");
    }
}
