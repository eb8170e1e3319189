use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket limiter in front of the broker HTTP client. Alpaca allows
/// 200 requests/min on the trading API; the default here stays well under
/// that so a scan over a large universe never trips the broker's limiter.
#[derive(Clone)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Arc<Mutex<BucketState>>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            state: Arc::new(Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            })),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take one token, sleeping until the bucket refills.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait_ms = (1000.0 / self.refill_per_sec).clamp(10.0, 250.0) as u64;
            sleep(Duration::from_millis(wait_ms)).await;
        }
    }
}
