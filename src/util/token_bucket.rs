use parking_lot::Mutex;
use tokio::time::{sleep, Duration, Instant};

/// A classic leaky bucket: a capacity's worth of tokens refilled at a fixed
/// rate, drained by callers as work is performed.
///
/// All operations are thread-safe. Time comes from the `tokio` clock so the
/// bucket cooperates with paused test time.
pub struct TokenBucket {
    state: Mutex<State>,
}

struct State {
    capacity: f64,
    fill_rate: f64,
    tokens: f64,
    updated: Instant,
}

impl State {
    /// Credit tokens accrued since the last observation, capped at capacity.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        self.tokens = (self.tokens + self.fill_rate * elapsed).min(self.capacity);
        self.updated = now;
    }
}

impl TokenBucket {
    /// Create a bucket holding `capacity` tokens, refilled at `fill_rate`
    /// tokens per second. The bucket starts full.
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        TokenBucket {
            state: Mutex::new(State {
                capacity,
                fill_rate,
                tokens: capacity,
                updated: Instant::now(),
            }),
        }
    }

    /// Try to take `cost` tokens. Returns `true` and decrements the level if
    /// enough tokens are available after crediting elapsed time, otherwise
    /// returns `false` without mutating the level.
    pub fn drain(&self, cost: f64) -> bool {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        if state.tokens >= cost {
            state.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Block the caller until `cost` tokens can be drained, sleeping the
    /// computed deficit between attempts.
    ///
    /// While the bucket cannot possibly satisfy `cost` (zero fill rate, or
    /// capacity below the cost), the wait backs off and re-checks, so a
    /// concurrent [`reconfigure`](Self::reconfigure) unblocks it.
    pub async fn wait_for(&self, cost: f64) {
        loop {
            let deficit = {
                let mut state = self.state.lock();
                state.refill(Instant::now());
                if state.tokens >= cost {
                    state.tokens -= cost;
                    return;
                }
                if state.fill_rate <= 0.0 || state.capacity < cost {
                    Duration::from_millis(100)
                } else {
                    Duration::from_secs_f64((cost - state.tokens) / state.fill_rate)
                }
            };
            sleep(deficit).await;
        }
    }

    /// Swap capacity and fill rate in place. Accrual up to now is credited
    /// at the old rate first; the level is clamped to the new capacity.
    pub fn reconfigure(&self, capacity: f64, fill_rate: f64) {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.capacity = capacity;
        state.fill_rate = fill_rate;
        state.tokens = state.tokens.min(capacity);
    }

    /// Current token level after crediting elapsed time.
    pub fn level(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(Instant::now());
        state.tokens
    }
}
