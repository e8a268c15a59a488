use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Ceiling on outbound ledger calls per trailing minute.
pub const MAX_CALLS_PER_MINUTE: usize = 50;

const WINDOW: Duration = Duration::from_secs(60);
const COOL_DOWN: Duration = Duration::from_secs(120);
/// Sleeping until `oldest + 65s` rather than `+ 60s` leaves a margin so the
/// ceiling is not grazed on the very next call.
const WINDOW_DRAIN_SECS: u64 = 65;

#[derive(Default)]
struct LimiterState {
    recent: VecDeque<Instant>,
    last_rejection: Option<Instant>,
}

/// Advisory self-throttling for the external ledger API: a sliding
/// 60-second window of call timestamps plus a cool-down marker set after an
/// observed rate-limit rejection. One shared instance is the process's whole
/// call budget; every outbound ledger call goes through `wait_if_needed`
/// first.
pub struct RateLimiter {
    max_per_minute: usize,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        RateLimiter {
            max_per_minute,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Pace the caller, then attribute a call to the budget. Holding the
    /// state lock across the pause also serializes concurrent callers, so
    /// the window bound holds within the process.
    pub async fn wait_if_needed(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        while state
            .recent
            .front()
            .is_some_and(|first| now.duration_since(*first) >= WINDOW)
        {
            state.recent.pop_front();
        }

        let pause = if state
            .last_rejection
            .is_some_and(|at| now.duration_since(at) < COOL_DOWN)
        {
            cool_down_pause()
        } else if state.recent.len() >= self.max_per_minute {
            match state.recent.front() {
                Some(oldest) => {
                    Duration::from_secs(WINDOW_DRAIN_SECS).saturating_sub(now.duration_since(*oldest))
                }
                None => baseline_pause(),
            }
        } else {
            baseline_pause()
        };

        if !pause.is_zero() {
            sleep(pause).await;
        }
        state.recent.push_back(Instant::now());
    }

    /// Record an observed rate-limit rejection; subsequent calls back off
    /// for the cool-down window.
    pub async fn note_rejection(&self) {
        self.state.lock().await.last_rejection = Some(Instant::now());
    }

    /// Calls currently attributed to the trailing window.
    pub async fn window_len(&self) -> usize {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        while state
            .recent
            .front()
            .is_some_and(|first| now.duration_since(*first) >= WINDOW)
        {
            state.recent.pop_front();
        }
        state.recent.len()
    }
}

// Jittered to decorrelate concurrent callers backing off together.
fn cool_down_pause() -> Duration {
    Duration::from_secs_f64(2.0 + rand::thread_rng().gen_range(0.5..1.5))
}

fn baseline_pause() -> Duration {
    Duration::from_secs_f64(rand::thread_rng().gen_range(0.2..0.5))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn window_never_exceeds_the_ceiling() {
        let limiter = RateLimiter::new(MAX_CALLS_PER_MINUTE);
        for _ in 0..120 {
            limiter.wait_if_needed().await;
            assert!(limiter.window_len().await <= MAX_CALLS_PER_MINUTE);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn full_window_waits_for_the_oldest_call_to_leave() {
        let limiter = RateLimiter::new(2);
        limiter.wait_if_needed().await;
        limiter.wait_if_needed().await;

        let before = Instant::now();
        limiter.wait_if_needed().await;
        let waited = Instant::now().duration_since(before);
        assert!(
            waited >= Duration::from_secs(60),
            "waited only {waited:?}"
        );
        assert!(limiter.window_len().await <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn baseline_pacing_is_a_fraction_of_a_second() {
        let limiter = RateLimiter::new(MAX_CALLS_PER_MINUTE);
        let before = Instant::now();
        limiter.wait_if_needed().await;
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_millis(200));
        assert!(waited < Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_triggers_the_cool_down_pause() {
        let limiter = RateLimiter::new(MAX_CALLS_PER_MINUTE);
        limiter.note_rejection().await;

        let before = Instant::now();
        limiter.wait_if_needed().await;
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_millis(2500));
        assert!(waited < Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn cool_down_expires_after_its_window() {
        let limiter = RateLimiter::new(MAX_CALLS_PER_MINUTE);
        limiter.note_rejection().await;
        tokio::time::advance(COOL_DOWN + Duration::from_secs(1)).await;

        let before = Instant::now();
        limiter.wait_if_needed().await;
        let waited = Instant::now().duration_since(before);
        assert!(waited < Duration::from_millis(500));
    }
}
