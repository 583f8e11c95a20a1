//! Global POST rate limiting.
//!
//! A fixed-size window of timestamps: the request is admitted while fewer
//! than `max_posts` POSTs happened inside the window, otherwise refused with
//! the number of seconds until the oldest slot exits.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug)]
pub(crate) struct RateWindow {
    max_posts: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl RateWindow {
    /// `max_posts == 0` disables the limiter.
    pub(crate) fn new(max_posts: usize, window: Duration) -> RateWindow {
        RateWindow {
            max_posts,
            window,
            stamps: VecDeque::new(),
        }
    }

    /// Admit or refuse one POST; on refusal returns whole seconds to wait.
    pub(crate) fn check(&mut self) -> Result<(), u64> {
        if self.max_posts == 0 {
            return Ok(());
        }

        let now = Instant::now();
        while let Some(oldest) = self.stamps.front() {
            if *oldest + self.window <= now {
                self.stamps.pop_front();
            } else {
                break;
            }
        }

        if self.stamps.len() >= self.max_posts {
            let oldest = *self.stamps.front().expect("window is non-empty");
            let wait = (oldest + self.window).saturating_duration_since(now);
            return Err(wait.as_secs_f64().ceil().max(1.0) as u64);
        }

        self.stamps.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_capacity() {
        let mut window = RateWindow::new(2, Duration::from_secs(60));
        assert!(window.check().is_ok());
        assert!(window.check().is_ok());
        let retry = window.check().unwrap_err();
        assert!(retry >= 1 && retry <= 60);
    }

    #[test]
    fn test_zero_capacity_is_unlimited() {
        let mut window = RateWindow::new(0, Duration::from_secs(1));
        for _ in 0..100 {
            assert!(window.check().is_ok());
        }
    }

    #[test]
    fn test_slots_age_out() {
        let mut window = RateWindow::new(1, Duration::from_millis(50));
        assert!(window.check().is_ok());
        assert!(window.check().is_err());
        std::thread::sleep(Duration::from_millis(60));
        assert!(window.check().is_ok());
    }
}
