//! Anti-replay nonce source for the server transport.
//!
//! Nonces are monotonically increasing integers rendered as decimal strings.
//! A bounded buffer of accepted values guards against replay; values older
//! than the buffer window age out and are refused as stale.

use std::collections::VecDeque;

/// Generator and validator for `Replay-Nonce` tokens.
///
/// `next()` hands out a fresh nonce; [`NonceSource::use_nonce`] consumes one.
/// A nonce is accepted at most once, and only while it is newer than the
/// oldest value remembered by the sliding used-buffer.
#[derive(Debug)]
pub struct NonceSource {
    /// Next value to hand out.
    next: u64,
    /// Values at or below this are stale.
    min: u64,
    /// Recently consumed values, oldest first.
    used: VecDeque<u64>,
    capacity: usize,
}

impl NonceSource {
    pub fn new(start: u64, capacity: usize) -> Self {
        NonceSource {
            next: start,
            min: start.saturating_sub(1),
            used: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    /// Issue a fresh nonce.
    pub fn next(&mut self) -> String {
        let value = self.next;
        self.next += 1;
        value.to_string()
    }

    /// Consume a client-supplied nonce.
    ///
    /// Accepts iff the token is all digits, was issued by this source, is
    /// newer than the aged-out window and has not been consumed before.
    pub fn use_nonce(&mut self, token: &str) -> bool {
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            log::debug!("rejecting malformed nonce {token:?}");
            return false;
        }
        let value = match token.parse::<u64>() {
            Ok(value) => value,
            Err(_) => return false,
        };
        if value <= self.min || value >= self.next {
            log::debug!("rejecting stale or unissued nonce {value}");
            return false;
        }
        if self.used.contains(&value) {
            log::debug!("rejecting replayed nonce {value}");
            return false;
        }

        self.used.push_back(value);
        if self.used.len() > self.capacity {
            // The evicted value becomes the new floor, aging out everything
            // issued before it.
            self.min = self.used.pop_front().unwrap_or(self.min);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_each_nonce_once() {
        let mut src = NonceSource::new(1000, 8);
        let n1 = src.next();
        let n2 = src.next();
        assert!(src.use_nonce(&n1));
        assert!(src.use_nonce(&n2));
        assert!(!src.use_nonce(&n1), "replay must be rejected");
        assert!(!src.use_nonce(&n2), "replay must be rejected");
    }

    #[test]
    fn test_rejects_malformed_and_unissued() {
        let mut src = NonceSource::new(1, 8);
        let _ = src.next();
        assert!(!src.use_nonce(""));
        assert!(!src.use_nonce("12three"));
        assert!(!src.use_nonce("-4"));
        // Never issued.
        assert!(!src.use_nonce("999"));
        // Below the starting floor.
        assert!(!src.use_nonce("0"));
    }

    #[test]
    fn test_old_nonces_age_out() {
        let mut src = NonceSource::new(1, 2);
        let first = src.next();
        let burn: Vec<String> = (0..3).map(|_| src.next()).collect();
        for nonce in &burn {
            assert!(src.use_nonce(nonce));
        }
        // Consuming three nonces through a window of two evicted the first
        // accepted one, so anything at or below it is now stale.
        assert!(!src.use_nonce(&first));
    }

    #[test]
    fn test_out_of_order_use() {
        let mut src = NonceSource::new(7, 4);
        let a = src.next();
        let b = src.next();
        let c = src.next();
        assert!(src.use_nonce(&c));
        assert!(src.use_nonce(&a));
        assert!(src.use_nonce(&b));
        assert!(!src.use_nonce(&c));
    }
}
