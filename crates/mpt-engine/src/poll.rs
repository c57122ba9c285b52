//! Bounded waiting. Every wait in the engine goes through here so that no loop can spin forever.

use std::thread;
use std::time::{Duration, Instant};

/// The bound elapsed before the condition was met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired;

/// Calls `f` until it yields a value or `bound` has elapsed, sleeping `interval` between calls.
///
/// `f` is always called at least once, and once more after the deadline passes, so a condition
/// that becomes true during the last sleep is not reported as expired.
pub fn poll_until<T>(
    interval: Duration,
    bound: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> Result<T, Expired> {
    let deadline = Instant::now() + bound;
    loop {
        if let Some(v) = f() {
            return Ok(v);
        }
        let now = Instant::now();
        if now >= deadline {
            return f().ok_or(Expired);
        }
        thread::sleep(interval.min(deadline - now));
    }
}

/// Runs `f` up to `attempts` times, sleeping `interval` between failures. Returns the last error.
pub fn retry<T, E>(
    attempts: u32,
    interval: Duration,
    mut f: impl FnMut(u32) -> Result<T, E>,
) -> Result<T, E> {
    let mut attempt = 1;
    loop {
        match f(attempt) {
            Ok(v) => return Ok(v),
            Err(err) if attempt >= attempts => return Err(err),
            Err(_) => {
                attempt += 1;
                if !interval.is_zero() {
                    thread::sleep(interval);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_success_does_not_sleep() {
        let start = Instant::now();
        let v = poll_until(Duration::from_secs(1), Duration::from_secs(5), || Some(7)).unwrap();
        assert_eq!(v, 7);
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn expires_after_bound() {
        let start = Instant::now();
        let mut calls = 0;
        let res: Result<(), _> = poll_until(Duration::from_millis(5), Duration::from_millis(30), || {
            calls += 1;
            None
        });
        assert_eq!(res, Err(Expired));
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert!(calls >= 2);
    }

    #[test]
    fn retry_counts_attempts() {
        let mut seen = Vec::new();
        let res: Result<u32, &str> = retry(5, Duration::ZERO, |attempt| {
            seen.push(attempt);
            if attempt == 3 {
                Ok(attempt)
            } else {
                Err("no")
            }
        });
        assert_eq!(res, Ok(3));
        assert_eq!(seen, vec![1, 2, 3]);

        let res: Result<(), u32> = retry(2, Duration::ZERO, Err);
        assert_eq!(res, Err(2));
    }
}
