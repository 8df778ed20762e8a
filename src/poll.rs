use crate::error::Result;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl PollPolicy {
    pub fn new(attempts: u32, delay_ms: u64) -> Self {
        PollPolicy {
            attempts,
            delay: Duration::from_millis(delay_ms),
        }
    }
}

/// Calls `probe` until it yields a value, returns an error, or the attempt
/// budget is spent. `probe` receives the 1-based attempt number. Sleeps
/// `delay` between attempts, never after the last one. Exhaustion is
/// `Ok(None)`.
pub fn wait_until<T, F>(policy: &PollPolicy, mut probe: F) -> Result<Option<T>>
where
    F: FnMut(u32) -> Result<Option<T>>,
{
    for attempt in 1..=policy.attempts {
        if let Some(value) = probe(attempt)? {
            return Ok(Some(value));
        }
        if attempt < policy.attempts && !policy.delay.is_zero() {
            thread::sleep(policy.delay);
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DevstackError;

    #[test]
    fn returns_on_first_ready_attempt() {
        let policy = PollPolicy::new(5, 0);
        let mut seen = Vec::new();
        let got = wait_until(&policy, |attempt| {
            seen.push(attempt);
            Ok((attempt == 3).then_some(attempt))
        })
        .unwrap();
        assert_eq!(got, Some(3));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn exhaustion_is_none_after_exact_budget() {
        let policy = PollPolicy::new(4, 0);
        let mut calls = 0;
        let got: Option<()> = wait_until(&policy, |_| {
            calls += 1;
            Ok(None)
        })
        .unwrap();
        assert!(got.is_none());
        assert_eq!(calls, 4);
    }

    #[test]
    fn probe_error_aborts_immediately() {
        let policy = PollPolicy::new(10, 0);
        let mut calls = 0;
        let result: Result<Option<()>> = wait_until(&policy, |_| {
            calls += 1;
            Err(DevstackError::Process("gone".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn zero_attempts_never_probes() {
        let policy = PollPolicy::new(0, 0);
        let got: Option<()> = wait_until(&policy, |_| panic!("must not probe")).unwrap();
        assert!(got.is_none());
    }
}
