use crate::error::{DevstackError, Result};
use crate::poll::{wait_until, PollPolicy};
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::{debug, info};

// Binary readiness signal: the response body is never inspected.
pub trait HealthProbe {
    fn check(&self, url: &str) -> bool;
}

pub struct HttpHealthProbe {
    client: Client,
}

impl HttpHealthProbe {
    pub fn new() -> Result<Self> {
        // The local proxy serves self-signed development certificates.
        let client = Client::builder()
            .timeout(Duration::from_secs(3))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(HttpHealthProbe { client })
    }
}

impl HealthProbe for HttpHealthProbe {
    fn check(&self, url: &str) -> bool {
        match self.client.get(url).send() {
            Ok(response) => {
                debug!(url, status = %response.status(), "health probe");
                response.status().is_success()
            }
            Err(err) => {
                debug!(url, error = %err, "health probe failed");
                false
            }
        }
    }
}

pub fn wait_for_http<P: HealthProbe + ?Sized>(
    probe: &P,
    what: &str,
    url: &str,
    policy: &PollPolicy,
) -> Result<()> {
    let ready = wait_until(policy, |attempt| {
        debug!(what, url, attempt, "waiting for health");
        Ok(probe.check(url).then_some(()))
    })?;
    match ready {
        Some(()) => {
            info!(what, url, "healthy");
            Ok(())
        }
        None => Err(DevstackError::HealthCheckTimeout {
            what: what.to_string(),
            check: format!("GET {url}"),
            attempts: policy.attempts,
        }),
    }
}

#[cfg(test)]
pub mod testing {
    use super::HealthProbe;
    use std::cell::Cell;

    // Fails the first `failures` checks, then succeeds.
    pub struct FlakyProbe {
        pub failures: u32,
        pub calls: Cell<u32>,
    }

    impl FlakyProbe {
        pub fn new(failures: u32) -> Self {
            FlakyProbe {
                failures,
                calls: Cell::new(0),
            }
        }
    }

    impl HealthProbe for FlakyProbe {
        fn check(&self, _url: &str) -> bool {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            n > self.failures
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FlakyProbe;
    use super::*;

    #[test]
    fn succeeds_on_the_poll_after_failures() {
        let probe = FlakyProbe::new(3);
        wait_for_http(&probe, "proxy", "https://localhost/health", &PollPolicy::new(5, 0))
            .unwrap();
        assert_eq!(probe.calls.get(), 4);
    }

    #[test]
    fn times_out_when_failures_exceed_budget() {
        let probe = FlakyProbe::new(5);
        let err = wait_for_http(&probe, "harness", "http://localhost:4444/status", &PollPolicy::new(5, 0))
            .expect_err("timeout");
        assert!(matches!(
            err,
            DevstackError::HealthCheckTimeout { attempts: 5, .. }
        ));
        assert!(err.to_string().contains("GET http://localhost:4444/status"));
        assert_eq!(probe.calls.get(), 5);
    }
}
