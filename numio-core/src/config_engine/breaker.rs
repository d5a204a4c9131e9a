//! Per-provider-tier circuit breakers.
//!
//! A breaker opens after a configured number of consecutive failures and
//! short-circuits every caller until a probe call succeeds. Shared between
//! all callers of a provider tier, so a broken upstream fails fast
//! everywhere at once instead of burning a timeout per caller.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config_engine::ProviderError;

#[derive(Copy, Clone, Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { since: Instant },
    /// One probe call is in flight; everyone else still fails fast.
    HalfOpen,
}

pub struct CircuitBreaker {
    name: String,
    /// Consecutive failures before opening.
    threshold: u32,
    /// How long the breaker stays open before admitting a probe.
    cooldown: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(State::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Checks whether a call may proceed. Fails fast (no I/O, no await)
    /// with [`ProviderError::BreakerOpen`] while the breaker is open.
    pub fn check(&self) -> Result<(), ProviderError> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { .. } => Ok(()),
            State::HalfOpen => Err(ProviderError::BreakerOpen),
            State::Open { since } =>
                if since.elapsed() >= self.cooldown {
                    // This caller becomes the probe.
                    *state = State::HalfOpen;
                    Ok(())
                } else {
                    Err(ProviderError::BreakerOpen)
                },
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, State::HalfOpen | State::Open { .. }) {
            info!("Circuit breaker '{}' closed after probe", self.name);
        }
        *state = State::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    warn!(
                        "Circuit breaker '{}' opened after {failures} \
                         consecutive failures",
                        self.name,
                    );
                    *state = State::Open {
                        since: Instant::now(),
                    };
                } else {
                    *state = State::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            // The probe failed; back to fully open.
            State::HalfOpen => {
                *state = State::Open {
                    since: Instant::now(),
                };
            }
            State::Open { .. } => (),
        }
    }

    /// Convenience wrapper: run `call` under the breaker, recording the
    /// outcome. Timeouts and availability errors trip the breaker; typed
    /// upstream answers (out of stock, bad service) do not.
    pub async fn run<T, F>(&self, call: F) -> Result<T, ProviderError>
    where
        F: std::future::Future<Output = Result<T, ProviderError>>,
    {
        self.check()?;
        let result = call.await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.trips_breaker() => self.record_failure(),
            // A definitive upstream answer still proves liveness.
            Err(_) => self.record_success(),
        }
        result
    }
}

impl ProviderError {
    /// Whether this failure should count against the circuit breaker.
    pub fn trips_breaker(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Unavailable(_) | Self::BadResponse(_)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const K: u32 = 3;

    /// After K consecutive failures the breaker opens, and subsequent
    /// calls fail fast (well under a millisecond) until a probe succeeds.
    #[test]
    fn opens_after_k_failures_and_fails_fast() {
        let breaker =
            CircuitBreaker::new("acme", K, Duration::from_secs(3600));

        for _ in 0..(K - 1) {
            breaker.check().unwrap();
            breaker.record_failure();
        }
        breaker.check().unwrap();
        breaker.record_failure();

        // Open: every check fails, and fails fast.
        for _ in 0..100 {
            let start = Instant::now();
            let result = breaker.check();
            let elapsed = start.elapsed();
            assert_eq!(result, Err(ProviderError::BreakerOpen));
            assert!(elapsed < Duration::from_millis(1), "{elapsed:?}");
        }
    }

    #[test]
    fn probe_closes_or_reopens() {
        let breaker = CircuitBreaker::new("acme", 1, Duration::ZERO);
        breaker.record_failure();

        // Cooldown elapsed (zero): exactly one probe gets through.
        breaker.check().unwrap();
        assert_eq!(breaker.check(), Err(ProviderError::BreakerOpen));

        // Failed probe reopens.
        breaker.record_failure();
        breaker.check().unwrap();

        // Successful probe closes for everyone.
        breaker.record_success();
        breaker.check().unwrap();
        breaker.check().unwrap();
    }

    #[tokio::test]
    async fn run_distinguishes_typed_errors() {
        let breaker = CircuitBreaker::new("acme", 1, Duration::from_secs(3600));

        // A typed upstream answer is not a breaker failure.
        let result: Result<(), _> =
            breaker.run(async { Err(ProviderError::OutOfStock) }).await;
        assert_eq!(result, Err(ProviderError::OutOfStock));
        breaker.check().unwrap();

        // A transport failure is.
        let result: Result<(), _> = breaker
            .run(async { Err(ProviderError::Timeout) })
            .await;
        assert_eq!(result, Err(ProviderError::Timeout));
        assert_eq!(breaker.check(), Err(ProviderError::BreakerOpen));
    }
}
