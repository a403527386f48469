use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use log::{info, warn};
use tokio::time::Instant;

use crate::api::BreakerState;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub window: Duration,
    pub cooldown: Duration,
}
impl CircuitBreakerConfig {
    pub fn rpc() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
pub enum CircuitError<E> {
    Open { retry_in: Duration },
    Inner(E),
}

#[derive(Debug)]
enum State {
    Closed { failures: VecDeque<Instant> },
    Open { until: Instant },
    HalfOpen { trial_started: Instant },
}

pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    state: Mutex<State>,
}
impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(State::Closed {
                failures: VecDeque::new(),
            }),
        }
    }
    pub fn state(&self) -> BreakerState {
        match &*self.lock() {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { until } if Instant::now() < *until => BreakerState::Open,
            State::Open { .. } | State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }
    /// Runs `op` unless the circuit is open. While half-open only a single
    /// trial call is let through.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.acquire()?;
        let result = op().await;
        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
    fn acquire<E>(&self) -> Result<(), CircuitError<E>> {
        let now = Instant::now();
        let mut state = self.lock();
        match &*state {
            State::Closed { .. } => Ok(()),
            State::Open { until } if now < *until => Err(CircuitError::Open {
                retry_in: *until - now,
            }),
            State::Open { .. } => {
                info!("Circuit {} half-open, allowing a trial call", self.name);
                *state = State::HalfOpen { trial_started: now };
                Ok(())
            }
            // a trial that never reported back (dropped future) expires after a cooldown
            State::HalfOpen { trial_started } if now - *trial_started >= self.config.cooldown => {
                *state = State::HalfOpen { trial_started: now };
                Ok(())
            }
            State::HalfOpen { trial_started } => Err(CircuitError::Open {
                retry_in: self.config.cooldown - (now - *trial_started),
            }),
        }
    }
    fn on_success(&self) {
        let mut state = self.lock();
        if let State::HalfOpen { .. } = &*state {
            info!("Circuit {} closed after successful trial call", self.name);
            *state = State::Closed {
                failures: VecDeque::new(),
            };
        }
    }
    fn on_failure(&self) {
        let now = Instant::now();
        let mut state = self.lock();
        match &mut *state {
            State::Closed { failures } => {
                failures.push_back(now);
                while let Some(first) = failures.front() {
                    if now - *first > self.config.window {
                        failures.pop_front();
                    } else {
                        break;
                    }
                }
                if failures.len() >= self.config.failure_threshold {
                    warn!(
                        "Circuit {} opened after {} failures within {:?}",
                        self.name,
                        failures.len(),
                        self.config.window
                    );
                    *state = State::Open {
                        until: now + self.config.cooldown,
                    };
                }
            }
            State::HalfOpen { .. } => {
                warn!("Circuit {} trial call failed, reopening", self.name);
                *state = State::Open {
                    until: now + self.config.cooldown,
                };
            }
            State::Open { .. } => {}
        }
    }
}
