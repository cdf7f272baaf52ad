// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Circuit breakers scoped to a logical operation key.
//!
//! A breaker counts consecutive service failures of the operation it guards.
//! Once the count reaches the threshold the breaker opens and rejects calls
//! without running them until the reset timeout has elapsed, after which a
//! single probe call decides whether it closes again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Message fragments that identify failures caused by the host environment
/// (for example browser cross-origin restrictions) rather than the service.
const DEFAULT_ENVIRONMENT_PATTERNS: &[&str] = &[
	"cors",
	"cross-origin",
	"access-control-allow-origin",
	"blocked by client",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
	Closed,
	Open,
	HalfOpen,
}

impl fmt::Display for CircuitState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CircuitState::Closed => write!(f, "closed"),
			CircuitState::Open => write!(f, "open"),
			CircuitState::HalfOpen => write!(f, "half-open"),
		}
	}
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
	/// Consecutive counted failures that open the circuit.
	pub failure_threshold: u32,
	/// How long the circuit stays open before a probe is allowed.
	pub reset_timeout: Duration,
	/// Lowercase fragments matched against error messages; matching failures
	/// are not counted.
	pub environment_failure_patterns: Vec<String>,
}

impl Default for CircuitBreakerConfig {
	fn default() -> Self {
		Self {
			failure_threshold: 5,
			reset_timeout: Duration::from_secs(30),
			environment_failure_patterns: DEFAULT_ENVIRONMENT_PATTERNS
				.iter()
				.map(|p| p.to_string())
				.collect(),
		}
	}
}

impl CircuitBreakerConfig {
	/// Configuration for hosts known to produce transient environment failures.
	///
	/// Uses a shortened reset timeout so a spurious open recovers quickly.
	pub fn restricted_environment() -> Self {
		Self {
			reset_timeout: Duration::from_secs(5),
			..Self::default()
		}
	}

	fn is_environment_failure(&self, message: &str) -> bool {
		let message = message.to_lowercase();
		self
			.environment_failure_patterns
			.iter()
			.any(|p| message.contains(p.as_str()))
	}
}

/// Classification hook for errors passing through a breaker.
pub trait CircuitFailure: fmt::Display {
	/// Whether the error says something about the health of the service.
	///
	/// Client errors such as a rejected request do not count towards opening
	/// the circuit.
	fn is_service_failure(&self) -> bool {
		true
	}
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
	/// The breaker rejected the call without running it.
	#[error("circuit '{key}' is open, retry after {retry_after:?}")]
	Open { key: String, retry_after: Duration },

	/// The guarded operation ran and failed.
	#[error("{0}")]
	Inner(E),
}

impl<E> CircuitError<E> {
	pub fn is_open(&self) -> bool {
		matches!(self, CircuitError::Open { .. })
	}

	pub fn into_inner(self) -> Option<E> {
		match self {
			CircuitError::Inner(e) => Some(e),
			CircuitError::Open { .. } => None,
		}
	}
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
	pub key: String,
	pub state: CircuitState,
	pub failure_count: u32,
	pub last_failure: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
	state: CircuitState,
	failure_count: u32,
	last_failure: Option<Instant>,
	opened_at: Option<Instant>,
	probe_in_flight: bool,
}

impl BreakerInner {
	fn new() -> Self {
		Self {
			state: CircuitState::Closed,
			failure_count: 0,
			last_failure: None,
			opened_at: None,
			probe_in_flight: false,
		}
	}

	/// Moves an expired open circuit to half-open.
	fn refresh(&mut self, reset_timeout: Duration, key: &str) {
		if self.state != CircuitState::Open {
			return;
		}
		let expired = self
			.opened_at
			.map(|at| at.elapsed() >= reset_timeout)
			.unwrap_or(true);
		if expired {
			self.state = CircuitState::HalfOpen;
			self.probe_in_flight = false;
			info!(key = %key, "circuit half-open, next call is a probe");
		}
	}

	fn remaining(&self, reset_timeout: Duration) -> Duration {
		self
			.opened_at
			.map(|at| reset_timeout.saturating_sub(at.elapsed()))
			.unwrap_or_default()
	}
}

enum Permit {
	Normal,
	Probe,
}

/// Clears the half-open probe slot if the probe future is dropped before
/// reporting an outcome.
struct ProbeGuard<'a> {
	breaker: &'a CircuitBreaker,
	armed: bool,
}

impl Drop for ProbeGuard<'_> {
	fn drop(&mut self) {
		if self.armed {
			let mut inner = self.breaker.inner.lock();
			if inner.state == CircuitState::HalfOpen {
				inner.probe_in_flight = false;
			}
		}
	}
}

/// A circuit breaker for one logical operation.
#[derive(Debug)]
pub struct CircuitBreaker {
	key: String,
	config: CircuitBreakerConfig,
	inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
	pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
		Self {
			key: key.into(),
			config,
			inner: Mutex::new(BreakerInner::new()),
		}
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn config(&self) -> &CircuitBreakerConfig {
		&self.config
	}

	pub fn state(&self) -> CircuitState {
		let mut inner = self.inner.lock();
		inner.refresh(self.config.reset_timeout, &self.key);
		inner.state
	}

	pub fn snapshot(&self) -> CircuitSnapshot {
		let mut inner = self.inner.lock();
		inner.refresh(self.config.reset_timeout, &self.key);
		CircuitSnapshot {
			key: self.key.clone(),
			state: inner.state,
			failure_count: inner.failure_count,
			last_failure: inner.last_failure,
		}
	}

	/// Runs `f` unless the circuit rejects the call.
	pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
	where
		F: FnOnce() -> Fut,
		Fut: std::future::Future<Output = Result<T, E>>,
		E: CircuitFailure,
	{
		let permit = self.acquire().map_err(|retry_after| {
			debug!(key = %self.key, retry_after_ms = retry_after.as_millis(), "circuit open, rejecting call");
			CircuitError::Open {
				key: self.key.clone(),
				retry_after,
			}
		})?;

		let mut guard = ProbeGuard {
			breaker: self,
			armed: matches!(permit, Permit::Probe),
		};

		let result = f().await;
		guard.armed = false;

		match result {
			Ok(value) => {
				self.on_success();
				Ok(value)
			}
			Err(err) => {
				if self.counts_as_failure(&err) {
					self.on_failure();
				} else {
					self.on_ignored_failure(&err);
				}
				Err(CircuitError::Inner(err))
			}
		}
	}

	/// Closes the circuit and clears the failure history.
	pub fn reset(&self) {
		let mut inner = self.inner.lock();
		*inner = BreakerInner::new();
		info!(key = %self.key, "circuit manually reset");
	}

	/// Opens the circuit regardless of the failure history.
	pub fn force_open(&self) {
		let mut inner = self.inner.lock();
		inner.state = CircuitState::Open;
		inner.opened_at = Some(Instant::now());
		inner.probe_in_flight = false;
		warn!(key = %self.key, "circuit forced open");
	}

	fn acquire(&self) -> Result<Permit, Duration> {
		let mut inner = self.inner.lock();
		inner.refresh(self.config.reset_timeout, &self.key);

		match inner.state {
			CircuitState::Closed => Ok(Permit::Normal),
			CircuitState::Open => Err(inner.remaining(self.config.reset_timeout)),
			CircuitState::HalfOpen => {
				if inner.probe_in_flight {
					Err(Duration::ZERO)
				} else {
					inner.probe_in_flight = true;
					Ok(Permit::Probe)
				}
			}
		}
	}

	fn counts_as_failure<E: CircuitFailure>(&self, err: &E) -> bool {
		err.is_service_failure() && !self.config.is_environment_failure(&err.to_string())
	}

	fn on_success(&self) {
		let mut inner = self.inner.lock();
		match inner.state {
			CircuitState::Closed => {
				inner.failure_count = 0;
			}
			CircuitState::HalfOpen => {
				inner.state = CircuitState::Closed;
				inner.failure_count = 0;
				inner.opened_at = None;
				inner.probe_in_flight = false;
				info!(key = %self.key, "circuit closed after successful probe");
			}
			CircuitState::Open => {}
		}
	}

	fn on_failure(&self) {
		let mut inner = self.inner.lock();
		let now = Instant::now();
		inner.last_failure = Some(now);

		match inner.state {
			CircuitState::Closed => {
				inner.failure_count += 1;
				if inner.failure_count >= self.config.failure_threshold {
					inner.state = CircuitState::Open;
					inner.opened_at = Some(now);
					warn!(
						key = %self.key,
						failures = inner.failure_count,
						reset_timeout_ms = self.config.reset_timeout.as_millis(),
						"circuit opened"
					);
				}
			}
			CircuitState::HalfOpen => {
				inner.failure_count += 1;
				inner.state = CircuitState::Open;
				inner.opened_at = Some(now);
				inner.probe_in_flight = false;
				warn!(key = %self.key, "probe failed, circuit re-opened");
			}
			CircuitState::Open => {}
		}
	}

	fn on_ignored_failure<E: CircuitFailure>(&self, err: &E) {
		let mut inner = self.inner.lock();
		if inner.state == CircuitState::HalfOpen {
			inner.probe_in_flight = false;
		}
		debug!(key = %self.key, error = %err, "failure not counted towards circuit");
	}
}

/// Hands out one shared breaker per key.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
	default_config: CircuitBreakerConfig,
	breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl CircuitBreakerRegistry {
	pub fn new(default_config: CircuitBreakerConfig) -> Self {
		Self {
			default_config,
			breakers: Arc::new(Mutex::new(HashMap::new())),
		}
	}

	/// Returns the breaker for `key`, creating it with the registry's default config.
	pub fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
		self.get_or_create_with(key, self.default_config.clone())
	}

	/// Returns the breaker for `key`, creating it with `config` if absent.
	pub fn get_or_create_with(&self, key: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
		let mut breakers = self.breakers.lock();
		breakers
			.entry(key.to_string())
			.or_insert_with(|| Arc::new(CircuitBreaker::new(key, config)))
			.clone()
	}

	pub fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
		self.breakers.lock().get(key).cloned()
	}

	pub fn keys(&self) -> Vec<String> {
		let mut keys: Vec<String> = self.breakers.lock().keys().cloned().collect();
		keys.sort();
		keys
	}

	/// Resets every breaker.
	pub fn reset_all(&self) {
		let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.lock().values().cloned().collect();
		for breaker in breakers {
			breaker.reset();
		}
	}
}
