// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.
//!
//! Every section has a `Default` matching the production defaults and a
//! `validate()` that the client builder runs before anything is started.

use std::time::Duration;

use flagsync_common_http::{CircuitBreakerConfig, RetryConfig};
use flagsync_core::RotationPolicy;

use crate::error::{FlagsyncError, Result};

fn invalid(msg: impl Into<String>) -> FlagsyncError {
	FlagsyncError::Validation(msg.into())
}

/// Connection monitor timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
	/// How often the heartbeat checks for a stale connection.
	pub heartbeat_interval: Duration,
	/// The connection is stale when nothing succeeded for this long.
	pub stale_after: Duration,
	pub reconnect_base_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			heartbeat_interval: Duration::from_secs(15),
			stale_after: Duration::from_secs(60),
			reconnect_base_delay: Duration::from_secs(1),
			reconnect_max_delay: Duration::from_secs(60),
		}
	}
}

impl ConnectionConfig {
	pub fn validate(&self) -> Result<()> {
		if self.heartbeat_interval.is_zero() {
			return Err(invalid("heartbeat_interval must be positive"));
		}
		if self.reconnect_base_delay.is_zero() {
			return Err(invalid("reconnect_base_delay must be positive"));
		}
		if self.reconnect_max_delay < self.reconnect_base_delay {
			return Err(invalid(
				"reconnect_max_delay must not be below reconnect_base_delay",
			));
		}
		Ok(())
	}
}

/// Configuration polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollingConfig {
	pub interval: Duration,
	/// Used while the host reports battery or background constraints.
	pub reduced_interval: Duration,
	/// Skip polls entirely while the app is backgrounded.
	pub disable_background_polling: bool,
}

impl Default for PollingConfig {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(30),
			reduced_interval: Duration::from_secs(300),
			disable_background_polling: false,
		}
	}
}

impl PollingConfig {
	pub fn validate(&self) -> Result<()> {
		if self.interval.is_zero() || self.reduced_interval.is_zero() {
			return Err(invalid("polling intervals must be positive"));
		}
		Ok(())
	}
}

/// One telemetry queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
	/// Records held in memory before the oldest are evicted.
	pub capacity: usize,
	pub max_batch_size: usize,
	/// Period of the background flush timer.
	pub flush_interval: Duration,
	/// Records that have waited this long are flushed even between timer
	/// ticks.
	pub flush_time: Duration,
	/// Bound on records kept across failed flushes and persisted to storage.
	pub max_stored: usize,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			capacity: 100,
			max_batch_size: 50,
			flush_interval: Duration::from_secs(3),
			flush_time: Duration::from_secs(30),
			max_stored: 1000,
		}
	}
}

impl QueueConfig {
	pub fn validate(&self) -> Result<()> {
		if self.capacity == 0 {
			return Err(invalid("queue capacity must be positive"));
		}
		if self.max_batch_size == 0 {
			return Err(invalid("max_batch_size must be positive"));
		}
		if self.flush_interval.is_zero() {
			return Err(invalid("flush_interval must be positive"));
		}
		if self.max_stored < self.capacity {
			return Err(invalid(format!(
				"max_stored ({}) must be at least the queue capacity ({})",
				self.max_stored, self.capacity
			)));
		}
		Ok(())
	}
}

/// Server paths, relative to the base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
	pub config: String,
	pub events: String,
	pub summaries: String,
}

impl Default for Endpoints {
	fn default() -> Self {
		Self {
			config: "/api/sdk/config".to_string(),
			events: "/api/sdk/events".to_string(),
			summaries: "/api/sdk/summaries".to_string(),
		}
	}
}

/// Configuration for the flagsync client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Timeout for individual HTTP requests.
	pub request_timeout: Duration,
	/// How long `build()` waits for the first configuration fetch.
	pub init_timeout: Duration,
	/// Whether `build()` waits for the first fetch at all.
	pub wait_for_initial_fetch: bool,
	pub retry: RetryConfig,
	pub circuit_breaker: CircuitBreakerConfig,
	pub connection: ConnectionConfig,
	pub polling: PollingConfig,
	pub events: QueueConfig,
	pub summaries: QueueConfig,
	pub session: RotationPolicy,
	pub endpoints: Endpoints,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			request_timeout: Duration::from_secs(10),
			init_timeout: Duration::from_secs(10),
			wait_for_initial_fetch: true,
			retry: RetryConfig::default(),
			circuit_breaker: CircuitBreakerConfig::default(),
			connection: ConnectionConfig::default(),
			polling: PollingConfig::default(),
			events: QueueConfig::default(),
			summaries: QueueConfig::default(),
			session: RotationPolicy::default(),
			endpoints: Endpoints::default(),
		}
	}
}

impl ClientConfig {
	pub fn validate(&self) -> Result<()> {
		if self.request_timeout.is_zero() {
			return Err(invalid("request_timeout must be positive"));
		}
		self.retry.validate()?;
		if self.circuit_breaker.failure_threshold == 0 {
			return Err(invalid("failure_threshold must be positive"));
		}
		self.connection.validate()?;
		self.polling.validate()?;
		self
			.events
			.validate()
			.map_err(|e| invalid(format!("events queue: {e}")))?;
		self
			.summaries
			.validate()
			.map_err(|e| invalid(format!("summaries queue: {e}")))?;
		self.session.validate()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults_are_valid() {
		let config = ClientConfig::default();
		assert!(config.validate().is_ok());
		assert_eq!(config.retry.max_attempts, 3);
		assert_eq!(config.retry.base_delay, Duration::from_millis(200));
		assert_eq!(config.circuit_breaker.failure_threshold, 5);
		assert_eq!(config.connection.heartbeat_interval, Duration::from_secs(15));
		assert_eq!(config.polling.interval, Duration::from_secs(30));
		assert_eq!(config.events.capacity, 100);
		assert_eq!(config.events.flush_interval, Duration::from_secs(3));
		assert_eq!(config.summaries.max_stored, 1000);
	}

	#[test]
	fn test_queue_validation() {
		let mut config = ClientConfig::default();
		config.events.max_stored = 10;
		let err = config.validate().unwrap_err();
		assert!(err.to_string().contains("events queue"));

		let zero_batch = QueueConfig {
			max_batch_size: 0,
			..QueueConfig::default()
		};
		assert!(zero_batch.validate().is_err());
	}

	#[test]
	fn test_nested_validation_is_applied() {
		let mut config = ClientConfig::default();
		config.retry.max_attempts = 0;
		assert!(matches!(config.validate(), Err(FlagsyncError::Validation(_))));

		let mut config = ClientConfig::default();
		config.connection.reconnect_max_delay = Duration::from_millis(1);
		assert!(config.validate().is_err());

		let mut config = ClientConfig::default();
		config.session.min_session_duration = Duration::from_secs(86_400);
		assert!(config.validate().is_err());
	}
}
