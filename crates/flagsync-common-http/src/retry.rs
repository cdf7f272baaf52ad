// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Retry logic with exponential backoff for HTTP requests.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

/// Spread applied around the computed delay when jitter is enabled (±20%).
const JITTER_SPREAD: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct RetryConfig {
	pub max_attempts: u32,
	pub base_delay: Duration,
	pub max_delay: Duration,
	pub backoff_factor: f64,
	pub jitter: bool,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			base_delay: Duration::from_millis(200),
			max_delay: Duration::from_secs(5),
			backoff_factor: 2.0,
			jitter: true,
		}
	}
}

/// Reasons a [`RetryConfig`] is rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryConfigError {
	#[error("max_attempts must be at least 1")]
	ZeroAttempts,

	#[error("base_delay must be positive")]
	ZeroBaseDelay,

	#[error("max_delay ({max_delay:?}) must not be shorter than base_delay ({base_delay:?})")]
	MaxBelowBase {
		base_delay: Duration,
		max_delay: Duration,
	},

	#[error("backoff_factor must be a finite number >= 1.0, got {0}")]
	InvalidBackoffFactor(f64),
}

impl RetryConfig {
	/// A configuration that performs exactly one attempt.
	pub fn no_retry() -> Self {
		Self {
			max_attempts: 1,
			..Self::default()
		}
	}

	pub fn validate(&self) -> Result<(), RetryConfigError> {
		if self.max_attempts == 0 {
			return Err(RetryConfigError::ZeroAttempts);
		}
		if self.base_delay.is_zero() {
			return Err(RetryConfigError::ZeroBaseDelay);
		}
		if self.max_delay < self.base_delay {
			return Err(RetryConfigError::MaxBelowBase {
				base_delay: self.base_delay,
				max_delay: self.max_delay,
			});
		}
		if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
			return Err(RetryConfigError::InvalidBackoffFactor(self.backoff_factor));
		}
		Ok(())
	}
}

pub trait RetryableError {
	fn is_retryable(&self) -> bool;
}

fn is_retryable_status(status: StatusCode) -> bool {
	matches!(
		status,
		StatusCode::TOO_MANY_REQUESTS
			| StatusCode::REQUEST_TIMEOUT
			| StatusCode::INTERNAL_SERVER_ERROR
			| StatusCode::BAD_GATEWAY
			| StatusCode::SERVICE_UNAVAILABLE
			| StatusCode::GATEWAY_TIMEOUT
	)
}

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() {
			return true;
		}

		self.status().map(is_retryable_status).unwrap_or(false)
	}
}

/// Computes the wait before the retry that follows attempt number `attempt`
/// (zero based).
///
/// The result always lies within `[base_delay, max_delay]`, jitter included.
pub fn calculate_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
	let exponent = attempt.min(i32::MAX as u32) as i32;
	let exponential_delay = cfg.base_delay.as_secs_f64() * cfg.backoff_factor.powi(exponent);
	let capped_delay = exponential_delay.min(cfg.max_delay.as_secs_f64());

	let final_delay = if cfg.jitter {
		let jitter_factor = 1.0 - JITTER_SPREAD + fastrand::f64() * (2.0 * JITTER_SPREAD);
		capped_delay * jitter_factor
	} else {
		capped_delay
	};

	let bounded = final_delay
		.max(cfg.base_delay.as_secs_f64())
		.min(cfg.max_delay.as_secs_f64());

	Duration::from_secs_f64(bounded)
}

/// Runs `f` until it succeeds, returns a non-retryable error, or runs out of attempts.
pub async fn retry<F, Fut, T, E>(cfg: &RetryConfig, f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, E>>,
	E: RetryableError + std::fmt::Debug,
{
	retry_if(cfg, |err: &E| err.is_retryable(), f).await
}

/// Like [`retry`], but classifies errors with an explicit predicate.
pub async fn retry_if<F, Fut, T, E, P>(cfg: &RetryConfig, is_retryable: P, mut f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, E>>,
	E: std::fmt::Debug,
	P: Fn(&E) -> bool,
{
	let max_attempts = cfg.max_attempts.max(1);
	let mut attempt = 0;

	loop {
		attempt += 1;
		debug!(attempt = attempt, max_attempts = max_attempts, "attempting operation");

		match f().await {
			Ok(result) => return Ok(result),
			Err(err) => {
				if !is_retryable(&err) {
					warn!(
							error = ?err,
							attempt = attempt,
							"non-retryable error encountered"
					);
					return Err(err);
				}

				if attempt >= max_attempts {
					warn!(
							error = ?err,
							attempt = attempt,
							max_attempts = max_attempts,
							"max retry attempts exhausted"
					);
					return Err(err);
				}

				let delay = calculate_delay(cfg, attempt - 1);
				warn!(
						error = ?err,
						attempt = attempt,
						max_attempts = max_attempts,
						delay_ms = delay.as_millis(),
						"retrying after error"
				);

				tokio::time::sleep(delay).await;
			}
		}
	}
}
