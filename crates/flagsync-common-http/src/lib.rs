// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP utilities for flagsync.
//!
//! This crate provides:
//! - A pre-configured HTTP client with a consistent User-Agent header
//! - The [`HttpTransport`] seam the SDK core talks to, with a `reqwest` implementation
//! - Retry logic with exponential backoff and jitter for transient failures
//! - Circuit breakers keyed by logical operation name

mod circuit;
mod client;
mod retry;
mod transport;

pub use circuit::{
	CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitError, CircuitFailure,
	CircuitSnapshot, CircuitState,
};
pub use client::{builder, user_agent, SDK_NAME, SDK_VERSION};
pub use retry::{calculate_delay, retry, retry_if, RetryConfig, RetryConfigError, RetryableError};
pub use transport::{
	HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, SharedTransport,
	TransportError,
};
