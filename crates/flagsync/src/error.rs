// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the flagsync client.

use std::time::Duration;

use flagsync_common_http::{
	CircuitError, CircuitFailure, RetryConfigError, RetryableError, TransportError,
};
use flagsync_core::CoreError;
use thiserror::Error;

/// Result type alias for the flagsync client.
pub type Result<T> = std::result::Result<T, FlagsyncError>;

/// Errors that can occur in the flagsync client.
#[derive(Debug, Error)]
pub enum FlagsyncError {
	/// SDK key is missing or malformed.
	#[error("invalid or missing SDK key")]
	InvalidSdkKey,

	/// Base URL is missing or not an http(s) URL.
	#[error("invalid or missing base URL: {0}")]
	InvalidBaseUrl(String),

	/// A configuration value was rejected.
	#[error("invalid configuration: {0}")]
	Validation(String),

	/// The request never produced a response.
	#[error("network error: {0}")]
	Network(#[from] TransportError),

	/// Server returned an error response.
	#[error("server error ({status}): {message}")]
	ServerError { status: u16, message: String },

	/// Rate limited by the server.
	#[error("rate limited, retry after {retry_after_secs:?} seconds")]
	RateLimited { retry_after_secs: Option<u64> },

	/// The server rejected the SDK key.
	#[error("SDK key authentication failed ({status})")]
	AuthenticationFailed { status: u16 },

	/// A payload could not be encoded or decoded.
	#[error("serialization error: {0}")]
	Serialization(String),

	/// The circuit breaker rejected the call without sending it.
	#[error("circuit '{key}' is open, retry after {retry_after:?}")]
	CircuitOpen { key: String, retry_after: Duration },

	/// Persistent storage failed.
	#[error("storage error: {0}")]
	Storage(String),

	/// Client has been shut down.
	#[error("client has been shut down")]
	ClientShutdown,
}

/// Coarse error classes reported to the error hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	Network,
	Server,
	Authentication,
	Serialization,
	CircuitOpen,
	Storage,
	Validation,
	Shutdown,
}

impl FlagsyncError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			FlagsyncError::Network(_) => ErrorKind::Network,
			FlagsyncError::ServerError { .. } | FlagsyncError::RateLimited { .. } => ErrorKind::Server,
			FlagsyncError::AuthenticationFailed { .. } => ErrorKind::Authentication,
			FlagsyncError::Serialization(_) => ErrorKind::Serialization,
			FlagsyncError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
			FlagsyncError::Storage(_) => ErrorKind::Storage,
			FlagsyncError::InvalidSdkKey
			| FlagsyncError::InvalidBaseUrl(_)
			| FlagsyncError::Validation(_) => ErrorKind::Validation,
			FlagsyncError::ClientShutdown => ErrorKind::Shutdown,
		}
	}

	/// Whether the failure says something about reachability of the service.
	pub fn is_connectivity_failure(&self) -> bool {
		matches!(self.kind(), ErrorKind::Network | ErrorKind::Server)
	}
}

fn is_retryable_status(status: u16) -> bool {
	matches!(status, 408 | 429) || status >= 500
}

impl RetryableError for FlagsyncError {
	fn is_retryable(&self) -> bool {
		match self {
			FlagsyncError::Network(e) => e.is_retryable(),
			FlagsyncError::ServerError { status, .. } => is_retryable_status(*status),
			FlagsyncError::RateLimited { .. } => true,
			_ => false,
		}
	}
}

impl CircuitFailure for FlagsyncError {
	fn is_service_failure(&self) -> bool {
		match self {
			FlagsyncError::Network(e) => e.is_service_failure(),
			FlagsyncError::ServerError { status, .. } => is_retryable_status(*status),
			FlagsyncError::RateLimited { .. } | FlagsyncError::Serialization(_) => true,
			_ => false,
		}
	}
}

impl From<CircuitError<FlagsyncError>> for FlagsyncError {
	fn from(err: CircuitError<FlagsyncError>) -> Self {
		match err {
			CircuitError::Open { key, retry_after } => FlagsyncError::CircuitOpen { key, retry_after },
			CircuitError::Inner(inner) => inner,
		}
	}
}

impl From<CoreError> for FlagsyncError {
	fn from(err: CoreError) -> Self {
		match err {
			CoreError::Serialization(msg) => FlagsyncError::Serialization(msg),
			other => FlagsyncError::Validation(other.to_string()),
		}
	}
}

impl From<RetryConfigError> for FlagsyncError {
	fn from(err: RetryConfigError) -> Self {
		FlagsyncError::Validation(err.to_string())
	}
}

impl From<serde_json::Error> for FlagsyncError {
	fn from(err: serde_json::Error) -> Self {
		FlagsyncError::Serialization(err.to_string())
	}
}

impl From<std::io::Error> for FlagsyncError {
	fn from(err: std::io::Error) -> Self {
		FlagsyncError::Storage(err.to_string())
	}
}
