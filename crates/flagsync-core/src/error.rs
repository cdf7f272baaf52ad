// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the core data model.

use thiserror::Error;

/// Errors raised while building or parsing core types.
#[derive(Debug, Error)]
pub enum CoreError {
	/// A configuration value was rejected.
	#[error("invalid configuration: {0}")]
	Validation(String),

	/// Invalid session ID
	#[error("invalid session ID: {0}")]
	InvalidSessionId(String),

	/// Unknown rotation reason string
	#[error("invalid rotation reason: {0}")]
	InvalidRotationReason(String),

	/// Unknown connection status string
	#[error("invalid connection status: {0}")]
	InvalidConnectionStatus(String),

	/// A payload could not be (de)serialized.
	#[error("serialization error: {0}")]
	Serialization(String),
}

impl From<serde_json::Error> for CoreError {
	fn from(err: serde_json::Error) -> Self {
		CoreError::Serialization(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, CoreError>;
