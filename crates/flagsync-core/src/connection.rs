// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Connection status as observed by the connection monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
	#[default]
	Connecting,
	Connected,
	Disconnected,
	/// The platform reported no network. Probing is suspended.
	Offline,
}

impl ConnectionStatus {
	/// Whether network work (polling, flushing) should be attempted.
	pub fn allows_network(&self) -> bool {
		!matches!(self, ConnectionStatus::Offline)
	}
}

impl std::fmt::Display for ConnectionStatus {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ConnectionStatus::Connecting => write!(f, "connecting"),
			ConnectionStatus::Connected => write!(f, "connected"),
			ConnectionStatus::Disconnected => write!(f, "disconnected"),
			ConnectionStatus::Offline => write!(f, "offline"),
		}
	}
}

impl std::str::FromStr for ConnectionStatus {
	type Err = CoreError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"connecting" => Ok(ConnectionStatus::Connecting),
			"connected" => Ok(ConnectionStatus::Connected),
			"disconnected" => Ok(ConnectionStatus::Disconnected),
			"offline" => Ok(ConnectionStatus::Offline),
			_ => Err(CoreError::InvalidConnectionStatus(s.to_string())),
		}
	}
}

/// Point-in-time view of the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
	pub status: ConnectionStatus,
	/// Consecutive failed probes. Reset on success.
	pub failure_count: u32,
	pub last_error: Option<String>,
	pub last_success: Option<DateTime<Utc>>,
	pub next_reconnect_at: Option<DateTime<Utc>>,
}

impl ConnectionState {
	pub fn is_connected(&self) -> bool {
		self.status == ConnectionStatus::Connected
	}
}
