// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Session types for client session identity.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
	#[must_use]
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}

	#[must_use]
	pub fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for SessionId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for SessionId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for SessionId {
	type Err = CoreError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| CoreError::InvalidSessionId(s.to_string()))
	}
}

/// The current session. Records are never mutated; activity updates and
/// rotations produce new values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
	pub session_id: SessionId,
	pub created_at: DateTime<Utc>,
	pub last_active_at: DateTime<Utc>,
	pub app_start_time: DateTime<Utc>,
}

impl SessionRecord {
	#[must_use]
	pub fn new(app_start_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
		Self {
			session_id: SessionId::new(),
			created_at: now,
			last_active_at: now,
			app_start_time,
		}
	}

	/// A copy of this record with `last_active_at` moved to `now`.
	#[must_use]
	pub fn touched(&self, now: DateTime<Utc>) -> Self {
		Self {
			last_active_at: now.max(self.last_active_at),
			..self.clone()
		}
	}

	/// Time since the session was created.
	pub fn age(&self, now: DateTime<Utc>) -> Duration {
		(now - self.created_at).to_std().unwrap_or_default()
	}

	/// Time since the last recorded activity.
	pub fn idle(&self, now: DateTime<Utc>) -> Duration {
		(now - self.last_active_at).to_std().unwrap_or_default()
	}
}

/// Controls when the session manager replaces the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
	/// Sessions older than this rotate (when time based rotation is enabled).
	pub max_session_duration: Duration,
	/// Automatic rotations are suppressed before a session reaches this age.
	pub min_session_duration: Duration,
	/// Rotate on foreground if the app stayed in the background this long.
	pub background_threshold: Duration,
	pub rotate_on_app_restart: bool,
	pub rotate_on_auth_change: bool,
	pub enable_time_based_rotation: bool,
}

impl Default for RotationPolicy {
	fn default() -> Self {
		Self {
			max_session_duration: Duration::from_secs(30 * 60),
			min_session_duration: Duration::from_secs(30),
			background_threshold: Duration::from_secs(5 * 60),
			rotate_on_app_restart: false,
			rotate_on_auth_change: true,
			enable_time_based_rotation: true,
		}
	}
}

impl RotationPolicy {
	pub fn validate(&self) -> Result<(), CoreError> {
		if self.max_session_duration.is_zero() {
			return Err(CoreError::Validation(
				"max_session_duration must be positive".to_string(),
			));
		}
		if self.background_threshold.is_zero() {
			return Err(CoreError::Validation(
				"background_threshold must be positive".to_string(),
			));
		}
		if self.min_session_duration > self.max_session_duration {
			return Err(CoreError::Validation(format!(
				"min_session_duration ({:?}) exceeds max_session_duration ({:?})",
				self.min_session_duration, self.max_session_duration
			)));
		}
		Ok(())
	}

	/// Whether a persisted record may be resumed at `now`.
	pub fn is_resumable(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
		record.age(now) < self.max_session_duration && record.idle(now) < self.background_threshold
	}
}

/// Why a session was rotated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationReason {
	Manual,
	TimeExceeded,
	BackgroundTimeout,
	AuthChange,
	AppRestart,
	NetworkChange,
}

impl RotationReason {
	/// Manual and authentication triggers ignore the minimum session duration.
	pub fn bypasses_min_duration(&self) -> bool {
		matches!(self, RotationReason::Manual | RotationReason::AuthChange)
	}
}

impl std::fmt::Display for RotationReason {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			RotationReason::Manual => write!(f, "manual"),
			RotationReason::TimeExceeded => write!(f, "time-exceeded"),
			RotationReason::BackgroundTimeout => write!(f, "background-timeout"),
			RotationReason::AuthChange => write!(f, "auth-change"),
			RotationReason::AppRestart => write!(f, "app-restart"),
			RotationReason::NetworkChange => write!(f, "network-change"),
		}
	}
}

impl std::str::FromStr for RotationReason {
	type Err = CoreError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"manual" => Ok(RotationReason::Manual),
			"time-exceeded" => Ok(RotationReason::TimeExceeded),
			"background-timeout" => Ok(RotationReason::BackgroundTimeout),
			"auth-change" => Ok(RotationReason::AuthChange),
			"app-restart" => Ok(RotationReason::AppRestart),
			"network-change" => Ok(RotationReason::NetworkChange),
			_ => Err(CoreError::InvalidRotationReason(s.to_string())),
		}
	}
}

/// Notification delivered to session listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
	/// The first session of this installation, or one replacing nothing.
	Started {
		session: SessionId,
	},
	Rotated {
		old: Option<SessionId>,
		new: SessionId,
		reason: RotationReason,
	},
	Restored {
		session: SessionId,
	},
}

impl SessionEvent {
	/// The session that is current after this event.
	pub fn current(&self) -> &SessionId {
		match self {
			SessionEvent::Rotated { new, .. } => new,
			SessionEvent::Started { session } | SessionEvent::Restored { session } => session,
		}
	}
}
