// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Queued telemetry records and their wire representation.
//!
//! Two record kinds flow through the telemetry pipeline:
//!
//! | Kind | Payload | Batch body |
//! |------|---------|------------|
//! | event | [`EventPayload`] | `{user, events: [...], sdk_version}` |
//! | summary | [`SummaryPayload`] | `{user, summaries: [...], sdk_version}` |
//!
//! Records are immutable once queued. The insertion id is a UUID v7 so ids
//! sort by creation time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::session::SessionId;
use crate::user::UserContext;

/// Behaviour shared by every record payload.
pub trait RecordPayload: Clone + Send + Sync + Serialize + for<'de> Deserialize<'de> + 'static {
	/// Key used to suppress duplicates at enqueue time, if any.
	fn dedup_key(&self) -> Option<String> {
		None
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRecord<P> {
	pub insert_id: Uuid,
	pub created_at: DateTime<Utc>,
	pub session_id: Option<SessionId>,
	pub payload: P,
}

impl<P: RecordPayload> QueuedRecord<P> {
	pub fn new(payload: P, session_id: Option<SessionId>) -> Self {
		Self {
			insert_id: Uuid::now_v7(),
			created_at: Utc::now(),
			session_id,
			payload,
		}
	}

	pub fn dedup_key(&self) -> Option<String> {
		self.payload.dedup_key()
	}
}

/// A custom event captured by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
	pub event_customer_id: Option<String>,
	pub event_type: String,
	#[serde(default)]
	pub properties: Map<String, Value>,
}

impl EventPayload {
	pub fn new(event_type: impl Into<String>) -> Self {
		Self {
			event_customer_id: None,
			event_type: event_type.into(),
			properties: Map::new(),
		}
	}

	pub fn with_customer_id(mut self, id: impl Into<String>) -> Self {
		self.event_customer_id = Some(id.into());
		self
	}

	pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
		self.properties = properties;
		self
	}
}

impl RecordPayload for EventPayload {}

/// Experience attribution carried by a configuration value.
///
/// A snapshot value that is a JSON object with these fields identifies
/// which experience and behaviour the server assigned for that key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureMetadata {
	pub config_id: String,
	#[serde(default)]
	pub version: Option<String>,
	#[serde(default)]
	pub variation_id: Option<String>,
	pub behaviour_id: String,
	pub experience_id: String,
	#[serde(default)]
	pub rule_id: Option<String>,
}

impl ExposureMetadata {
	/// Extracts attribution from a configuration value, if it carries any.
	pub fn from_value(value: &Value) -> Option<Self> {
		let object = value.as_object()?;
		let text = |key: &str| -> Option<String> {
			match object.get(key)? {
				Value::String(s) => Some(s.clone()),
				Value::Number(n) => Some(n.to_string()),
				_ => None,
			}
		};

		Some(Self {
			config_id: text("config_id")?,
			version: text("version"),
			variation_id: text("variation_id"),
			behaviour_id: text("behaviour_id")?,
			experience_id: text("experience_id")?,
			rule_id: text("rule_id"),
		})
	}
}

/// An exposure summary: the user was served a configuration value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryPayload {
	pub config_id: String,
	pub version: Option<String>,
	pub user_id: Option<String>,
	pub requested_time: DateTime<Utc>,
	pub variation_id: Option<String>,
	pub behaviour_id: String,
	pub experience_id: String,
	pub rule_id: Option<String>,
}

impl SummaryPayload {
	pub fn from_exposure(metadata: ExposureMetadata, user_id: Option<String>) -> Self {
		Self {
			config_id: metadata.config_id,
			version: metadata.version,
			user_id,
			requested_time: Utc::now(),
			variation_id: metadata.variation_id,
			behaviour_id: metadata.behaviour_id,
			experience_id: metadata.experience_id,
			rule_id: metadata.rule_id,
		}
	}
}

impl RecordPayload for SummaryPayload {
	fn dedup_key(&self) -> Option<String> {
		Some(format!("{}:{}", self.experience_id, self.behaviour_id))
	}
}

/// One element of the `events` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventWire {
	pub event_customer_id: Option<String>,
	pub event_type: String,
	pub properties: Map<String, Value>,
	/// Milliseconds since the Unix epoch.
	pub event_timestamp: i64,
	pub session_id: Option<String>,
	pub insert_id: String,
}

impl From<&QueuedRecord<EventPayload>> for EventWire {
	fn from(record: &QueuedRecord<EventPayload>) -> Self {
		Self {
			event_customer_id: record.payload.event_customer_id.clone(),
			event_type: record.payload.event_type.clone(),
			properties: record.payload.properties.clone(),
			event_timestamp: record.created_at.timestamp_millis(),
			session_id: record.session_id.as_ref().map(ToString::to_string),
			insert_id: record.insert_id.to_string(),
		}
	}
}

/// One element of the `summaries` array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryWire {
	pub config_id: String,
	pub version: Option<String>,
	pub user_id: Option<String>,
	/// Milliseconds since the Unix epoch.
	pub requested_time: i64,
	pub variation_id: Option<String>,
	pub session_id: Option<String>,
	pub behaviour_id: String,
	pub experience_id: String,
	pub rule_id: Option<String>,
}

impl From<&QueuedRecord<SummaryPayload>> for SummaryWire {
	fn from(record: &QueuedRecord<SummaryPayload>) -> Self {
		let p = &record.payload;
		Self {
			config_id: p.config_id.clone(),
			version: p.version.clone(),
			user_id: p.user_id.clone(),
			requested_time: p.requested_time.timestamp_millis(),
			variation_id: p.variation_id.clone(),
			session_id: record.session_id.as_ref().map(ToString::to_string),
			behaviour_id: p.behaviour_id.clone(),
			experience_id: p.experience_id.clone(),
			rule_id: p.rule_id.clone(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsBatch {
	pub user: UserContext,
	pub events: Vec<EventWire>,
	pub sdk_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummariesBatch {
	pub user: UserContext,
	pub summaries: Vec<SummaryWire>,
	pub sdk_version: String,
}
