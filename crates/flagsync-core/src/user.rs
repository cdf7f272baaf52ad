// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The identity attached to configuration requests and telemetry batches.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	pub anonymous_id: String,
	#[serde(default)]
	pub attributes: Map<String, Value>,
}

impl UserContext {
	pub fn anonymous(anonymous_id: impl Into<String>) -> Self {
		Self {
			user_id: None,
			anonymous_id: anonymous_id.into(),
			attributes: Map::new(),
		}
	}

	pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.attributes.insert(key.into(), value.into());
		self
	}

	/// The identified user id, falling back to the anonymous id.
	pub fn distinct_id(&self) -> &str {
		self.user_id.as_deref().unwrap_or(&self.anonymous_id)
	}

	pub fn is_identified(&self) -> bool {
		self.user_id.is_some()
	}

	/// Adds `extra` attributes without overwriting keys the caller already set.
	pub fn merge_attributes(&mut self, extra: Map<String, Value>) {
		for (key, value) in extra {
			self.attributes.entry(key).or_insert(value);
		}
	}
}

impl Default for UserContext {
	fn default() -> Self {
		Self::anonymous(uuid::Uuid::new_v4().to_string())
	}
}
