// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration snapshots and change detection.
//!
//! A [`ConfigSnapshot`] is an immutable map from flag key to an opaque JSON
//! value together with the validator token the server returned for it. The
//! sync manager replaces the whole snapshot on every successful fetch and
//! hands `Arc` references to readers and listeners.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Opaque freshness token used for conditional fetches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorToken {
	/// Entity tag, sent back as `If-None-Match`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub etag: Option<String>,
	/// HTTP date, sent back as `If-Modified-Since`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_modified: Option<String>,
}

impl ValidatorToken {
	pub fn new(etag: Option<String>, last_modified: Option<String>) -> Self {
		Self {
			etag,
			last_modified,
		}
	}

	pub fn is_empty(&self) -> bool {
		self.etag.is_none() && self.last_modified.is_none()
	}

	/// Parses `last_modified` as an HTTP date.
	pub fn last_modified_at(&self) -> Option<DateTime<Utc>> {
		self
			.last_modified
			.as_deref()
			.and_then(|s| DateTime::parse_from_rfc2822(s).ok())
			.map(|dt| dt.with_timezone(&Utc))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
	values: BTreeMap<String, Value>,
	#[serde(default)]
	validator: ValidatorToken,
	fetched_at: DateTime<Utc>,
	/// False for snapshots built from defaults or restored from storage.
	#[serde(default)]
	from_server: bool,
}

impl ConfigSnapshot {
	pub fn new(values: BTreeMap<String, Value>, validator: ValidatorToken) -> Self {
		Self {
			values,
			validator,
			fetched_at: Utc::now(),
			from_server: true,
		}
	}

	pub fn empty() -> Self {
		Self::from_defaults(BTreeMap::new())
	}

	/// A snapshot holding builder-supplied defaults, served until the first fetch.
	pub fn from_defaults(values: BTreeMap<String, Value>) -> Self {
		Self {
			values,
			validator: ValidatorToken::default(),
			fetched_at: Utc::now(),
			from_server: false,
		}
	}

	/// Parses a server response body. The body must be a JSON object.
	pub fn from_json(body: &[u8], validator: ValidatorToken) -> Result<Self> {
		let value: Value = serde_json::from_slice(body)?;
		match value {
			Value::Object(map) => Ok(Self::new(map.into_iter().collect(), validator)),
			other => Err(CoreError::Serialization(format!(
				"configuration payload must be a JSON object, got {}",
				json_type_name(&other)
			))),
		}
	}

	/// Returns a copy of this snapshot marked as not coming from the server.
	pub fn restored(mut self) -> Self {
		self.from_server = false;
		self
	}

	/// Returns a new snapshot with `defaults` filled in for missing keys.
	pub fn with_defaults(&self, defaults: &BTreeMap<String, Value>) -> Self {
		let mut values = defaults.clone();
		values.extend(self.values.iter().map(|(k, v)| (k.clone(), v.clone())));
		Self {
			values,
			validator: self.validator.clone(),
			fetched_at: self.fetched_at,
			from_server: self.from_server,
		}
	}

	pub fn get(&self, key: &str) -> Option<&Value> {
		self.values.get(key)
	}

	pub fn contains_key(&self, key: &str) -> bool {
		self.values.contains_key(key)
	}

	pub fn values(&self) -> &BTreeMap<String, Value> {
		&self.values
	}

	pub fn keys(&self) -> impl Iterator<Item = &String> {
		self.values.keys()
	}

	pub fn len(&self) -> usize {
		self.values.len()
	}

	pub fn is_empty(&self) -> bool {
		self.values.is_empty()
	}

	pub fn validator(&self) -> &ValidatorToken {
		&self.validator
	}

	pub fn fetched_at(&self) -> DateTime<Utc> {
		self.fetched_at
	}

	pub fn is_from_server(&self) -> bool {
		self.from_server
	}

	/// Keys whose value differs between `self` and `other`, including keys
	/// present in only one of them. Values are compared structurally.
	pub fn changed_keys(&self, other: &ConfigSnapshot) -> BTreeSet<String> {
		self
			.values
			.keys()
			.chain(other.values.keys())
			.filter(|key| self.values.get(*key) != other.values.get(*key))
			.cloned()
			.collect()
	}

	/// True when `other` carries a server timestamp strictly older than ours.
	///
	/// Snapshots without a parseable `Last-Modified` are never considered stale.
	pub fn is_newer_than(&self, other: &ConfigSnapshot) -> bool {
		match (
			self.validator.last_modified_at(),
			other.validator.last_modified_at(),
		) {
			(Some(ours), Some(theirs)) => ours > theirs,
			_ => false,
		}
	}
}

impl Default for ConfigSnapshot {
	fn default() -> Self {
		Self::empty()
	}
}

/// A committed snapshot replacement, as delivered to listeners.
#[derive(Debug, Clone)]
pub struct ConfigChange {
	pub changed_keys: BTreeSet<String>,
	pub old: Arc<ConfigSnapshot>,
	pub new: Arc<ConfigSnapshot>,
}

impl ConfigChange {
	/// Builds a change from two snapshots, or `None` when nothing differs.
	pub fn between(old: Arc<ConfigSnapshot>, new: Arc<ConfigSnapshot>) -> Option<Self> {
		let changed_keys = old.changed_keys(&new);
		if changed_keys.is_empty() {
			return None;
		}
		Some(Self {
			changed_keys,
			old,
			new,
		})
	}

	pub fn old_value(&self, key: &str) -> Option<&Value> {
		self.old.get(key)
	}

	pub fn new_value(&self, key: &str) -> Option<&Value> {
		self.new.get(key)
	}
}

fn json_type_name(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
