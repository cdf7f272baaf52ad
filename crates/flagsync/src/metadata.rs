// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Device and application metadata attached to the user context.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use flagsync_common_http::{SDK_NAME, SDK_VERSION};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::Result;

/// A best-effort source of user attributes.
pub trait MetadataProvider: Send + Sync {
	fn name(&self) -> &str;

	fn collect(&self) -> Result<Map<String, Value>>;
}

pub type SharedMetadataProvider = Arc<dyn MetadataProvider>;

/// Operating system, architecture and SDK identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeMetadata;

impl MetadataProvider for RuntimeMetadata {
	fn name(&self) -> &str {
		"runtime"
	}

	fn collect(&self) -> Result<Map<String, Value>> {
		let mut map = Map::new();
		map.insert("os".into(), std::env::consts::OS.into());
		map.insert("os_family".into(), std::env::consts::FAMILY.into());
		map.insert("arch".into(), std::env::consts::ARCH.into());
		map.insert("sdk_name".into(), SDK_NAME.into());
		map.insert("sdk_version".into(), SDK_VERSION.into());
		Ok(map)
	}
}

/// Fixed attributes supplied by the application.
#[derive(Debug, Clone)]
pub struct StaticMetadata {
	name: String,
	attributes: Map<String, Value>,
}

impl StaticMetadata {
	pub fn new(name: impl Into<String>, attributes: Map<String, Value>) -> Self {
		Self {
			name: name.into(),
			attributes,
		}
	}
}

impl MetadataProvider for StaticMetadata {
	fn name(&self) -> &str {
		&self.name
	}

	fn collect(&self) -> Result<Map<String, Value>> {
		Ok(self.attributes.clone())
	}
}

/// Merges every provider's attributes. Earlier providers win on conflicts;
/// providers that fail or panic are skipped.
pub fn collect_all(providers: &[SharedMetadataProvider]) -> Map<String, Value> {
	let mut merged = Map::new();

	for provider in providers {
		match catch_unwind(AssertUnwindSafe(|| provider.collect())) {
			Ok(Ok(attributes)) => {
				for (key, value) in attributes {
					merged.entry(key).or_insert(value);
				}
			}
			Ok(Err(e)) => {
				warn!(provider = provider.name(), error = %e, "metadata provider failed");
			}
			Err(_) => {
				warn!(provider = provider.name(), "metadata provider panicked");
			}
		}
	}

	merged
}
