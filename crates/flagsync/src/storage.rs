// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Persistent key-value storage.
//!
//! The client persists the last good configuration snapshot, the current
//! session record, unsent telemetry and the anonymous id through
//! [`KeyValueStore`]. Storage is best effort: callers log failures and carry
//! on with in-memory state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{FlagsyncError, Result};

pub const SNAPSHOT_KEY: &str = "flagsync.config.snapshot";
pub const SESSION_KEY: &str = "flagsync.session";
pub const EVENTS_KEY: &str = "flagsync.queue.events";
pub const SUMMARIES_KEY: &str = "flagsync.queue.summaries";
pub const ANONYMOUS_ID_KEY: &str = "flagsync.anonymous_id";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<String>>;

	/// Stores `value`, optionally expiring after `ttl`.
	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

	async fn remove(&self, key: &str) -> Result<()>;
}

pub type SharedStore = Arc<dyn KeyValueStore>;

/// In-process store. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[async_trait]
impl KeyValueStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		let mut entries = self.entries.lock();
		match entries.get(key) {
			Some((_, Some(expires))) if *expires <= Instant::now() => {
				entries.remove(key);
				Ok(None)
			}
			Some((value, _)) => Ok(Some(value.clone())),
			None => Ok(None),
		}
	}

	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
		let expires = ttl.map(|ttl| Instant::now() + ttl);
		self
			.entries
			.lock()
			.insert(key.to_string(), (value.to_string(), expires));
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<()> {
		self.entries.lock().remove(key);
		Ok(())
	}
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
	value: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	expires_at: Option<DateTime<Utc>>,
}

/// One JSON file per key under a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
	dir: PathBuf,
}

impl FileStore {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self { dir: dir.into() }
	}

	/// A store under the XDG data directory (`$XDG_DATA_HOME/flagsync`).
	///
	/// The directory is created by the first write.
	pub fn from_xdg() -> Result<Self> {
		let data_dir = dirs::data_dir().ok_or_else(|| {
			FlagsyncError::Storage("could not determine XDG data directory".to_string())
		})?;
		let dir = data_dir.join("flagsync");

		info!(dir = %dir.display(), "initialized file store");

		Ok(Self::new(dir))
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	fn path_for(&self, key: &str) -> PathBuf {
		let name: String = key
			.chars()
			.map(|c| {
				if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
					c
				} else {
					'_'
				}
			})
			.collect();
		self.dir.join(format!("{name}.json"))
	}
}

#[async_trait]
impl KeyValueStore for FileStore {
	async fn get(&self, key: &str) -> Result<Option<String>> {
		let path = self.path_for(key);
		let contents = match tokio::fs::read_to_string(&path).await {
			Ok(contents) => contents,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};

		let envelope: Envelope = serde_json::from_str(&contents)?;
		if let Some(expires_at) = envelope.expires_at {
			if expires_at <= Utc::now() {
				debug!(key = key, "stored value expired");
				let _ = tokio::fs::remove_file(&path).await;
				return Ok(None);
			}
		}

		Ok(Some(envelope.value))
	}

	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
		tokio::fs::create_dir_all(&self.dir).await?;

		let expires_at = ttl
			.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
			.map(|ttl| Utc::now() + ttl);
		let envelope = Envelope {
			value: value.to_string(),
			expires_at,
		};

		let path = self.path_for(key);
		// One temp file per write.
		let tmp_path = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
		let json = serde_json::to_string(&envelope)?;

		tokio::fs::write(&tmp_path, &json).await?;
		tokio::fs::rename(&tmp_path, &path).await?;

		debug!(key = key, path = %path.display(), "stored value");
		Ok(())
	}

	async fn remove(&self, key: &str) -> Result<()> {
		match tokio::fs::remove_file(self.path_for(key)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e.into()),
		}
	}
}

/// Loads and decodes a JSON value. Failures are logged and read as absent.
pub(crate) async fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
	let raw = match store.get(key).await {
		Ok(Some(raw)) => raw,
		Ok(None) => return None,
		Err(e) => {
			warn!(key = key, error = %e, "failed to read from storage");
			return None;
		}
	};

	match serde_json::from_str(&raw) {
		Ok(value) => Some(value),
		Err(e) => {
			warn!(key = key, error = %e, "discarding undecodable stored value");
			None
		}
	}
}

/// Encodes and stores a JSON value. Failures are logged.
pub(crate) async fn store_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) {
	let raw = match serde_json::to_string(value) {
		Ok(raw) => raw,
		Err(e) => {
			warn!(key = key, error = %e, "failed to encode value for storage");
			return;
		}
	};

	if let Err(e) = store.set(key, &raw, None).await {
		warn!(key = key, error = %e, "failed to write to storage");
	}
}

pub(crate) async fn remove_key(store: &dyn KeyValueStore, key: &str) {
	if let Err(e) = store.remove(key).await {
		warn!(key = key, error = %e, "failed to remove from storage");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::TempDir;

	#[tokio::test]
	async fn test_memory_store_roundtrip() {
		let store = MemoryStore::new();
		assert_eq!(store.get("k").await.unwrap(), None);

		store.set("k", "v", None).await.unwrap();
		assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

		store.remove("k").await.unwrap();
		assert!(store.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_memory_store_ttl() {
		let store = MemoryStore::new();
		store
			.set("k", "v", Some(Duration::from_secs(10)))
			.await
			.unwrap();

		tokio::time::advance(Duration::from_secs(9)).await;
		assert!(store.get("k").await.unwrap().is_some());

		tokio::time::advance(Duration::from_secs(2)).await;
		assert!(store.get("k").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_file_store_roundtrip() {
		let dir = TempDir::new().unwrap();
		let store = FileStore::new(dir.path().join("nested"));

		store.set(SESSION_KEY, "{\"a\":1}", None).await.unwrap();
		assert_eq!(
			store.get(SESSION_KEY).await.unwrap().as_deref(),
			Some("{\"a\":1}")
		);

		// A second store over the same directory sees the value.
		let reopened = FileStore::new(dir.path().join("nested"));
		assert!(reopened.get(SESSION_KEY).await.unwrap().is_some());

		store.remove(SESSION_KEY).await.unwrap();
		store.remove(SESSION_KEY).await.unwrap();
		assert!(store.get(SESSION_KEY).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_file_store_leaves_no_temp_files() {
		let dir = TempDir::new().unwrap();
		let store = FileStore::new(dir.path());
		store.set("a/b c", "v", None).await.unwrap();

		let names: Vec<String> = std::fs::read_dir(dir.path())
			.unwrap()
			.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
			.collect();
		assert_eq!(names, vec!["a_b_c.json".to_string()]);
	}

	#[tokio::test]
	async fn test_file_store_directory_is_created_by_first_write() {
		let dir = TempDir::new().unwrap();
		let root = dir.path().join("flagsync");
		let store = FileStore::new(&root);
		assert!(!root.exists());
		assert!(store.get("k").await.unwrap().is_none());

		store.set("k", "v", None).await.unwrap();
		assert!(root.is_dir());
	}

	#[tokio::test]
	async fn test_file_store_concurrent_writes_to_one_key() {
		let dir = TempDir::new().unwrap();
		let store = Arc::new(FileStore::new(dir.path()));

		let writes: Vec<_> = (0..16)
			.map(|i| {
				let store = store.clone();
				tokio::spawn(async move {
					let value = format!("{{\"writer\":{i},\"pad\":\"{}\"}}", "x".repeat(4096));
					store.set(SESSION_KEY, &value, None).await
				})
			})
			.collect();
		for write in writes {
			write.await.unwrap().unwrap();
		}

		let stored = store.get(SESSION_KEY).await.unwrap().unwrap();
		let decoded: serde_json::Value = serde_json::from_str(&stored).unwrap();
		assert!(decoded["writer"].is_u64());

		let names: Vec<String> = std::fs::read_dir(dir.path())
			.unwrap()
			.map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
			.collect();
		assert_eq!(names, vec![format!("{SESSION_KEY}.json")]);
	}

	#[tokio::test]
	async fn test_file_store_expired_value_reads_as_absent() {
		let dir = TempDir::new().unwrap();
		let store = FileStore::new(dir.path());
		store.set("k", "v", Some(Duration::ZERO)).await.unwrap();
		assert!(store.get("k").await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_json_helpers_tolerate_garbage() {
		let store = MemoryStore::new();
		store.set("k", "{not json", None).await.unwrap();
		assert_eq!(load_json::<Vec<u32>>(&store, "k").await, None);

		store_json(&store, "k", &vec![1u32, 2]).await;
		assert_eq!(load_json::<Vec<u32>>(&store, "k").await, Some(vec![1, 2]));
	}
}
