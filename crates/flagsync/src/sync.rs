// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sync.
//!
//! The manager polls the config endpoint with a conditional GET, replaces
//! the whole snapshot when the server returns a new one, and fans the
//! changed keys out to listeners: per-key listeners first, then global
//! listeners, each in registration order.
//!
//! Fetches run through the retry executor inside the `config.poll` circuit
//! breaker. When a fetch fails the last good snapshot stays in effect.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use flagsync_common_http::{retry, CircuitBreaker, HttpRequest, RetryConfig, SharedTransport};
use flagsync_core::{ConfigChange, ConfigSnapshot, ValidatorToken};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, PollingConfig};
use crate::connection::{ConnectionMonitor, ConnectivityProbe};
use crate::context::SdkContext;
use crate::error::{FlagsyncError, Result};
use crate::listeners::{report_error, ErrorHook, ListenerId, ListenerRegistry};
use crate::storage::{load_json, store_json, SharedStore, SNAPSHOT_KEY};

pub const CONFIG_BREAKER_KEY: &str = "config.poll";

/// A single key's change, delivered to per-key listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyChange {
	pub key: String,
	pub old: Option<Value>,
	pub new: Option<Value>,
}

enum FetchOutcome {
	NotModified,
	Updated(ConfigSnapshot),
}

/// The served value of a config entry. Entries that carry exposure
/// attribution wrap the value in a `value` field.
pub fn flag_value(value: &Value) -> &Value {
	match value {
		Value::Object(map) if map.contains_key("config_id") => map.get("value").unwrap_or(value),
		_ => value,
	}
}

pub struct ConfigSyncManager {
	transport: SharedTransport,
	context: Arc<SdkContext>,
	monitor: Arc<ConnectionMonitor>,
	breaker: Arc<CircuitBreaker>,
	store: SharedStore,
	retry: RetryConfig,
	polling: PollingConfig,
	path: String,
	request_timeout: Duration,
	defaults: BTreeMap<String, Value>,
	snapshot: RwLock<Arc<ConfigSnapshot>>,
	key_listeners: ListenerRegistry<KeyChange>,
	global_listeners: ListenerRegistry<ConfigChange>,
	error_hook: Option<ErrorHook>,
	reduced: AtomicBool,
	backgrounded: AtomicBool,
	poll_in_flight: AtomicBool,
	shutdown: AtomicBool,
	wake: Notify,
	persist_lock: tokio::sync::Mutex<()>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigSyncManager {
	pub fn new(
		config: &ClientConfig,
		transport: SharedTransport,
		context: Arc<SdkContext>,
		monitor: Arc<ConnectionMonitor>,
		breaker: Arc<CircuitBreaker>,
		store: SharedStore,
		defaults: BTreeMap<String, Value>,
	) -> Self {
		Self {
			transport,
			context,
			monitor,
			breaker,
			store,
			retry: config.retry.clone(),
			polling: config.polling.clone(),
			path: config.endpoints.config.clone(),
			request_timeout: config.request_timeout,
			snapshot: RwLock::new(Arc::new(ConfigSnapshot::from_defaults(defaults.clone()))),
			defaults,
			key_listeners: ListenerRegistry::new("config.key"),
			global_listeners: ListenerRegistry::new("config.all"),
			error_hook: None,
			reduced: AtomicBool::new(false),
			backgrounded: AtomicBool::new(false),
			poll_in_flight: AtomicBool::new(false),
			shutdown: AtomicBool::new(false),
			wake: Notify::new(),
			persist_lock: tokio::sync::Mutex::new(()),
			task: Mutex::new(None),
		}
	}

	pub fn with_error_hook(mut self, hook: Option<ErrorHook>) -> Self {
		self.error_hook = hook;
		self
	}

	/// Loads the last persisted snapshot, if any. Listeners are not notified.
	pub async fn restore(&self) -> bool {
		let Some(persisted) = load_json::<ConfigSnapshot>(&*self.store, SNAPSHOT_KEY).await else {
			return false;
		};
		let restored = persisted.restored().with_defaults(&self.defaults);
		info!(keys = restored.len(), "restored configuration snapshot");
		*self.snapshot.write() = Arc::new(restored);
		true
	}

	/// Starts the polling loop.
	pub fn start(self: &Arc<Self>) {
		let handle = Arc::clone(self).spawn_poll_loop();
		if let Some(old) = self.task.lock().replace(handle) {
			old.abort();
		}
	}

	fn spawn_poll_loop(self: Arc<Self>) -> JoinHandle<()> {
		tokio::spawn(async move {
			info!(
				interval_secs = self.polling.interval.as_secs(),
				"starting configuration polling"
			);
			loop {
				let interval = self.current_interval();
				tokio::select! {
					_ = tokio::time::sleep(interval) => {}
					_ = self.wake.notified() => continue,
				}

				if self.is_shutdown() {
					break;
				}
				if !self.should_poll() {
					debug!("skipping configuration poll");
					continue;
				}
				if self.poll_in_flight.swap(true, Ordering::SeqCst) {
					continue;
				}

				let this = Arc::clone(&self);
				tokio::spawn(async move {
					if let Err(e) = this.poll().await {
						debug!(error = %e, "configuration poll failed");
					}
					this.poll_in_flight.store(false, Ordering::SeqCst);
				});
			}
		})
	}

	fn current_interval(&self) -> Duration {
		if self.reduced.load(Ordering::SeqCst) || self.backgrounded.load(Ordering::SeqCst) {
			self.polling.reduced_interval
		} else {
			self.polling.interval
		}
	}

	fn should_poll(&self) -> bool {
		if self.monitor.is_offline() {
			return false;
		}
		!(self.polling.disable_background_polling && self.backgrounded.load(Ordering::SeqCst))
	}

	/// Switches to the reduced polling interval.
	pub fn set_reduced_polling(&self, reduced: bool) {
		self.reduced.store(reduced, Ordering::SeqCst);
		self.wake.notify_one();
	}

	pub fn set_backgrounded(&self, backgrounded: bool) {
		self.backgrounded.store(backgrounded, Ordering::SeqCst);
		self.wake.notify_one();
	}

	pub fn is_shutdown(&self) -> bool {
		self.shutdown.load(Ordering::SeqCst)
	}

	/// Conditional fetch. Returns whether any key changed.
	pub async fn poll(&self) -> Result<bool> {
		self.fetch(true, true).await
	}

	/// Unconditional fetch that ignores the validator token.
	pub async fn force_refresh(&self) -> Result<bool> {
		self.fetch(false, true).await
	}

	async fn fetch(&self, conditional: bool, report: bool) -> Result<bool> {
		if self.is_shutdown() {
			return Err(FlagsyncError::ClientShutdown);
		}

		let result = self
			.breaker
			.execute(|| retry(&self.retry, || self.fetch_once(conditional)))
			.await
			.map_err(FlagsyncError::from);

		match result {
			Ok(outcome) => {
				if report {
					self.monitor.report_success();
				}
				Ok(self.apply(outcome).await)
			}
			Err(e) => {
				warn!(error = %e, "configuration fetch failed, keeping last good snapshot");
				if report && e.is_connectivity_failure() {
					self.monitor.report_failure(&e);
				}
				report_error(self.error_hook.as_ref(), &e);
				Err(e)
			}
		}
	}

	async fn fetch_once(&self, conditional: bool) -> Result<FetchOutcome> {
		let mut request = self.context.authorize(
			HttpRequest::get(&self.path)
				.header("Accept", "application/json")
				.timeout(self.request_timeout),
		);

		if conditional {
			let current = self.snapshot();
			let validator = current.validator();
			if let Some(etag) = &validator.etag {
				request = request.header("If-None-Match", etag.clone());
			}
			if let Some(last_modified) = &validator.last_modified {
				request = request.header("If-Modified-Since", last_modified.clone());
			}
		}

		let response = self.transport.request(request).await?;

		match response.status {
			304 => Ok(FetchOutcome::NotModified),
			_ if response.is_success() => {
				let validator = ValidatorToken::new(
					response.header("etag").map(str::to_string),
					response.header("last-modified").map(str::to_string),
				);
				let snapshot = ConfigSnapshot::from_json(&response.body, validator)?;
				Ok(FetchOutcome::Updated(snapshot))
			}
			401 | 403 => Err(FlagsyncError::AuthenticationFailed {
				status: response.status,
			}),
			429 => Err(FlagsyncError::RateLimited {
				retry_after_secs: response.header("retry-after").and_then(|v| v.parse().ok()),
			}),
			status => Err(FlagsyncError::ServerError {
				status,
				message: response.body_text(),
			}),
		}
	}

	async fn apply(&self, outcome: FetchOutcome) -> bool {
		let fresh = match outcome {
			FetchOutcome::NotModified => {
				debug!("configuration not modified");
				return false;
			}
			FetchOutcome::Updated(snapshot) => snapshot.with_defaults(&self.defaults),
		};

		if self.is_shutdown() {
			debug!("ignoring configuration fetched after shutdown");
			return false;
		}

		let (old, new) = {
			let mut current = self.snapshot.write();
			if current.is_newer_than(&fresh) {
				warn!(
					current = ?current.validator().last_modified,
					received = ?fresh.validator().last_modified,
					"discarding configuration older than the current snapshot"
				);
				return false;
			}
			let new = Arc::new(fresh);
			let old = std::mem::replace(&mut *current, Arc::clone(&new));
			(old, new)
		};

		let changed = match ConfigChange::between(old, new) {
			Some(change) => {
				info!(changed = change.changed_keys.len(), "configuration updated");
				self.dispatch(&change);
				true
			}
			None => {
				debug!("configuration unchanged");
				false
			}
		};

		self.persist_current().await;
		changed
	}

	/// Writes whichever snapshot is current once earlier writes finished.
	async fn persist_current(&self) {
		let _guard = self.persist_lock.lock().await;
		let current = self.snapshot();
		store_json(&*self.store, SNAPSHOT_KEY, &*current).await;
	}

	fn dispatch(&self, change: &ConfigChange) {
		for key in &change.changed_keys {
			self.key_listeners.notify(&KeyChange {
				key: key.clone(),
				old: change.old_value(key).cloned(),
				new: change.new_value(key).cloned(),
			});
		}
		self.global_listeners.notify(change);
	}

	pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
		Arc::clone(&self.snapshot.read())
	}

	pub fn get(&self, key: &str) -> Option<Value> {
		self.snapshot.read().get(key).cloned()
	}

	pub fn all(&self) -> BTreeMap<String, Value> {
		self.snapshot.read().values().clone()
	}

	pub fn get_bool(&self, key: &str, default: bool) -> bool {
		self.typed(key, default, Value::as_bool)
	}

	pub fn get_string(&self, key: &str, default: &str) -> String {
		self.typed(key, default.to_string(), |v| v.as_str().map(str::to_string))
	}

	pub fn get_json(&self, key: &str, default: Value) -> Value {
		match self.get(key) {
			Some(value) => flag_value(&value).clone(),
			None => default,
		}
	}

	fn typed<T>(&self, key: &str, default: T, extract: impl Fn(&Value) -> Option<T>) -> T {
		let Some(value) = self.get(key) else {
			return default;
		};
		match extract(flag_value(&value)) {
			Some(v) => v,
			None => {
				warn!(key = key, actual = ?value, "configuration value has unexpected type, using default");
				default
			}
		}
	}

	/// Calls `callback` when `key` changes.
	pub fn on_change<F>(&self, key: &str, callback: F) -> ListenerId
	where
		F: Fn(&KeyChange) + Send + Sync + 'static,
	{
		let key = key.to_string();
		self.key_listeners.add(move |change: &KeyChange| {
			if change.key == key {
				callback(change);
			}
		})
	}

	/// Calls `callback` with the old and new snapshots on every change.
	pub fn on_any_change<F>(&self, callback: F) -> ListenerId
	where
		F: Fn(&ConfigChange) + Send + Sync + 'static,
	{
		self.global_listeners.add(callback)
	}

	pub fn remove_listener(&self, id: ListenerId) -> bool {
		self.key_listeners.remove(id) || self.global_listeners.remove(id)
	}

	/// Stops polling. Fetches completing afterwards are discarded.
	pub fn shutdown(&self) {
		self.shutdown.store(true, Ordering::SeqCst);
		if let Some(task) = self.task.lock().take() {
			task.abort();
		}
		self.key_listeners.clear();
		self.global_listeners.clear();
		debug!("configuration sync stopped");
	}
}

/// Probes connectivity by fetching configuration.
pub(crate) struct SyncProbe(pub(crate) Weak<ConfigSyncManager>);

#[async_trait]
impl ConnectivityProbe for SyncProbe {
	async fn probe(&self) -> Result<()> {
		let manager = self.0.upgrade().ok_or(FlagsyncError::ClientShutdown)?;
		manager.fetch(true, false).await.map(|_| ())
	}
}
