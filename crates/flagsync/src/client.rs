// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The flagsync client handle and its builder.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flagsync_common_http::{
	CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, ReqwestTransport, RetryConfig,
	SharedTransport,
};
use flagsync_core::{
	ConfigChange, ConfigSnapshot, ConnectionState, EventPayload, ExposureMetadata, RotationPolicy,
	RotationReason, SessionEvent, SessionId, SessionRecord, UserContext,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{EnqueueOutcome, QueueStats};
use crate::config::{ClientConfig, PollingConfig, QueueConfig};
use crate::connection::ConnectionMonitor;
use crate::context::SdkContext;
use crate::error::{FlagsyncError, Result};
use crate::listeners::{ErrorHook, ListenerId};
use crate::metadata::{RuntimeMetadata, SharedMetadataProvider};
use crate::session::{SessionManager, SESSION_CHECK_INTERVAL};
use crate::storage::{
	load_json, store_json, FileStore, KeyValueStore, MemoryStore, SharedStore, ANONYMOUS_ID_KEY,
};
use crate::sync::{ConfigSyncManager, KeyChange, SyncProbe, CONFIG_BREAKER_KEY};
use crate::telemetry::{TelemetryPipeline, EVENTS_BREAKER_KEY, SUMMARIES_BREAKER_KEY};

/// Builder for constructing a [`FlagsyncClient`].
pub struct FlagsyncClientBuilder {
	sdk_key: Option<String>,
	base_url: Option<String>,
	config: ClientConfig,
	defaults: BTreeMap<String, Value>,
	user: Option<UserContext>,
	store: Option<SharedStore>,
	transport: Option<SharedTransport>,
	metadata: Vec<SharedMetadataProvider>,
	error_hook: Option<ErrorHook>,
}

impl FlagsyncClientBuilder {
	pub fn new() -> Self {
		Self {
			sdk_key: None,
			base_url: None,
			config: ClientConfig::default(),
			defaults: BTreeMap::new(),
			user: None,
			store: None,
			transport: None,
			metadata: Vec::new(),
			error_hook: None,
		}
	}

	/// Sets the SDK key sent as a bearer token.
	pub fn sdk_key(mut self, key: impl Into<String>) -> Self {
		self.sdk_key = Some(key.into());
		self
	}

	/// Sets the base URL of the flagsync server.
	///
	/// Example: `https://flags.example.com`
	pub fn base_url(mut self, url: impl Into<String>) -> Self {
		self.base_url = Some(url.into());
		self
	}

	/// Replaces the whole configuration.
	pub fn config(mut self, config: ClientConfig) -> Self {
		self.config = config;
		self
	}

	/// Values served until the first successful fetch, and for keys the
	/// server omits.
	pub fn defaults(mut self, defaults: BTreeMap<String, Value>) -> Self {
		self.defaults = defaults;
		self
	}

	pub fn default_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
		self.defaults.insert(key.into(), value.into());
		self
	}

	/// Sets the initial user. Without one, a persisted anonymous id is used.
	pub fn user(mut self, user: UserContext) -> Self {
		self.user = Some(user);
		self
	}

	/// Sets the persistent store. Defaults to a [`FileStore`] in the XDG data
	/// directory.
	pub fn store(mut self, store: SharedStore) -> Self {
		self.store = Some(store);
		self
	}

	/// Replaces the HTTP transport. When set, `base_url` is not required.
	pub fn transport(mut self, transport: SharedTransport) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Adds a metadata provider. Earlier providers win on conflicting keys.
	pub fn metadata(mut self, provider: SharedMetadataProvider) -> Self {
		self.metadata.push(provider);
		self
	}

	/// Receives errors the client handled internally, such as failed polls
	/// and flushes.
	pub fn error_hook<F>(mut self, hook: F) -> Self
	where
		F: Fn(&FlagsyncError) + Send + Sync + 'static,
	{
		self.error_hook = Some(Arc::new(hook));
		self
	}

	pub fn request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	pub fn init_timeout(mut self, timeout: Duration) -> Self {
		self.config.init_timeout = timeout;
		self
	}

	/// Whether `build()` waits for the first configuration fetch.
	pub fn wait_for_initial_fetch(mut self, wait: bool) -> Self {
		self.config.wait_for_initial_fetch = wait;
		self
	}

	pub fn retry_config(mut self, config: RetryConfig) -> Self {
		self.config.retry = config;
		self
	}

	pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
		self.config.circuit_breaker = config;
		self
	}

	pub fn polling(mut self, config: PollingConfig) -> Self {
		self.config.polling = config;
		self
	}

	pub fn events_queue(mut self, config: QueueConfig) -> Self {
		self.config.events = config;
		self
	}

	pub fn summaries_queue(mut self, config: QueueConfig) -> Self {
		self.config.summaries = config;
		self
	}

	pub fn session_policy(mut self, policy: RotationPolicy) -> Self {
		self.config.session = policy;
		self
	}

	/// Validates the settings, restores persisted state, starts the
	/// background loops and, unless disabled, waits for the first fetch.
	///
	/// Only an authentication failure on the first fetch fails the build;
	/// other fetch errors leave the client serving cached values or defaults.
	pub async fn build(self) -> Result<FlagsyncClient> {
		let sdk_key = self
			.sdk_key
			.filter(|key| is_valid_sdk_key(key))
			.ok_or(FlagsyncError::InvalidSdkKey)?;
		let base_url = self.base_url.as_deref().map(normalize_base_url).transpose()?;
		self.config.validate()?;
		let config = self.config;

		let transport: SharedTransport = match (self.transport, base_url.as_ref()) {
			(Some(transport), _) => transport,
			(None, Some(url)) => Arc::new(ReqwestTransport::from_base_url(url.clone())?),
			(None, None) => {
				return Err(FlagsyncError::InvalidBaseUrl("base URL is required".to_string()));
			}
		};

		let store: SharedStore = match self.store {
			Some(store) => store,
			None => match FileStore::from_xdg() {
				Ok(store) => Arc::new(store),
				Err(e) => {
					warn!(error = %e, "no data directory, keeping state in memory");
					Arc::new(MemoryStore::new())
				}
			},
		};

		let user = match self.user {
			Some(user) => user,
			None => UserContext::anonymous(load_or_create_anonymous_id(&*store).await),
		};

		let mut metadata = self.metadata;
		metadata.push(Arc::new(RuntimeMetadata));

		let breakers = CircuitBreakerRegistry::new(config.circuit_breaker.clone());

		let session = Arc::new(SessionManager::new(config.session.clone(), store.clone()));
		session.initialize().await;

		let context = Arc::new(SdkContext::new(sdk_key, user, session.clone(), metadata));
		let monitor = Arc::new(ConnectionMonitor::new(config.connection.clone()));

		let sync = Arc::new(
			ConfigSyncManager::new(
				&config,
				transport.clone(),
				context.clone(),
				monitor.clone(),
				breakers.get_or_create(CONFIG_BREAKER_KEY),
				store.clone(),
				self.defaults,
			)
			.with_error_hook(self.error_hook.clone()),
		);
		sync.restore().await;

		let telemetry = TelemetryPipeline::http(
			&config,
			transport,
			context.clone(),
			monitor.clone(),
			store,
			(
				breakers.get_or_create(EVENTS_BREAKER_KEY),
				breakers.get_or_create(SUMMARIES_BREAKER_KEY),
			),
			self.error_hook,
		);
		telemetry.restore().await;

		monitor.set_probe(Arc::new(SyncProbe(Arc::downgrade(&sync))));

		if config.wait_for_initial_fetch {
			match tokio::time::timeout(config.init_timeout, sync.poll()).await {
				Ok(Ok(_)) => {}
				Ok(Err(e @ FlagsyncError::AuthenticationFailed { .. })) => {
					sync.shutdown();
					return Err(e);
				}
				Ok(Err(e)) => warn!(error = %e, "initial configuration fetch failed"),
				Err(_) => warn!(
					timeout_ms = config.init_timeout.as_millis(),
					"initial configuration fetch timed out"
				),
			}
		} else {
			let sync = sync.clone();
			tokio::spawn(async move {
				if let Err(e) = sync.poll().await {
					debug!(error = %e, "initial configuration fetch failed");
				}
			});
		}

		monitor.start();
		sync.start();
		telemetry.start();
		session.start(SESSION_CHECK_INTERVAL);

		info!(
			base_url = base_url.as_deref().unwrap_or("<custom transport>"),
			keys = sync.snapshot().len(),
			"flagsync client initialized"
		);

		Ok(FlagsyncClient {
			inner: Arc::new(ClientInner {
				config,
				context,
				session,
				monitor,
				sync,
				telemetry,
				breakers,
				closed: AtomicBool::new(false),
			}),
		})
	}
}

impl Default for FlagsyncClientBuilder {
	fn default() -> Self {
		Self::new()
	}
}

fn is_valid_sdk_key(key: &str) -> bool {
	!key.is_empty() && !key.chars().any(char::is_whitespace)
}

/// Checks the scheme and host and strips trailing slashes.
fn normalize_base_url(url: &str) -> Result<String> {
	let trimmed = url.trim();
	let rest = trimmed
		.strip_prefix("https://")
		.or_else(|| trimmed.strip_prefix("http://"))
		.ok_or_else(|| FlagsyncError::InvalidBaseUrl(format!("{url}: scheme must be http or https")))?;
	if rest.trim_start_matches('/').is_empty() || rest.starts_with('/') {
		return Err(FlagsyncError::InvalidBaseUrl(format!("{url}: missing host")));
	}
	Ok(trimmed.trim_end_matches('/').to_string())
}

async fn load_or_create_anonymous_id(store: &dyn KeyValueStore) -> String {
	if let Some(id) = load_json::<String>(store, ANONYMOUS_ID_KEY).await {
		return id;
	}
	let id = Uuid::new_v4().to_string();
	store_json(store, ANONYMOUS_ID_KEY, &id).await;
	id
}

struct ClientInner {
	config: ClientConfig,
	context: Arc<SdkContext>,
	session: Arc<SessionManager>,
	monitor: Arc<ConnectionMonitor>,
	sync: Arc<ConfigSyncManager>,
	telemetry: TelemetryPipeline,
	breakers: CircuitBreakerRegistry,
	closed: AtomicBool,
}

/// Handle to a running client. Cheap to clone.
#[derive(Clone)]
pub struct FlagsyncClient {
	inner: Arc<ClientInner>,
}

impl FlagsyncClient {
	pub fn builder() -> FlagsyncClientBuilder {
		FlagsyncClientBuilder::new()
	}

	pub fn config(&self) -> &ClientConfig {
		&self.inner.config
	}

	/// Returns the served value for `key`, recording an exposure when the
	/// entry carries attribution.
	pub fn get(&self, key: &str) -> Option<Value> {
		self.record_activity();
		let raw = self.inner.sync.get(key)?;
		self.record_exposure(key, &raw);
		Some(crate::sync::flag_value(&raw).clone())
	}

	pub fn get_bool(&self, key: &str, default: bool) -> bool {
		self.expose(key);
		self.inner.sync.get_bool(key, default)
	}

	pub fn get_string(&self, key: &str, default: &str) -> String {
		self.expose(key);
		self.inner.sync.get_string(key, default)
	}

	pub fn get_json(&self, key: &str, default: Value) -> Value {
		self.expose(key);
		self.inner.sync.get_json(key, default)
	}

	/// Every served key with its raw entry.
	pub fn all(&self) -> BTreeMap<String, Value> {
		self.inner.sync.all()
	}

	pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
		self.inner.sync.snapshot()
	}

	fn expose(&self, key: &str) {
		self.record_activity();
		if let Some(raw) = self.inner.sync.get(key) {
			self.record_exposure(key, &raw);
		}
	}

	fn record_activity(&self) {
		if !self.is_closed() {
			self.inner.session.record_activity();
		}
	}

	fn record_exposure(&self, key: &str, raw: &Value) {
		let Some(metadata) = ExposureMetadata::from_value(raw) else {
			return;
		};
		let user_id = self.inner.context.user().user_id;
		match self.inner.telemetry.record_exposure(metadata, user_id) {
			Ok(EnqueueOutcome::Duplicate) => {}
			Ok(_) => debug!(key = key, "recorded exposure"),
			Err(e) => debug!(key = key, error = %e, "exposure not recorded"),
		}
	}

	/// Fetches configuration now, ignoring the validator token.
	pub async fn force_refresh(&self) -> Result<bool> {
		self.check_closed()?;
		self.inner.sync.force_refresh().await
	}

	pub fn on_change<F>(&self, key: &str, callback: F) -> ListenerId
	where
		F: Fn(&KeyChange) + Send + Sync + 'static,
	{
		self.inner.sync.on_change(key, callback)
	}

	pub fn on_any_change<F>(&self, callback: F) -> ListenerId
	where
		F: Fn(&ConfigChange) + Send + Sync + 'static,
	{
		self.inner.sync.on_any_change(callback)
	}

	pub fn on_connection_change<F>(&self, callback: F) -> ListenerId
	where
		F: Fn(&ConnectionState) + Send + Sync + 'static,
	{
		self.inner.monitor.add_listener(callback)
	}

	pub fn on_session_event<F>(&self, callback: F) -> ListenerId
	where
		F: Fn(&SessionEvent) + Send + Sync + 'static,
	{
		self.inner.session.add_listener(callback)
	}

	/// Unregisters a listener of any kind.
	pub fn remove_listener(&self, id: ListenerId) -> bool {
		self.inner.sync.remove_listener(id)
			|| self.inner.monitor.remove_listener(id)
			|| self.inner.session.remove_listener(id)
	}

	/// Queues an analytics event.
	pub fn track(&self, event_type: impl Into<String>, properties: Map<String, Value>) -> Result<()> {
		self.track_event(EventPayload::new(event_type).with_properties(properties))?;
		Ok(())
	}

	pub fn track_event(&self, event: EventPayload) -> Result<EnqueueOutcome> {
		self.check_closed()?;
		self.record_activity();
		self.inner.telemetry.track(event)
	}

	/// Sends all queued events and summaries.
	pub async fn flush(&self) -> Result<()> {
		self.check_closed()?;
		self.inner.telemetry.flush().await
	}

	pub fn event_stats(&self) -> QueueStats {
		self.inner.telemetry.events().stats()
	}

	pub fn summary_stats(&self) -> QueueStats {
		self.inner.telemetry.summaries().stats()
	}

	pub fn circuit_breakers(&self) -> Vec<CircuitSnapshot> {
		self
			.inner
			.breakers
			.keys()
			.iter()
			.filter_map(|key| self.inner.breakers.get(key))
			.map(|breaker| breaker.snapshot())
			.collect()
	}

	pub fn session(&self) -> Option<Arc<SessionRecord>> {
		self.inner.session.current()
	}

	pub fn session_id(&self) -> Option<SessionId> {
		self.inner.session.session_id()
	}

	pub async fn rotate_session(&self) -> Result<Option<SessionEvent>> {
		self.check_closed()?;
		Ok(self.inner.session.rotate(RotationReason::Manual).await)
	}

	pub async fn update_activity(&self) {
		self.inner.session.update_activity().await;
	}

	/// Checks the time-based rotation trigger.
	pub async fn check_session(&self) -> Option<SessionEvent> {
		self.inner.session.check_rotation().await
	}

	/// The host app moved to the background.
	pub async fn on_background(&self) {
		self.inner.session.on_background().await;
		self.inner.sync.set_backgrounded(true);
		if let Err(e) = self.inner.telemetry.flush().await {
			debug!(error = %e, "flush on background failed");
		}
	}

	/// The host app returned to the foreground.
	pub async fn on_foreground(&self) -> Option<SessionEvent> {
		self.inner.sync.set_backgrounded(false);
		self.inner.session.on_foreground().await
	}

	pub async fn on_network_change(&self) -> Option<SessionEvent> {
		self.inner.session.on_network_change().await
	}

	/// Sets or clears the authenticated user id.
	pub async fn identify(&self, user_id: Option<String>) -> Option<SessionEvent> {
		self.inner.context.set_user_id(user_id.clone());
		self.inner.session.on_authentication_change(user_id).await
	}

	pub fn set_user_attribute(&self, key: impl Into<String>, value: impl Into<Value>) {
		self.inner.context.set_attribute(key, value);
	}

	pub fn user(&self) -> UserContext {
		self.inner.context.user()
	}

	pub fn set_offline_mode(&self, offline: bool) {
		self.inner.monitor.set_offline_mode(offline);
	}

	pub fn connection_state(&self) -> ConnectionState {
		self.inner.monitor.state()
	}

	/// Switches configuration polling to the reduced interval.
	pub fn set_reduced_polling(&self, reduced: bool) {
		self.inner.sync.set_reduced_polling(reduced);
	}

	/// Flushes telemetry one last time and stops every background task.
	pub async fn shutdown(&self) -> Result<()> {
		if self.inner.closed.swap(true, Ordering::SeqCst) {
			return Ok(());
		}

		self.inner.telemetry.shutdown().await;
		self.inner.sync.shutdown();
		self.inner.monitor.stop();
		self.inner.session.shutdown().await;

		info!("flagsync client shutdown");
		Ok(())
	}

	pub fn is_closed(&self) -> bool {
		self.inner.closed.load(Ordering::SeqCst)
	}

	fn check_closed(&self) -> Result<()> {
		if self.is_closed() {
			return Err(FlagsyncError::ClientShutdown);
		}
		Ok(())
	}
}
