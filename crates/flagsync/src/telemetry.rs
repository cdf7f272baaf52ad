// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Telemetry pipeline: the event and summary queues.
//!
//! Each [`TelemetryQueue`] buffers records in a [`RecordQueue`], flushes them
//! on a timer or when a full batch accumulates, and persists whatever could
//! not be delivered. Enqueueing never touches the network.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flagsync_common_http::{
	retry, CircuitBreaker, HttpRequest, RetryConfig, SharedTransport, SDK_VERSION,
};
use flagsync_core::{
	EventPayload, EventWire, EventsBatch, ExposureMetadata, QueuedRecord, RecordPayload,
	SummariesBatch, SummaryPayload, SummaryWire, UserContext,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::batch::{EnqueueOutcome, QueueStats, RecordQueue};
use crate::config::{ClientConfig, QueueConfig};
use crate::connection::ConnectionMonitor;
use crate::context::SdkContext;
use crate::error::{FlagsyncError, Result};
use crate::listeners::{report_error, ErrorHook};
use crate::storage::{load_json, remove_key, store_json, SharedStore, EVENTS_KEY, SUMMARIES_KEY};

pub const EVENTS_BREAKER_KEY: &str = "telemetry.events";
pub const SUMMARIES_BREAKER_KEY: &str = "telemetry.summaries";

/// A record type with a batch wire format.
pub trait BatchPayload: RecordPayload {
	fn encode_batch(user: UserContext, records: &[QueuedRecord<Self>], sdk_version: &str) -> Result<Vec<u8>>;
}

impl BatchPayload for EventPayload {
	fn encode_batch(user: UserContext, records: &[QueuedRecord<Self>], sdk_version: &str) -> Result<Vec<u8>> {
		let batch = EventsBatch {
			user,
			events: records.iter().map(EventWire::from).collect(),
			sdk_version: sdk_version.to_string(),
		};
		Ok(serde_json::to_vec(&batch)?)
	}
}

impl BatchPayload for SummaryPayload {
	fn encode_batch(user: UserContext, records: &[QueuedRecord<Self>], sdk_version: &str) -> Result<Vec<u8>> {
		let batch = SummariesBatch {
			user,
			summaries: records.iter().map(SummaryWire::from).collect(),
			sdk_version: sdk_version.to_string(),
		};
		Ok(serde_json::to_vec(&batch)?)
	}
}

/// Delivers one batch.
#[async_trait]
pub trait BatchSender<P: RecordPayload>: Send + Sync {
	async fn send_batch(&self, records: &[QueuedRecord<P>]) -> Result<()>;
}

/// Posts batches to the server through the retry executor and a breaker.
pub struct HttpBatchSender<P> {
	transport: SharedTransport,
	context: Arc<SdkContext>,
	path: String,
	retry: RetryConfig,
	breaker: Arc<CircuitBreaker>,
	request_timeout: Duration,
	_payload: PhantomData<fn() -> P>,
}

impl<P: BatchPayload> HttpBatchSender<P> {
	pub fn new(
		transport: SharedTransport,
		context: Arc<SdkContext>,
		path: impl Into<String>,
		config: &ClientConfig,
		breaker: Arc<CircuitBreaker>,
	) -> Self {
		Self {
			transport,
			context,
			path: path.into(),
			retry: config.retry.clone(),
			breaker,
			request_timeout: config.request_timeout,
			_payload: PhantomData,
		}
	}

	async fn send_once(&self, body: &[u8]) -> Result<()> {
		let request = self.context.authorize(
			HttpRequest::post(&self.path)
				.json_body(body.to_vec())
				.timeout(self.request_timeout),
		);
		let response = self.transport.request(request).await?;

		match response.status {
			_ if response.is_success() => Ok(()),
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
}

#[async_trait]
impl<P: BatchPayload> BatchSender<P> for HttpBatchSender<P> {
	async fn send_batch(&self, records: &[QueuedRecord<P>]) -> Result<()> {
		let body = P::encode_batch(self.context.user_with_metadata(), records, SDK_VERSION)?;
		debug!(path = %self.path, count = records.len(), bytes = body.len(), "sending batch");
		self
			.breaker
			.execute(|| retry(&self.retry, || self.send_once(&body)))
			.await
			.map_err(FlagsyncError::from)
	}
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

pub struct TelemetryQueue<P: BatchPayload> {
	name: &'static str,
	storage_key: &'static str,
	queue: RecordQueue<P>,
	sender: Arc<dyn BatchSender<P>>,
	context: Arc<SdkContext>,
	monitor: Arc<ConnectionMonitor>,
	store: SharedStore,
	error_hook: Option<ErrorHook>,
	flush_lock: tokio::sync::Mutex<()>,
	flush_notify: Notify,
	rearm: Notify,
	shutdown: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl<P: BatchPayload> TelemetryQueue<P> {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		name: &'static str,
		storage_key: &'static str,
		config: QueueConfig,
		sender: Arc<dyn BatchSender<P>>,
		context: Arc<SdkContext>,
		monitor: Arc<ConnectionMonitor>,
		store: SharedStore,
		error_hook: Option<ErrorHook>,
	) -> Self {
		Self {
			name,
			storage_key,
			queue: RecordQueue::new(name, config),
			sender,
			context,
			monitor,
			store,
			error_hook,
			flush_lock: tokio::sync::Mutex::new(()),
			flush_notify: Notify::new(),
			rearm: Notify::new(),
			shutdown: AtomicBool::new(false),
			task: Mutex::new(None),
		}
	}

	/// Queues a payload stamped with the current session.
	pub fn enqueue(&self, payload: P) -> Result<EnqueueOutcome> {
		if self.shutdown.load(Ordering::SeqCst) {
			return Err(FlagsyncError::ClientShutdown);
		}

		let record = QueuedRecord::new(payload, self.context.session_id());
		let outcome = self.queue.push(record);
		match outcome {
			EnqueueOutcome::Duplicate => debug!(queue = self.name, "dropping duplicate record"),
			_ if outcome.wants_flush() => self.flush_notify.notify_one(),
			// The first waiting record starts the flush_time deadline.
			_ if self.queue.len() == 1 => self.rearm.notify_one(),
			_ => {}
		}
		Ok(outcome)
	}

	/// Sends everything queued. Returns how many records were delivered.
	///
	/// On failure the undelivered records go back to the front of the queue
	/// and are persisted.
	pub async fn flush(&self) -> Result<usize> {
		let _guard = self.flush_lock.lock().await;

		if self.monitor.is_offline() {
			debug!(queue = self.name, "offline, keeping records queued");
			return Ok(0);
		}

		let records = self.queue.drain();
		if records.is_empty() {
			return Ok(0);
		}

		let batch_size = self.queue.config().max_batch_size;
		let mut delivered = 0;
		for chunk in records.chunks(batch_size) {
			if let Err(e) = self.sender.send_batch(chunk).await {
				let unsent = records[delivered..].to_vec();
				warn!(
					queue = self.name,
					error = %e,
					unsent = unsent.len(),
					"flush failed, requeueing records"
				);
				self.queue.requeue_front(unsent);
				self.queue.mark_failed();
				self.persist().await;
				report_error(self.error_hook.as_ref(), &e);
				return Err(e);
			}
			delivered += chunk.len();
			self.queue.mark_sent(chunk.len());
		}

		self.queue.mark_flushed();
		self.persist().await;
		debug!(queue = self.name, delivered = delivered, "flush complete");
		Ok(delivered)
	}

	async fn persist(&self) {
		let records = self.queue.records();
		if records.is_empty() {
			remove_key(&*self.store, self.storage_key).await;
		} else {
			store_json(&*self.store, self.storage_key, &records).await;
		}
	}

	/// Loads records persisted by a previous run.
	pub async fn restore(&self) -> usize {
		let Some(records) = load_json::<Vec<QueuedRecord<P>>>(&*self.store, self.storage_key).await else {
			return 0;
		};
		let count = self.queue.restore(records);
		if count > 0 {
			info!(queue = self.name, count = count, "restored queued records");
		}
		count
	}

	pub fn start(self: &Arc<Self>) {
		let handle = Arc::clone(self).spawn_flush_loop();
		if let Some(old) = self.task.lock().replace(handle) {
			old.abort();
		}
	}

	fn spawn_flush_loop(self: Arc<Self>) -> JoinHandle<()> {
		tokio::spawn(async move {
			let period = self.queue.config().flush_interval;
			let mut ticker = interval_at(Instant::now() + period, period);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

			loop {
				let deadline = self.queue.flush_deadline();
				tokio::select! {
					_ = ticker.tick() => {
						if !self.queue.due_for_flush() {
							continue;
						}
					}
					_ = sleep_until_deadline(deadline) => {
						if !self.queue.claim_overdue(Instant::now()) {
							continue;
						}
						debug!(queue = self.name, "records waited flush_time, forcing flush");
					}
					_ = self.rearm.notified() => continue,
					_ = self.flush_notify.notified() => {}
				}

				if self.shutdown.load(Ordering::SeqCst) {
					break;
				}

				let this = Arc::clone(&self);
				tokio::spawn(async move {
					if let Err(e) = this.flush().await {
						debug!(queue = this.name, error = %e, "background flush failed");
					}
				});
			}
		})
	}

	pub fn stats(&self) -> QueueStats {
		self.queue.stats()
	}

	pub fn len(&self) -> usize {
		self.queue.len()
	}

	pub fn is_empty(&self) -> bool {
		self.queue.is_empty()
	}

	/// Stops the timer, makes a final flush attempt and persists leftovers.
	pub async fn shutdown(&self) {
		if self.shutdown.swap(true, Ordering::SeqCst) {
			return;
		}
		if let Some(task) = self.task.lock().take() {
			task.abort();
		}
		if let Err(e) = self.flush().await {
			error!(queue = self.name, error = %e, "final flush failed");
		}
		self.persist().await;
	}
}

/// The two telemetry streams.
pub struct TelemetryPipeline {
	events: Arc<TelemetryQueue<EventPayload>>,
	summaries: Arc<TelemetryQueue<SummaryPayload>>,
}

impl TelemetryPipeline {
	pub fn new(events: Arc<TelemetryQueue<EventPayload>>, summaries: Arc<TelemetryQueue<SummaryPayload>>) -> Self {
		Self { events, summaries }
	}

	/// Wires both queues to the HTTP transport.
	pub fn http(
		config: &ClientConfig,
		transport: SharedTransport,
		context: Arc<SdkContext>,
		monitor: Arc<ConnectionMonitor>,
		store: SharedStore,
		breakers: (Arc<CircuitBreaker>, Arc<CircuitBreaker>),
		error_hook: Option<ErrorHook>,
	) -> Self {
		let (events_breaker, summaries_breaker) = breakers;
		let events_sender = HttpBatchSender::<EventPayload>::new(
			transport.clone(),
			context.clone(),
			&config.endpoints.events,
			config,
			events_breaker,
		);
		let summaries_sender = HttpBatchSender::<SummaryPayload>::new(
			transport,
			context.clone(),
			&config.endpoints.summaries,
			config,
			summaries_breaker,
		);

		Self::new(
			Arc::new(TelemetryQueue::new(
				"events",
				EVENTS_KEY,
				config.events.clone(),
				Arc::new(events_sender),
				context.clone(),
				monitor.clone(),
				store.clone(),
				error_hook.clone(),
			)),
			Arc::new(TelemetryQueue::new(
				"summaries",
				SUMMARIES_KEY,
				config.summaries.clone(),
				Arc::new(summaries_sender),
				context,
				monitor,
				store,
				error_hook,
			)),
		)
	}

	pub fn events(&self) -> &Arc<TelemetryQueue<EventPayload>> {
		&self.events
	}

	pub fn summaries(&self) -> &Arc<TelemetryQueue<SummaryPayload>> {
		&self.summaries
	}

	pub fn track(&self, event: EventPayload) -> Result<EnqueueOutcome> {
		self.events.enqueue(event)
	}

	/// Queues an exposure summary for a served configuration value.
	pub fn record_exposure(&self, metadata: ExposureMetadata, user_id: Option<String>) -> Result<EnqueueOutcome> {
		self.summaries.enqueue(SummaryPayload::from_exposure(metadata, user_id))
	}

	/// Flushes both queues. Both are attempted; the first error is returned.
	pub async fn flush(&self) -> Result<()> {
		let events = self.events.flush().await;
		let summaries = self.summaries.flush().await;
		events?;
		summaries?;
		Ok(())
	}

	pub async fn restore(&self) {
		self.events.restore().await;
		self.summaries.restore().await;
	}

	pub fn start(&self) {
		self.events.start();
		self.summaries.start();
	}

	pub async fn shutdown(&self) {
		self.events.shutdown().await;
		self.summaries.shutdown().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::ConnectionConfig;
	use crate::session::SessionManager;
	use crate::storage::{KeyValueStore, MemoryStore};
	use crate::testing::{json_response, ScriptedTransport};
	use flagsync_common_http::{CircuitBreakerConfig, HttpResponse, TransportError};
	use flagsync_core::RotationPolicy;
	use serde_json::{json, Value};

	/// Records batches in memory; fails while `failing` is set.
	#[derive(Default)]
	struct RecordingSender {
		batches: Mutex<Vec<Vec<String>>>,
		failing: AtomicBool,
	}

	impl RecordingSender {
		fn batches(&self) -> Vec<Vec<String>> {
			self.batches.lock().clone()
		}
	}

	#[async_trait]
	impl BatchSender<EventPayload> for RecordingSender {
		async fn send_batch(&self, records: &[QueuedRecord<EventPayload>]) -> Result<()> {
			if self.failing.load(Ordering::SeqCst) {
				return Err(FlagsyncError::ServerError {
					status: 503,
					message: "unavailable".into(),
				});
			}
			self
				.batches
				.lock()
				.push(records.iter().map(|r| r.payload.event_type.clone()).collect());
			Ok(())
		}
	}

	struct Fixture {
		context: Arc<SdkContext>,
		monitor: Arc<ConnectionMonitor>,
		store: Arc<MemoryStore>,
	}

	impl Fixture {
		fn new() -> Self {
			let store = Arc::new(MemoryStore::new());
			let session = Arc::new(SessionManager::new(RotationPolicy::default(), store.clone()));
			Self {
				context: Arc::new(SdkContext::new(
					"sdk_key",
					UserContext::anonymous("anon"),
					session,
					Vec::new(),
				)),
				monitor: Arc::new(ConnectionMonitor::new(ConnectionConfig::default())),
				store,
			}
		}

		fn queue(
			&self,
			config: QueueConfig,
			sender: Arc<dyn BatchSender<EventPayload>>,
		) -> Arc<TelemetryQueue<EventPayload>> {
			Arc::new(TelemetryQueue::new(
				"events",
				EVENTS_KEY,
				config,
				sender,
				self.context.clone(),
				self.monitor.clone(),
				self.store.clone(),
				None,
			))
		}
	}

	fn track(queue: &TelemetryQueue<EventPayload>, names: &[&str]) {
		for name in names {
			queue.enqueue(EventPayload::new(*name)).unwrap();
		}
	}

	#[tokio::test]
	async fn test_flush_splits_into_batches_in_order() {
		let fixture = Fixture::new();
		let sender = Arc::new(RecordingSender::default());
		let queue = fixture.queue(
			QueueConfig {
				max_batch_size: 2,
				..QueueConfig::default()
			},
			sender.clone(),
		);

		track(&queue, &["a", "b", "c"]);
		assert_eq!(queue.flush().await.unwrap(), 3);

		assert_eq!(sender.batches(), vec![vec!["a", "b"], vec!["c"]]);
		assert!(queue.is_empty());
		assert_eq!(queue.stats().sent, 3);
	}

	#[tokio::test]
	async fn test_failed_flush_requeues_and_persists() {
		let fixture = Fixture::new();
		let sender = Arc::new(RecordingSender::default());
		sender.failing.store(true, Ordering::SeqCst);
		let queue = fixture.queue(QueueConfig::default(), sender.clone());

		track(&queue, &["a", "b"]);
		assert!(queue.flush().await.is_err());

		assert_eq!(queue.len(), 2);
		assert_eq!(queue.stats().failed_flushes, 1);
		assert!(fixture.store.get(EVENTS_KEY).await.unwrap().is_some());

		sender.failing.store(false, Ordering::SeqCst);
		assert_eq!(queue.flush().await.unwrap(), 2);
		assert_eq!(sender.batches(), vec![vec!["a", "b"]]);
		assert!(fixture.store.get(EVENTS_KEY).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn test_persisted_records_survive_restart() {
		let fixture = Fixture::new();
		let sender = Arc::new(RecordingSender::default());
		sender.failing.store(true, Ordering::SeqCst);
		let first = fixture.queue(QueueConfig::default(), sender);
		track(&first, &["kept"]);
		let _ = first.flush().await;

		let replay = Arc::new(RecordingSender::default());
		let second = fixture.queue(QueueConfig::default(), replay.clone());
		assert_eq!(second.restore().await, 1);
		second.flush().await.unwrap();

		assert_eq!(replay.batches(), vec![vec!["kept"]]);
	}

	#[tokio::test]
	async fn test_offline_skips_flush() {
		let fixture = Fixture::new();
		let sender = Arc::new(RecordingSender::default());
		let queue = fixture.queue(QueueConfig::default(), sender.clone());
		fixture.monitor.set_offline_mode(true);

		track(&queue, &["a"]);
		assert_eq!(queue.flush().await.unwrap(), 0);
		assert!(sender.batches().is_empty());
		assert_eq!(queue.len(), 1);
		fixture.monitor.stop();
	}

	#[tokio::test]
	async fn test_records_carry_session_id() {
		let fixture = Fixture::new();
		let record = fixture.context.session().initialize().await;
		let queue = fixture.queue(QueueConfig::default(), Arc::new(RecordingSender::default()));

		track(&queue, &["a"]);
		let queued = queue.queue.records();
		assert_eq!(queued[0].session_id, Some(record.session_id.clone()));
	}

	#[tokio::test]
	async fn test_enqueue_after_shutdown_fails() {
		let fixture = Fixture::new();
		let sender = Arc::new(RecordingSender::default());
		let queue = fixture.queue(QueueConfig::default(), sender.clone());

		track(&queue, &["last"]);
		queue.shutdown().await;

		assert_eq!(sender.batches(), vec![vec!["last"]]);
		assert!(matches!(
			queue.enqueue(EventPayload::new("late")),
			Err(FlagsyncError::ClientShutdown)
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_timer_flushes_after_interval() {
		let fixture = Fixture::new();
		let sender = Arc::new(RecordingSender::default());
		let queue = fixture.queue(QueueConfig::default(), sender.clone());
		queue.start();

		track(&queue, &["a", "b", "c"]);
		tokio::time::sleep(Duration::from_millis(2900)).await;
		assert!(sender.batches().is_empty());
		tokio::time::sleep(Duration::from_millis(200)).await;

		assert_eq!(sender.batches(), vec![vec!["a", "b", "c"]]);
		assert!(queue.is_empty());
		queue.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn test_timer_retries_on_the_next_tick_after_a_failure() {
		let fixture = Fixture::new();
		let sender = Arc::new(RecordingSender::default());
		sender.failing.store(true, Ordering::SeqCst);
		let queue = fixture.queue(QueueConfig::default(), sender.clone());
		queue.start();

		track(&queue, &["a"]);
		tokio::time::sleep(Duration::from_millis(3100)).await;
		assert_eq!(queue.stats().failed_flushes, 1);
		assert_eq!(queue.len(), 1);

		sender.failing.store(false, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(3000)).await;

		assert_eq!(sender.batches(), vec![vec!["a"]]);
		assert!(queue.is_empty());
		queue.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn test_records_waiting_flush_time_are_flushed_between_ticks() {
		let fixture = Fixture::new();
		let sender = Arc::new(RecordingSender::default());
		let queue = fixture.queue(
			QueueConfig {
				flush_interval: Duration::from_secs(60),
				flush_time: Duration::from_secs(5),
				..QueueConfig::default()
			},
			sender.clone(),
		);
		queue.start();
		tokio::task::yield_now().await;

		track(&queue, &["slow"]);
		tokio::time::sleep(Duration::from_millis(4900)).await;
		assert!(sender.batches().is_empty());
		tokio::time::sleep(Duration::from_millis(200)).await;

		assert_eq!(sender.batches(), vec![vec!["slow"]]);
		queue.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn test_full_batch_flushes_immediately() {
		let fixture = Fixture::new();
		let sender = Arc::new(RecordingSender::default());
		let queue = fixture.queue(
			QueueConfig {
				max_batch_size: 2,
				..QueueConfig::default()
			},
			sender.clone(),
		);
		queue.start();

		track(&queue, &["a", "b"]);
		tokio::time::sleep(Duration::from_millis(10)).await;

		assert_eq!(sender.batches(), vec![vec!["a", "b"]]);
		queue.shutdown().await;
	}

	#[tokio::test]
	async fn test_http_sender_posts_wire_payload() {
		let fixture = Fixture::new();
		let transport = Arc::new(ScriptedTransport::new());
		transport.reply(json_response(202, json!({})));
		let sender = HttpBatchSender::<EventPayload>::new(
			transport.clone(),
			fixture.context.clone(),
			"/api/sdk/events",
			&ClientConfig::default(),
			Arc::new(CircuitBreaker::new(EVENTS_BREAKER_KEY, CircuitBreakerConfig::default())),
		);

		let record = QueuedRecord::new(EventPayload::new("purchase").with_customer_id("c-1"), None);
		sender.send_batch(std::slice::from_ref(&record)).await.unwrap();

		let requests = transport.requests();
		assert_eq!(requests.len(), 1);
		assert_eq!(requests[0].path, "/api/sdk/events");
		let body: Value = serde_json::from_slice(requests[0].body.as_deref().unwrap_or_default()).unwrap();
		assert_eq!(body["user"]["anonymous_id"], "anon");
		assert_eq!(body["events"][0]["event_type"], "purchase");
		assert_eq!(body["events"][0]["event_customer_id"], "c-1");
		assert_eq!(body["events"][0]["insert_id"], record.insert_id.to_string());
		assert_eq!(body["sdk_version"], SDK_VERSION);
	}

	#[tokio::test(start_paused = true)]
	async fn test_http_sender_retries_then_opens_breaker() {
		let fixture = Fixture::new();
		let transport = Arc::new(ScriptedTransport::new());
		transport.always(Err(TransportError::Connect("refused".into())));
		let breaker = Arc::new(CircuitBreaker::new(
			EVENTS_BREAKER_KEY,
			CircuitBreakerConfig {
				failure_threshold: 1,
				..CircuitBreakerConfig::default()
			},
		));
		let sender = HttpBatchSender::<EventPayload>::new(
			transport.clone(),
			fixture.context.clone(),
			"/api/sdk/events",
			&ClientConfig::default(),
			breaker,
		);
		let records = vec![QueuedRecord::new(EventPayload::new("a"), None)];

		assert!(matches!(
			sender.send_batch(&records).await,
			Err(FlagsyncError::Network(_))
		));
		assert_eq!(transport.request_count(), 3);

		assert!(matches!(
			sender.send_batch(&records).await,
			Err(FlagsyncError::CircuitOpen { .. })
		));
		assert_eq!(transport.request_count(), 3);
	}

	#[tokio::test]
	async fn test_http_sender_rejects_bad_key_without_retry() {
		let fixture = Fixture::new();
		let transport = Arc::new(ScriptedTransport::new());
		transport.always(Ok(HttpResponse::new(403)));
		let sender = HttpBatchSender::<EventPayload>::new(
			transport.clone(),
			fixture.context.clone(),
			"/api/sdk/events",
			&ClientConfig::default(),
			Arc::new(CircuitBreaker::new(EVENTS_BREAKER_KEY, CircuitBreakerConfig::default())),
		);
		let records = vec![QueuedRecord::new(EventPayload::new("a"), None)];

		assert!(matches!(
			sender.send_batch(&records).await,
			Err(FlagsyncError::AuthenticationFailed { status: 403 })
		));
		assert_eq!(transport.request_count(), 1);
	}

	#[test]
	fn test_summary_batch_encoding() {
		let meta = ExposureMetadata::from_value(&json!({
			"value": 1,
			"config_id": "cfg",
			"behaviour_id": "b",
			"experience_id": "e",
		}))
		.unwrap();
		let record = QueuedRecord::new(SummaryPayload::from_exposure(meta, Some("u1".into())), None);
		let body = SummaryPayload::encode_batch(UserContext::anonymous("anon"), &[record], "1.0.0").unwrap();
		let value: Value = serde_json::from_slice(&body).unwrap();

		assert_eq!(value["summaries"][0]["config_id"], "cfg");
		assert_eq!(value["summaries"][0]["user_id"], "u1");
		assert_eq!(value["sdk_version"], "1.0.0");
	}
}
