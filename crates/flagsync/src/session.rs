// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Session lifecycle.
//!
//! The manager owns the current [`SessionRecord`] behind an `Arc` that is
//! swapped whole on every change. Rotation triggers other than manual and
//! authentication changes are suppressed while the current session is
//! younger than the policy's minimum duration.
//!
//! Client activity is recorded in memory on every read and tracked event. A
//! background tick applies the time based trigger and writes pending
//! activity to storage.

/// How often the background tick runs.
pub const SESSION_CHECK_INTERVAL: Duration = Duration::from_secs(15);

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flagsync_core::{RotationPolicy, RotationReason, SessionEvent, SessionId, SessionRecord};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::listeners::{ListenerId, ListenerRegistry};
use crate::storage::{load_json, store_json, SharedStore, SESSION_KEY};

pub struct SessionManager {
	policy: RotationPolicy,
	store: SharedStore,
	app_start: DateTime<Utc>,
	current: RwLock<Option<Arc<SessionRecord>>>,
	background_since: Mutex<Option<DateTime<Utc>>>,
	user_id: Mutex<Option<String>>,
	listeners: ListenerRegistry<SessionEvent>,
	persist_lock: tokio::sync::Mutex<()>,
	dirty: AtomicBool,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
	pub fn new(policy: RotationPolicy, store: SharedStore) -> Self {
		Self {
			policy,
			store,
			app_start: Utc::now(),
			current: RwLock::new(None),
			background_since: Mutex::new(None),
			user_id: Mutex::new(None),
			listeners: ListenerRegistry::new("session"),
			persist_lock: tokio::sync::Mutex::new(()),
			dirty: AtomicBool::new(false),
			task: Mutex::new(None),
		}
	}

	pub fn policy(&self) -> &RotationPolicy {
		&self.policy
	}

	/// The current session, if initialized.
	pub fn current(&self) -> Option<Arc<SessionRecord>> {
		self.current.read().clone()
	}

	pub fn session_id(&self) -> Option<SessionId> {
		self
			.current
			.read()
			.as_ref()
			.map(|record| record.session_id.clone())
	}

	pub fn user_id(&self) -> Option<String> {
		self.user_id.lock().clone()
	}

	pub fn add_listener<F>(&self, callback: F) -> ListenerId
	where
		F: Fn(&SessionEvent) + Send + Sync + 'static,
	{
		self.listeners.add(callback)
	}

	pub fn remove_listener(&self, id: ListenerId) -> bool {
		self.listeners.remove(id)
	}

	/// Restores the persisted session if it is still valid, otherwise starts
	/// a new one.
	pub async fn initialize(&self) -> Arc<SessionRecord> {
		self.initialize_at(Utc::now()).await
	}

	pub(crate) async fn initialize_at(&self, now: DateTime<Utc>) -> Arc<SessionRecord> {
		if let Some(current) = self.current() {
			return current;
		}

		let persisted: Option<SessionRecord> = load_json(&*self.store, SESSION_KEY).await;
		match persisted {
			Some(record) if self.policy.is_resumable(&record, now) => {
				let record = Arc::new(record.touched(now));
				*self.current.write() = Some(Arc::clone(&record));

				if self.policy.rotate_on_app_restart
					&& self.rotate_at(RotationReason::AppRestart, now).await.is_some()
				{
					return self.current().unwrap_or(record);
				}

				info!(session_id = %record.session_id, "session restored");
				self.persist_current().await;
				self.listeners.notify(&SessionEvent::Restored {
					session: record.session_id.clone(),
				});
				record
			}
			Some(expired) => {
				let reason = if expired.age(now) >= self.policy.max_session_duration {
					RotationReason::TimeExceeded
				} else {
					RotationReason::BackgroundTimeout
				};
				debug!(session_id = %expired.session_id, reason = %reason, "persisted session expired");

				let record = Arc::new(SessionRecord::new(self.app_start, now));
				*self.current.write() = Some(Arc::clone(&record));
				self.persist_current().await;
				self.listeners.notify(&SessionEvent::Rotated {
					old: Some(expired.session_id),
					new: record.session_id.clone(),
					reason,
				});
				record
			}
			None => {
				let record = Arc::new(SessionRecord::new(self.app_start, now));
				*self.current.write() = Some(Arc::clone(&record));
				info!(session_id = %record.session_id, "session started");
				self.persist_current().await;
				self.listeners.notify(&SessionEvent::Started {
					session: record.session_id.clone(),
				});
				record
			}
		}
	}

	/// Replaces the current session. Returns `None` when the rotation was
	/// suppressed by the minimum session duration.
	pub async fn rotate(&self, reason: RotationReason) -> Option<SessionEvent> {
		self.rotate_at(reason, Utc::now()).await
	}

	pub(crate) async fn rotate_at(&self, reason: RotationReason, now: DateTime<Utc>) -> Option<SessionEvent> {
		let (event, record) = {
			let mut current = self.current.write();
			if let Some(existing) = current.as_ref() {
				if !reason.bypasses_min_duration()
					&& existing.age(now) < self.policy.min_session_duration
				{
					debug!(
						session_id = %existing.session_id,
						reason = %reason,
						"rotation suppressed, session below minimum duration"
					);
					return None;
				}
			}

			let old = current.as_ref().map(|r| r.session_id.clone());
			let record = Arc::new(SessionRecord::new(self.app_start, now));
			*current = Some(Arc::clone(&record));
			(
				SessionEvent::Rotated {
					old,
					new: record.session_id.clone(),
					reason,
				},
				record,
			)
		};

		info!(session_id = %record.session_id, reason = %reason, "session rotated");
		self.persist_current().await;
		self.listeners.notify(&event);
		Some(event)
	}

	/// Refreshes `last_active_at` without rotating.
	pub async fn update_activity(&self) {
		self.update_activity_at(Utc::now()).await;
	}

	pub(crate) async fn update_activity_at(&self, now: DateTime<Utc>) {
		let record = {
			let mut current = self.current.write();
			let Some(existing) = current.as_ref() else {
				return;
			};
			let touched = Arc::new(existing.touched(now));
			*current = Some(Arc::clone(&touched));
			touched
		};
		self.persist_current().await;
	}

	/// Applies the time based trigger.
	pub async fn check_rotation(&self) -> Option<SessionEvent> {
		self.check_rotation_at(Utc::now()).await
	}

	pub(crate) async fn check_rotation_at(&self, now: DateTime<Utc>) -> Option<SessionEvent> {
		if !self.policy.enable_time_based_rotation {
			return None;
		}
		let current = self.current()?;
		if self.time_exceeded(&current, now) {
			self.rotate_at(RotationReason::TimeExceeded, now).await
		} else {
			None
		}
	}

	/// Marks the session active, rotating it first when it outlived
	/// `max_session_duration`. Never touches storage; the background tick
	/// persists the change.
	pub fn record_activity(&self) -> Option<SessionEvent> {
		self.record_activity_at(Utc::now())
	}

	pub(crate) fn record_activity_at(&self, now: DateTime<Utc>) -> Option<SessionEvent> {
		let event = {
			let mut current = self.current.write();
			let existing = current.as_ref()?;
			if self.time_exceeded(existing, now) && existing.age(now) >= self.policy.min_session_duration {
				let old = existing.session_id.clone();
				let record = SessionRecord::new(self.app_start, now);
				let new = record.session_id.clone();
				*current = Some(Arc::new(record));
				Some(SessionEvent::Rotated {
					old: Some(old),
					new,
					reason: RotationReason::TimeExceeded,
				})
			} else {
				let touched = Arc::new(existing.touched(now));
				*current = Some(touched);
				None
			}
		};
		self.dirty.store(true, Ordering::SeqCst);

		if let Some(event) = &event {
			info!(session_id = %event.current(), reason = %RotationReason::TimeExceeded, "session rotated");
			self.listeners.notify(event);
		}
		event
	}

	fn time_exceeded(&self, record: &SessionRecord, now: DateTime<Utc>) -> bool {
		self.policy.enable_time_based_rotation && record.age(now) >= self.policy.max_session_duration
	}

	/// Starts the background tick.
	pub fn start(self: &Arc<Self>, every: Duration) {
		let handle = Arc::clone(self).spawn_tick_loop(every);
		if let Some(old) = self.task.lock().replace(handle) {
			old.abort();
		}
	}

	fn spawn_tick_loop(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
			loop {
				ticker.tick().await;
				self.check_rotation().await;
				if self.dirty.load(Ordering::SeqCst) {
					self.persist_current().await;
				}
			}
		})
	}

	/// Stops the tick, writes pending activity and drops listeners.
	pub async fn shutdown(&self) {
		if let Some(task) = self.task.lock().take() {
			task.abort();
		}
		if self.dirty.load(Ordering::SeqCst) {
			self.persist_current().await;
		}
		self.listeners.clear();
	}

	pub async fn on_background(&self) {
		self.on_background_at(Utc::now()).await;
	}

	pub(crate) async fn on_background_at(&self, now: DateTime<Utc>) {
		*self.background_since.lock() = Some(now);
		self.update_activity_at(now).await;
	}

	/// Rotates when the app stayed in the background past the threshold.
	pub async fn on_foreground(&self) -> Option<SessionEvent> {
		self.on_foreground_at(Utc::now()).await
	}

	pub(crate) async fn on_foreground_at(&self, now: DateTime<Utc>) -> Option<SessionEvent> {
		let since = self.background_since.lock().take();
		let away = since
			.and_then(|since| (now - since).to_std().ok())
			.unwrap_or_default();

		let event = if since.is_some() && away >= self.policy.background_threshold {
			self.rotate_at(RotationReason::BackgroundTimeout, now).await
		} else {
			self.check_rotation_at(now).await
		};

		if event.is_none() {
			self.update_activity_at(now).await;
		}
		event
	}

	/// Records the authenticated user and rotates when the policy asks for it.
	pub async fn on_authentication_change(&self, user_id: Option<String>) -> Option<SessionEvent> {
		self.on_authentication_change_at(user_id, Utc::now()).await
	}

	pub(crate) async fn on_authentication_change_at(
		&self,
		user_id: Option<String>,
		now: DateTime<Utc>,
	) -> Option<SessionEvent> {
		*self.user_id.lock() = user_id;
		if self.policy.rotate_on_auth_change {
			self.rotate_at(RotationReason::AuthChange, now).await
		} else {
			None
		}
	}

	pub async fn on_network_change(&self) -> Option<SessionEvent> {
		self.rotate_at(RotationReason::NetworkChange, Utc::now()).await
	}

	/// Writes the record that is current once the previous write has
	/// finished, so storage always ends on the newest session.
	async fn persist_current(&self) {
		let _guard = self.persist_lock.lock().await;
		self.dirty.store(false, Ordering::SeqCst);
		let Some(record) = self.current() else {
			return;
		};
		store_json(&*self.store, SESSION_KEY, &*record).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::Result;
	use crate::storage::{KeyValueStore, MemoryStore};
	use async_trait::async_trait;
	use chrono::Duration as ChronoDuration;
	use std::sync::atomic::AtomicUsize;

	/// Delays its second write so a later write can overtake it.
	struct SlowSecondWrite {
		inner: Arc<MemoryStore>,
		writes: AtomicUsize,
	}

	#[async_trait]
	impl KeyValueStore for SlowSecondWrite {
		async fn get(&self, key: &str) -> Result<Option<String>> {
			self.inner.get(key).await
		}

		async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
			if self.writes.fetch_add(1, Ordering::SeqCst) == 1 {
				tokio::time::sleep(Duration::from_millis(100)).await;
			}
			self.inner.set(key, value, ttl).await
		}

		async fn remove(&self, key: &str) -> Result<()> {
			self.inner.remove(key).await
		}
	}

	fn manager_with(policy: RotationPolicy, store: Arc<MemoryStore>) -> SessionManager {
		SessionManager::new(policy, store)
	}

	fn manager() -> SessionManager {
		manager_with(RotationPolicy::default(), Arc::new(MemoryStore::new()))
	}

	fn recorder(manager: &SessionManager) -> Arc<Mutex<Vec<SessionEvent>>> {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let s = seen.clone();
		manager.add_listener(move |event: &SessionEvent| s.lock().push(event.clone()));
		seen
	}

	async fn persisted(store: &MemoryStore) -> Option<SessionRecord> {
		load_json(store, SESSION_KEY).await
	}

	#[tokio::test]
	async fn test_first_initialize_starts_and_persists() {
		let store = Arc::new(MemoryStore::new());
		let manager = manager_with(RotationPolicy::default(), store.clone());
		let seen = recorder(&manager);

		let record = manager.initialize().await;

		assert_eq!(manager.session_id(), Some(record.session_id.clone()));
		assert_eq!(persisted(&store).await.unwrap().session_id, record.session_id);
		assert_eq!(
			*seen.lock(),
			vec![SessionEvent::Started {
				session: record.session_id.clone()
			}]
		);

		// Initializing again keeps the session.
		let again = manager.initialize().await;
		assert_eq!(again.session_id, record.session_id);
		assert_eq!(seen.lock().len(), 1);
	}

	#[tokio::test]
	async fn test_valid_persisted_session_is_restored() {
		let store = Arc::new(MemoryStore::new());
		let now = Utc::now();
		let first = manager_with(RotationPolicy::default(), store.clone());
		let original = first.initialize_at(now).await;

		let second = manager_with(RotationPolicy::default(), store.clone());
		let seen = recorder(&second);
		let restored = second.initialize_at(now + ChronoDuration::minutes(2)).await;

		assert_eq!(restored.session_id, original.session_id);
		assert_eq!(restored.last_active_at, now + ChronoDuration::minutes(2));
		assert_eq!(
			*seen.lock(),
			vec![SessionEvent::Restored {
				session: original.session_id.clone()
			}]
		);
	}

	#[tokio::test]
	async fn test_expired_persisted_session_is_replaced() {
		let store = Arc::new(MemoryStore::new());
		let now = Utc::now();
		let original = manager_with(RotationPolicy::default(), store.clone())
			.initialize_at(now)
			.await;

		let second = manager_with(RotationPolicy::default(), store.clone());
		let seen = recorder(&second);
		let fresh = second.initialize_at(now + ChronoDuration::minutes(10)).await;

		assert_ne!(fresh.session_id, original.session_id);
		assert_eq!(
			*seen.lock(),
			vec![SessionEvent::Rotated {
				old: Some(original.session_id.clone()),
				new: fresh.session_id.clone(),
				reason: RotationReason::BackgroundTimeout,
			}]
		);
	}

	#[tokio::test]
	async fn test_rotate_on_app_restart() {
		let store = Arc::new(MemoryStore::new());
		let policy = RotationPolicy {
			rotate_on_app_restart: true,
			..RotationPolicy::default()
		};
		let now = Utc::now();
		let original = manager_with(policy.clone(), store.clone())
			.initialize_at(now)
			.await;

		// Restarting inside the minimum duration keeps the session.
		let quick = manager_with(policy.clone(), store.clone());
		let kept = quick.initialize_at(now + ChronoDuration::seconds(10)).await;
		assert_eq!(kept.session_id, original.session_id);

		let later = manager_with(policy, store.clone());
		let seen = recorder(&later);
		let rotated = later.initialize_at(now + ChronoDuration::minutes(2)).await;
		assert_ne!(rotated.session_id, original.session_id);
		assert!(matches!(
			seen.lock().as_slice(),
			[SessionEvent::Rotated {
				reason: RotationReason::AppRestart,
				..
			}]
		));
	}

	#[tokio::test]
	async fn test_minimum_duration_suppresses_automatic_rotation() {
		let manager = manager();
		let now = Utc::now();
		let first = manager.initialize_at(now).await;
		let soon = now + ChronoDuration::seconds(10);

		assert!(manager
			.rotate_at(RotationReason::NetworkChange, soon)
			.await
			.is_none());
		assert!(manager
			.rotate_at(RotationReason::TimeExceeded, soon)
			.await
			.is_none());
		assert_eq!(manager.session_id(), Some(first.session_id.clone()));

		let event = manager.rotate_at(RotationReason::Manual, soon).await.unwrap();
		assert_eq!(
			event,
			SessionEvent::Rotated {
				old: Some(first.session_id.clone()),
				new: manager.session_id().unwrap(),
				reason: RotationReason::Manual,
			}
		);
	}

	#[tokio::test]
	async fn test_auth_change_always_rotates() {
		let manager = manager();
		let now = Utc::now();
		manager.initialize_at(now).await;

		let event = manager
			.on_authentication_change_at(Some("user_1".into()), now + ChronoDuration::seconds(1))
			.await;
		assert!(matches!(
			event,
			Some(SessionEvent::Rotated {
				reason: RotationReason::AuthChange,
				..
			})
		));
		assert_eq!(manager.user_id().as_deref(), Some("user_1"));

		let disabled = manager_with(
			RotationPolicy {
				rotate_on_auth_change: false,
				..RotationPolicy::default()
			},
			Arc::new(MemoryStore::new()),
		);
		disabled.initialize_at(now).await;
		assert!(disabled
			.on_authentication_change_at(None, now + ChronoDuration::minutes(5))
			.await
			.is_none());
	}

	#[tokio::test]
	async fn test_time_based_rotation() {
		let manager = manager();
		let now = Utc::now();
		manager.initialize_at(now).await;

		assert!(manager
			.check_rotation_at(now + ChronoDuration::minutes(29))
			.await
			.is_none());
		let event = manager
			.check_rotation_at(now + ChronoDuration::minutes(31))
			.await;
		assert!(matches!(
			event,
			Some(SessionEvent::Rotated {
				reason: RotationReason::TimeExceeded,
				..
			})
		));

		let disabled = manager_with(
			RotationPolicy {
				enable_time_based_rotation: false,
				..RotationPolicy::default()
			},
			Arc::new(MemoryStore::new()),
		);
		disabled.initialize_at(now).await;
		assert!(disabled
			.check_rotation_at(now + ChronoDuration::hours(5))
			.await
			.is_none());
	}

	#[tokio::test]
	async fn test_background_timeout() {
		let manager = manager();
		let now = Utc::now();
		let first = manager.initialize_at(now).await;

		manager.on_background_at(now + ChronoDuration::minutes(1)).await;
		let short = manager
			.on_foreground_at(now + ChronoDuration::minutes(2))
			.await;
		assert!(short.is_none());
		let current = manager.current().unwrap();
		assert_eq!(current.session_id, first.session_id);
		assert_eq!(current.last_active_at, now + ChronoDuration::minutes(2));

		manager.on_background_at(now + ChronoDuration::minutes(3)).await;
		let long = manager
			.on_foreground_at(now + ChronoDuration::minutes(9))
			.await;
		assert!(matches!(
			long,
			Some(SessionEvent::Rotated {
				reason: RotationReason::BackgroundTimeout,
				..
			})
		));
	}

	#[tokio::test]
	async fn test_records_are_replaced_not_mutated() {
		let manager = manager();
		let now = Utc::now();
		let before = manager.initialize_at(now).await;

		manager
			.update_activity_at(now + ChronoDuration::seconds(20))
			.await;
		let after = manager.current().unwrap();

		assert_eq!(before.last_active_at, now);
		assert_eq!(after.last_active_at, now + ChronoDuration::seconds(20));
		assert_eq!(after.session_id, before.session_id);
		assert!(!Arc::ptr_eq(&before, &after));
	}

	#[tokio::test]
	async fn test_every_rotation_notifies_listeners() {
		let manager = manager_with(
			RotationPolicy {
				min_session_duration: Duration::ZERO,
				..RotationPolicy::default()
			},
			Arc::new(MemoryStore::new()),
		);
		manager.initialize().await;
		let seen = recorder(&manager);

		manager.rotate(RotationReason::Manual).await;
		manager.on_network_change().await;

		let reasons: Vec<RotationReason> = seen
			.lock()
			.iter()
			.filter_map(|event| match event {
				SessionEvent::Rotated { reason, .. } => Some(*reason),
				_ => None,
			})
			.collect();
		assert_eq!(
			reasons,
			vec![RotationReason::Manual, RotationReason::NetworkChange]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_overlapping_writes_leave_the_newest_session_stored() {
		let inner = Arc::new(MemoryStore::new());
		let store = Arc::new(SlowSecondWrite {
			inner: inner.clone(),
			writes: AtomicUsize::new(0),
		});
		let manager = Arc::new(SessionManager::new(RotationPolicy::default(), store));
		let original = manager.initialize().await;

		let touching = manager.clone();
		let activity = tokio::spawn(async move { touching.update_activity().await });
		tokio::task::yield_now().await;
		let event = manager.rotate(RotationReason::Manual).await.unwrap();
		activity.await.unwrap();

		let rotated_to = event.current().clone();
		assert_ne!(rotated_to, original.session_id);
		assert_eq!(persisted(&inner).await.unwrap().session_id, rotated_to);

		let restarted = manager_with(RotationPolicy::default(), inner);
		assert_eq!(restarted.initialize().await.session_id, rotated_to);
	}

	#[tokio::test]
	async fn test_record_activity_touches_in_memory_only() {
		let store = Arc::new(MemoryStore::new());
		let manager = manager_with(RotationPolicy::default(), store.clone());
		let now = Utc::now();
		let first = manager.initialize_at(now).await;

		let later = now + ChronoDuration::minutes(5);
		assert!(manager.record_activity_at(later).is_none());

		let current = manager.current().unwrap();
		assert_eq!(current.session_id, first.session_id);
		assert_eq!(current.last_active_at, later);
		assert_eq!(persisted(&store).await.unwrap().last_active_at, now);

		manager.shutdown().await;
		assert_eq!(persisted(&store).await.unwrap().last_active_at, later);
	}

	#[tokio::test]
	async fn test_record_activity_rotates_expired_session() {
		let manager = manager();
		let seen = recorder(&manager);
		let now = Utc::now();
		let first = manager.initialize_at(now).await;

		let event = manager.record_activity_at(now + ChronoDuration::minutes(31));
		assert!(matches!(
			event,
			Some(SessionEvent::Rotated {
				reason: RotationReason::TimeExceeded,
				..
			})
		));
		assert_ne!(manager.session_id(), Some(first.session_id.clone()));
		assert_eq!(seen.lock().len(), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn test_tick_persists_pending_activity() {
		let store = Arc::new(MemoryStore::new());
		let manager = Arc::new(manager_with(RotationPolicy::default(), store.clone()));
		let first = manager.initialize().await;
		manager.start(Duration::from_secs(15));

		manager.record_activity();
		tokio::time::sleep(Duration::from_secs(16)).await;
		let stored = persisted(&store).await.unwrap();
		assert_eq!(stored.session_id, first.session_id);
		assert_eq!(stored.last_active_at, manager.current().unwrap().last_active_at);

		manager.shutdown().await;
	}
}
