// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Connection monitoring and reconnect scheduling.
//!
//! The monitor owns the [`ConnectionState`]. Components report the outcome of
//! their network calls; the monitor turns failures into a jittered,
//! exponentially growing reconnect delay and runs a connectivity probe when
//! the delay expires. A heartbeat probes the service when nothing has
//! succeeded for a while.
//!
//! Offline mode is only entered on request. While offline, reports are
//! ignored and no probes run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use flagsync_core::{ConnectionState, ConnectionStatus};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::listeners::{invoke, Callback, ListenerId, ListenerRegistry};

/// Checks whether the service is reachable.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
	async fn probe(&self) -> Result<()>;
}

/// Reconnect delay after `failures` consecutive failures:
/// `min(base * 2^failures, max) * jitter(0.8..1.2)`.
pub fn reconnect_delay(config: &ConnectionConfig, failures: u32) -> Duration {
	let exponent = failures.min(31) as i32;
	let raw = config.reconnect_base_delay.as_secs_f64() * 2f64.powi(exponent);
	let capped = raw.min(config.reconnect_max_delay.as_secs_f64());
	let jitter = 0.8 + fastrand::f64() * 0.4;
	Duration::from_secs_f64(capped * jitter)
}

struct MonitorInner {
	state: ConnectionState,
	last_success: Option<Instant>,
	reconnect_task: Option<JoinHandle<()>>,
	heartbeat_task: Option<JoinHandle<()>>,
	probe_in_flight: bool,
	stopped: bool,
}

pub struct ConnectionMonitor {
	config: ConnectionConfig,
	inner: Mutex<MonitorInner>,
	listeners: ListenerRegistry<ConnectionState>,
	probe: RwLock<Option<Arc<dyn ConnectivityProbe>>>,
}

impl ConnectionMonitor {
	pub fn new(config: ConnectionConfig) -> Self {
		Self {
			config,
			inner: Mutex::new(MonitorInner {
				state: ConnectionState::default(),
				last_success: None,
				reconnect_task: None,
				heartbeat_task: None,
				probe_in_flight: false,
				stopped: false,
			}),
			listeners: ListenerRegistry::new("connection"),
			probe: RwLock::new(None),
		}
	}

	pub fn config(&self) -> &ConnectionConfig {
		&self.config
	}

	pub fn set_probe(&self, probe: Arc<dyn ConnectivityProbe>) {
		*self.probe.write() = Some(probe);
	}

	pub fn state(&self) -> ConnectionState {
		self.inner.lock().state.clone()
	}

	pub fn status(&self) -> ConnectionStatus {
		self.inner.lock().state.status
	}

	pub fn is_offline(&self) -> bool {
		self.status() == ConnectionStatus::Offline
	}

	/// Registers a listener. It is called immediately with the current state
	/// and then on every status transition.
	pub fn add_listener<F>(&self, callback: F) -> ListenerId
	where
		F: Fn(&ConnectionState) + Send + Sync + 'static,
	{
		let callback: Callback<ConnectionState> = Arc::new(callback);
		let id = self.listeners.add_arc(callback.clone());
		invoke("connection", id, &callback, &self.state());
		id
	}

	pub fn remove_listener(&self, id: ListenerId) -> bool {
		self.listeners.remove(id)
	}

	/// Starts the heartbeat loop.
	pub fn start(self: &Arc<Self>) {
		let handle = Arc::clone(self).spawn_heartbeat_loop();
		let mut inner = self.inner.lock();
		if let Some(old) = inner.heartbeat_task.replace(handle) {
			old.abort();
		}
	}

	fn spawn_heartbeat_loop(self: Arc<Self>) -> JoinHandle<()> {
		let period = self.config.heartbeat_interval;
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
			loop {
				ticker.tick().await;
				if self.is_stale() {
					debug!("connection stale, probing");
					Arc::clone(&self).spawn_probe(Duration::ZERO);
				}
			}
		})
	}

	fn is_stale(&self) -> bool {
		let inner = self.inner.lock();
		if inner.stopped
			|| inner.probe_in_flight
			|| inner.reconnect_task.is_some()
			|| inner.state.status == ConnectionStatus::Offline
		{
			return false;
		}
		match inner.last_success {
			Some(at) => at.elapsed() >= self.config.stale_after,
			None => true,
		}
	}

	pub fn report_success(&self) {
		let changed = {
			let mut inner = self.inner.lock();
			if inner.stopped || inner.state.status == ConnectionStatus::Offline {
				return;
			}
			if let Some(task) = inner.reconnect_task.take() {
				task.abort();
			}
			inner.last_success = Some(Instant::now());
			inner.state.failure_count = 0;
			inner.state.last_error = None;
			inner.state.last_success = Some(Utc::now());
			inner.state.next_reconnect_at = None;
			transition(&mut inner.state, ConnectionStatus::Connected).then(|| inner.state.clone())
		};

		if let Some(state) = changed {
			info!("connection established");
			self.notify(&state);
		}
	}

	/// Records a failure and schedules a reconnect probe.
	pub fn report_failure(self: &Arc<Self>, error: &dyn std::fmt::Display) {
		let (changed, delay) = {
			let mut inner = self.inner.lock();
			if inner.stopped || inner.state.status == ConnectionStatus::Offline {
				debug!(error = %error, "ignoring failure report");
				return;
			}
			inner.state.failure_count = inner.state.failure_count.saturating_add(1);
			inner.state.last_error = Some(error.to_string());
			let delay = reconnect_delay(&self.config, inner.state.failure_count);
			inner.state.next_reconnect_at = chrono::Duration::from_std(delay)
				.ok()
				.map(|d| Utc::now() + d);
			let changed = transition(&mut inner.state, ConnectionStatus::Connecting).then(|| inner.state.clone());
			(changed, delay)
		};

		warn!(
			error = %error,
			delay_ms = delay.as_millis(),
			"connection failure, scheduling reconnect"
		);
		Arc::clone(self).spawn_probe(delay);

		if let Some(state) = changed {
			self.notify(&state);
		}
	}

	/// Forces or leaves offline mode.
	pub fn set_offline_mode(self: &Arc<Self>, offline: bool) {
		let changed = {
			let mut inner = self.inner.lock();
			if inner.stopped {
				return;
			}
			let changed = if offline {
				if let Some(task) = inner.reconnect_task.take() {
					task.abort();
				}
				inner.state.next_reconnect_at = None;
				transition(&mut inner.state, ConnectionStatus::Offline)
			} else if inner.state.status == ConnectionStatus::Offline {
				inner.state.failure_count = 0;
				transition(&mut inner.state, ConnectionStatus::Connecting)
			} else {
				false
			};
			changed.then(|| inner.state.clone())
		};

		let Some(state) = changed else {
			return;
		};

		info!(offline = offline, "offline mode changed");
		if !offline {
			Arc::clone(self).spawn_probe(Duration::ZERO);
		}
		self.notify(&state);
	}

	/// Replaces any pending reconnect with one that probes after `delay`.
	fn spawn_probe(self: Arc<Self>, delay: Duration) {
		let this = Arc::clone(&self);
		let mut inner = self.inner.lock();
		if inner.stopped {
			return;
		}
		if let Some(task) = inner.reconnect_task.take() {
			task.abort();
		}
		inner.reconnect_task = Some(tokio::spawn(async move {
			if !delay.is_zero() {
				tokio::time::sleep(delay).await;
			}
			this.run_probe().await;
		}));
	}

	async fn run_probe(self: Arc<Self>) {
		let probe = self.probe.read().clone();
		{
			let mut inner = self.inner.lock();
			inner.reconnect_task = None;
			if inner.stopped || inner.state.status == ConnectionStatus::Offline {
				return;
			}
			inner.probe_in_flight = true;
		}

		let outcome = match probe {
			Some(probe) => Some(probe.probe().await),
			None => None,
		};
		self.inner.lock().probe_in_flight = false;

		match outcome {
			Some(Ok(())) => self.report_success(),
			Some(Err(e)) => self.report_failure(&e),
			None => debug!("no connectivity probe installed"),
		}
	}

	/// Cancels all timers and drops listeners.
	pub fn stop(&self) {
		let mut inner = self.inner.lock();
		inner.stopped = true;
		if let Some(task) = inner.reconnect_task.take() {
			task.abort();
		}
		if let Some(task) = inner.heartbeat_task.take() {
			task.abort();
		}
		drop(inner);
		self.listeners.clear();
		debug!("connection monitor stopped");
	}

	/// Delivers the state captured by the transition that caused it.
	fn notify(&self, state: &ConnectionState) {
		self.listeners.notify(state);
	}
}

fn transition(state: &mut ConnectionState, to: ConnectionStatus) -> bool {
	if state.status == to {
		return false;
	}
	debug!(from = %state.status, to = %to, "connection status transition");
	state.status = to;
	true
}
