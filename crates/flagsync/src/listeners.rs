// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Ordered subscription lists for synchronous callbacks.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use crate::error::FlagsyncError;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
	fn next() -> Self {
		Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
	}
}

impl fmt::Display for ListenerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "listener-{}", self.0)
	}
}

pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Receives errors that components handled internally.
pub type ErrorHook = Arc<dyn Fn(&FlagsyncError) + Send + Sync>;

/// Callbacks invoked in registration order.
///
/// The lock is released before callbacks run, so a callback may register or
/// remove listeners. A panicking callback is logged and does not prevent
/// later callbacks from running.
pub struct ListenerRegistry<T> {
	name: &'static str,
	entries: RwLock<Vec<(ListenerId, Callback<T>)>>,
}

impl<T> ListenerRegistry<T> {
	pub fn new(name: &'static str) -> Self {
		Self {
			name,
			entries: RwLock::new(Vec::new()),
		}
	}

	pub fn add<F>(&self, callback: F) -> ListenerId
	where
		F: Fn(&T) + Send + Sync + 'static,
	{
		self.add_arc(Arc::new(callback))
	}

	pub fn add_arc(&self, callback: Callback<T>) -> ListenerId {
		let id = ListenerId::next();
		self.entries.write().push((id, callback));
		id
	}

	/// Returns false if `id` was not registered here.
	pub fn remove(&self, id: ListenerId) -> bool {
		let mut entries = self.entries.write();
		let before = entries.len();
		entries.retain(|(existing, _)| *existing != id);
		entries.len() != before
	}

	pub fn notify(&self, value: &T) {
		let callbacks: Vec<(ListenerId, Callback<T>)> = self.entries.read().clone();
		for (id, callback) in callbacks {
			invoke(self.name, id, &callback, value);
		}
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn clear(&self) {
		self.entries.write().clear();
	}
}

/// Runs one callback, containing any panic.
pub(crate) fn invoke<T>(registry: &str, id: ListenerId, callback: &Callback<T>, value: &T) {
	if catch_unwind(AssertUnwindSafe(|| callback(value))).is_err() {
		error!(registry = registry, listener = %id, "listener panicked");
	}
}

pub(crate) fn report_error(hook: Option<&ErrorHook>, err: &FlagsyncError) {
	if let Some(hook) = hook {
		if catch_unwind(AssertUnwindSafe(|| hook(err))).is_err() {
			error!(error = %err, "error hook panicked");
		}
	}
}
