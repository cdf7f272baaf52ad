// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Bounded in-memory record queue backing each telemetry stream.
//!
//! The queue does no I/O. [`crate::telemetry::TelemetryQueue`] drains it,
//! sends the records, and hands back whatever could not be delivered.

use std::collections::{HashSet, VecDeque};

use flagsync_core::{QueuedRecord, RecordPayload};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::config::QueueConfig;

/// Result of pushing one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
	/// Stored; no flush needed yet.
	Queued,
	/// Stored, and the queue reached a full batch.
	FlushRequested,
	/// Stored after evicting this many of the oldest records.
	Evicted(usize),
	/// Dropped because a record with the same dedup key was already seen.
	Duplicate,
}

impl EnqueueOutcome {
	pub fn wants_flush(&self) -> bool {
		matches!(self, EnqueueOutcome::FlushRequested | EnqueueOutcome::Evicted(_))
	}
}

/// Counters for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
	/// Records currently waiting.
	pub queued: usize,
	pub sent: u64,
	/// Records lost to capacity or the storage budget.
	pub dropped: u64,
	pub failed_flushes: u64,
}

struct QueueInner<P> {
	records: VecDeque<QueuedRecord<P>>,
	seen: HashSet<String>,
	/// When the current records started waiting for a flush.
	waiting_since: Option<Instant>,
	/// `waiting_since` of the records taken by the flush in progress.
	draining_since: Option<Instant>,
	sent: u64,
	dropped: u64,
	failed_flushes: u64,
}

pub struct RecordQueue<P> {
	name: &'static str,
	config: QueueConfig,
	inner: Mutex<QueueInner<P>>,
}

impl<P: RecordPayload> RecordQueue<P> {
	pub fn new(name: &'static str, config: QueueConfig) -> Self {
		Self {
			name,
			config,
			inner: Mutex::new(QueueInner {
				records: VecDeque::new(),
				seen: HashSet::new(),
				waiting_since: None,
				draining_since: None,
				sent: 0,
				dropped: 0,
				failed_flushes: 0,
			}),
		}
	}

	pub fn config(&self) -> &QueueConfig {
		&self.config
	}

	pub fn push(&self, record: QueuedRecord<P>) -> EnqueueOutcome {
		let mut inner = self.inner.lock();

		if let Some(key) = record.dedup_key() {
			if !inner.seen.insert(key) {
				return EnqueueOutcome::Duplicate;
			}
		}

		let mut evicted = 0;
		while inner.records.len() >= self.config.capacity {
			inner.records.pop_front();
			evicted += 1;
		}
		inner.dropped += evicted as u64;

		if inner.records.is_empty() {
			inner.waiting_since = Some(Instant::now());
		}
		inner.records.push_back(record);

		if evicted > 0 {
			warn!(queue = self.name, evicted = evicted, "queue full, dropped oldest records");
			EnqueueOutcome::Evicted(evicted)
		} else if inner.records.len() >= self.config.max_batch_size {
			EnqueueOutcome::FlushRequested
		} else {
			EnqueueOutcome::Queued
		}
	}

	/// Removes and returns every queued record, oldest first.
	pub fn drain(&self) -> Vec<QueuedRecord<P>> {
		let mut inner = self.inner.lock();
		inner.draining_since = inner.waiting_since.take();
		inner.records.drain(..).collect()
	}

	/// Puts undelivered records back ahead of anything queued since the drain.
	///
	/// The result is capped at `max_stored`; the oldest records go first.
	/// Returns how many were dropped.
	pub fn requeue_front(&self, unsent: Vec<QueuedRecord<P>>) -> usize {
		let mut inner = self.inner.lock();
		for record in unsent.into_iter().rev() {
			inner.records.push_front(record);
		}
		if let Some(since) = inner.draining_since.take() {
			inner.waiting_since = Some(inner.waiting_since.map_or(since, |later| later.min(since)));
		}
		let dropped = Self::enforce_budget(&mut inner, self.config.max_stored);
		if dropped > 0 {
			warn!(queue = self.name, dropped = dropped, "storage budget exceeded, dropped oldest records");
		}
		dropped
	}

	/// Adds records loaded from storage ahead of the live queue.
	pub fn restore(&self, records: Vec<QueuedRecord<P>>) -> usize {
		let mut inner = self.inner.lock();
		for record in records.iter() {
			if let Some(key) = record.dedup_key() {
				inner.seen.insert(key);
			}
		}
		for record in records.into_iter().rev() {
			inner.records.push_front(record);
		}
		Self::enforce_budget(&mut inner, self.config.max_stored);
		if !inner.records.is_empty() && inner.waiting_since.is_none() {
			inner.waiting_since = Some(Instant::now());
		}
		inner.records.len()
	}

	fn enforce_budget(inner: &mut QueueInner<P>, max_stored: usize) -> usize {
		let mut dropped = 0;
		while inner.records.len() > max_stored {
			inner.records.pop_front();
			dropped += 1;
		}
		inner.dropped += dropped as u64;
		dropped
	}

	pub fn mark_sent(&self, count: usize) {
		self.inner.lock().sent += count as u64;
	}

	pub fn mark_flushed(&self) {
		self.inner.lock().draining_since = None;
	}

	pub fn mark_failed(&self) {
		self.inner.lock().failed_flushes += 1;
	}

	/// Whether a timer tick should flush: anything queued is sent every
	/// `flush_interval`, whatever happened to the previous flush.
	pub fn due_for_flush(&self) -> bool {
		!self.is_empty()
	}

	/// When the waiting records reach `flush_time` and must be flushed.
	pub fn flush_deadline(&self) -> Option<Instant> {
		let inner = self.inner.lock();
		if inner.records.is_empty() {
			return None;
		}
		inner.waiting_since.map(|since| since + self.config.flush_time)
	}

	/// Claims an overdue forced flush at `now`. The next one falls due
	/// `flush_time` later.
	pub fn claim_overdue(&self, now: Instant) -> bool {
		let mut inner = self.inner.lock();
		match inner.waiting_since {
			Some(since) if !inner.records.is_empty() && now.duration_since(since) >= self.config.flush_time => {
				inner.waiting_since = Some(now);
				true
			}
			_ => false,
		}
	}

	/// A copy of the queued records, oldest first.
	pub fn records(&self) -> Vec<QueuedRecord<P>> {
		self.inner.lock().records.iter().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.inner.lock().records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn stats(&self) -> QueueStats {
		let inner = self.inner.lock();
		QueueStats {
			queued: inner.records.len(),
			sent: inner.sent,
			dropped: inner.dropped,
			failed_flushes: inner.failed_flushes,
		}
	}
}
