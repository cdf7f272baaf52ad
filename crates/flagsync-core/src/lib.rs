// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the flagsync client.
//!
//! This crate holds the plain data model shared by the SDK components:
//! configuration snapshots and their diff, session records and the rotation
//! policy, queued telemetry records with their wire shapes, connection state
//! and the user context. It performs no I/O.

pub mod connection;
pub mod error;
pub mod record;
pub mod session;
pub mod snapshot;
pub mod user;

pub use connection::{ConnectionState, ConnectionStatus};
pub use error::{CoreError, Result};
pub use record::{
	EventPayload, EventWire, EventsBatch, ExposureMetadata, QueuedRecord, RecordPayload,
	SummariesBatch, SummaryPayload, SummaryWire,
};
pub use session::{RotationPolicy, RotationReason, SessionEvent, SessionId, SessionRecord};
pub use snapshot::{ConfigChange, ConfigSnapshot, ValidatorToken};
pub use user::UserContext;
