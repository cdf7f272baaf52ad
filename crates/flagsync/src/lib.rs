// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flagsync client core.
//!
//! Keeps a local view of server-assigned configuration, a rotating session
//! identity and queued telemetry consistent with the flagsync service over an
//! unreliable network.
//!
//! # Features
//!
//! - **Config Sync**: conditional polling with `ETag` / `Last-Modified`, whole
//!   snapshot swaps, per-key and global change listeners
//! - **Telemetry**: bounded event and summary queues with batching, retry and
//!   persistence of undelivered records
//! - **Sessions**: time, background, authentication and manual rotation
//! - **Resilience**: retry with backoff inside per-operation circuit breakers,
//!   connection monitoring with jittered reconnects, offline mode
//!
//! # Example
//!
//! ```ignore
//! use flagsync::FlagsyncClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = FlagsyncClient::builder()
//!         .sdk_key("fs_sdk_xxx")
//!         .base_url("https://flags.example.com")
//!         .default_value("checkout.new_flow", false)
//!         .build()
//!         .await?;
//!
//!     client.on_change("checkout.new_flow", |change| {
//!         println!("{} is now {:?}", change.key, change.new);
//!     });
//!
//!     if client.get_bool("checkout.new_flow", false) {
//!         client.track("checkout_started", serde_json::Map::new())?;
//!     }
//!
//!     client.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod batch;
mod client;
mod config;
mod connection;
mod context;
mod error;
mod listeners;
mod metadata;
mod session;
mod storage;
mod sync;
mod telemetry;

#[cfg(test)]
mod testing;

pub use batch::{EnqueueOutcome, QueueStats, RecordQueue};
pub use client::{FlagsyncClient, FlagsyncClientBuilder};
pub use config::{ClientConfig, ConnectionConfig, Endpoints, PollingConfig, QueueConfig};
pub use connection::{reconnect_delay, ConnectionMonitor, ConnectivityProbe};
pub use context::{SdkContext, SESSION_HEADER};
pub use error::{ErrorKind, FlagsyncError, Result};
pub use listeners::{Callback, ErrorHook, ListenerId, ListenerRegistry};
pub use metadata::{collect_all, MetadataProvider, RuntimeMetadata, SharedMetadataProvider, StaticMetadata};
pub use session::SessionManager;
pub use storage::{
	FileStore, KeyValueStore, MemoryStore, SharedStore, ANONYMOUS_ID_KEY, EVENTS_KEY, SESSION_KEY,
	SNAPSHOT_KEY, SUMMARIES_KEY,
};
pub use sync::{flag_value, ConfigSyncManager, KeyChange, CONFIG_BREAKER_KEY};
pub use telemetry::{
	BatchPayload, BatchSender, HttpBatchSender, TelemetryPipeline, TelemetryQueue, EVENTS_BREAKER_KEY,
	SUMMARIES_BREAKER_KEY,
};

// Re-export the transport seam and resilience primitives
pub use flagsync_common_http::{
	CircuitBreakerConfig, CircuitSnapshot, CircuitState, HttpMethod, HttpRequest, HttpResponse,
	HttpTransport, ReqwestTransport, RetryConfig, SharedTransport, TransportError,
};

// Re-export core types for convenience
pub use flagsync_core::{
	ConfigChange, ConfigSnapshot, ConnectionState, ConnectionStatus, EventPayload, ExposureMetadata,
	QueuedRecord, RotationPolicy, RotationReason, SessionEvent, SessionId, SessionRecord,
	SummaryPayload, UserContext, ValidatorToken,
};
