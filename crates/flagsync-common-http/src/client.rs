// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Shared HTTP client with consistent User-Agent header.

use reqwest::{Client, ClientBuilder};

/// SDK name reported in the User-Agent and telemetry payloads.
pub const SDK_NAME: &str = "flagsync-rust";

/// SDK version reported in the User-Agent and telemetry payloads.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Creates a new HTTP client builder with the standard flagsync User-Agent header.
///
/// Use this when you need to customize the client (e.g., set timeout).
///
/// # Example
/// ```ignore
/// let client = flagsync_common_http::builder()
///     .timeout(Duration::from_secs(30))
///     .build()?;
/// ```
pub fn builder() -> ClientBuilder {
	Client::builder().user_agent(user_agent())
}

/// Returns the standard flagsync User-Agent string.
///
/// Format: `flagsync-rust/{version} ({os}-{arch})`
pub fn user_agent() -> String {
	format!(
		"{}/{} ({}-{})",
		SDK_NAME,
		SDK_VERSION,
		std::env::consts::OS,
		std::env::consts::ARCH
	)
}
