// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! The HTTP seam used by the SDK core.
//!
//! The core never talks to `reqwest` directly; it builds [`HttpRequest`]s
//! and hands them to an [`HttpTransport`]. [`ReqwestTransport`] is the
//! production implementation, tests substitute scripted transports.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use thiserror::Error;
use tracing::debug;

use crate::circuit::CircuitFailure;
use crate::retry::RetryableError;

/// Default per-request timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
	Get,
	Post,
	Head,
}

impl fmt::Display for HttpMethod {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HttpMethod::Get => write!(f, "GET"),
			HttpMethod::Post => write!(f, "POST"),
			HttpMethod::Head => write!(f, "HEAD"),
		}
	}
}

/// A request relative to the transport's base URL.
#[derive(Debug, Clone)]
pub struct HttpRequest {
	pub method: HttpMethod,
	pub path: String,
	pub headers: Vec<(String, String)>,
	pub body: Option<Vec<u8>>,
	pub timeout: Duration,
}

impl HttpRequest {
	pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
		Self {
			method,
			path: path.into(),
			headers: Vec::new(),
			body: None,
			timeout: DEFAULT_TIMEOUT,
		}
	}

	pub fn get(path: impl Into<String>) -> Self {
		Self::new(HttpMethod::Get, path)
	}

	pub fn post(path: impl Into<String>) -> Self {
		Self::new(HttpMethod::Post, path)
	}

	pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.headers.push((name.into(), value.into()));
		self
	}

	/// Sets a JSON body and the matching content type.
	pub fn json_body(mut self, body: Vec<u8>) -> Self {
		self.body = Some(body);
		self.header("Content-Type", "application/json")
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	/// Returns the first header value with the given name, ignoring case.
	pub fn header_value(&self, name: &str) -> Option<&str> {
		self
			.headers
			.iter()
			.find(|(k, _)| k.eq_ignore_ascii_case(name))
			.map(|(_, v)| v.as_str())
	}
}

#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
	pub status: u16,
	/// Header names are stored lowercase.
	pub headers: HashMap<String, String>,
	pub body: Vec<u8>,
}

impl HttpResponse {
	pub fn new(status: u16) -> Self {
		Self {
			status,
			..Self::default()
		}
	}

	pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
		self.headers.insert(name.to_ascii_lowercase(), value.into());
		self
	}

	pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
		self.body = body.into();
		self
	}

	pub fn header(&self, name: &str) -> Option<&str> {
		self
			.headers
			.get(&name.to_ascii_lowercase())
			.map(String::as_str)
	}

	pub fn is_success(&self) -> bool {
		(200..300).contains(&self.status)
	}

	pub fn is_not_modified(&self) -> bool {
		self.status == 304
	}

	pub fn body_text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}
}

/// Failures below the HTTP layer: the request never produced a status.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
	#[error("request timed out: {0}")]
	Timeout(String),

	#[error("connection failed: {0}")]
	Connect(String),

	#[error("invalid request: {0}")]
	InvalidRequest(String),

	#[error("transport error: {0}")]
	Other(String),
}

impl From<reqwest::Error> for TransportError {
	fn from(err: reqwest::Error) -> Self {
		if err.is_timeout() {
			TransportError::Timeout(err.to_string())
		} else if err.is_connect() {
			TransportError::Connect(err.to_string())
		} else if err.is_builder() {
			TransportError::InvalidRequest(err.to_string())
		} else {
			TransportError::Other(err.to_string())
		}
	}
}

impl RetryableError for TransportError {
	fn is_retryable(&self) -> bool {
		!matches!(self, TransportError::InvalidRequest(_))
	}
}

impl CircuitFailure for TransportError {
	fn is_service_failure(&self) -> bool {
		!matches!(self, TransportError::InvalidRequest(_))
	}
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
	async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

pub type SharedTransport = Arc<dyn HttpTransport>;

/// [`HttpTransport`] backed by a `reqwest` client rooted at a base URL.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
	client: Client,
	base_url: String,
}

impl ReqwestTransport {
	pub fn new(client: Client, base_url: impl Into<String>) -> Self {
		let base_url = base_url.into().trim_end_matches('/').to_string();
		Self { client, base_url }
	}

	/// Builds a transport with the standard flagsync User-Agent.
	pub fn from_base_url(base_url: impl Into<String>) -> Result<Self, TransportError> {
		let client = crate::client::builder().build()?;
		Ok(Self::new(client, base_url))
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}

	fn url(&self, path: &str) -> String {
		if path.starts_with('/') {
			format!("{}{}", self.base_url, path)
		} else {
			format!("{}/{}", self.base_url, path)
		}
	}
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
	async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
		let url = self.url(&request.path);
		let method = match request.method {
			HttpMethod::Get => reqwest::Method::GET,
			HttpMethod::Post => reqwest::Method::POST,
			HttpMethod::Head => reqwest::Method::HEAD,
		};

		let mut builder = self
			.client
			.request(method, &url)
			.timeout(request.timeout);
		for (name, value) in &request.headers {
			builder = builder.header(name.as_str(), value.as_str());
		}
		if let Some(body) = request.body {
			builder = builder.body(body);
		}

		debug!(method = %request.method, url = %url, "sending request");

		let response = builder.send().await?;
		let status = response.status().as_u16();
		let headers = response
			.headers()
			.iter()
			.filter_map(|(name, value)| {
				value
					.to_str()
					.ok()
					.map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
			})
			.collect();
		let body = response.bytes().await?.to_vec();

		debug!(url = %url, status = status, bytes = body.len(), "received response");

		Ok(HttpResponse {
			status,
			headers,
			body,
		})
	}
}
