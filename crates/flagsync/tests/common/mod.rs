// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared helpers for the client integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use flagsync::{
	FlagsyncClient, FlagsyncClientBuilder, HttpRequest, HttpResponse, HttpTransport, MemoryStore,
	TransportError,
};
use parking_lot::Mutex;
use serde_json::Value;

pub const CONFIG_PATH: &str = "/api/sdk/config";
pub const EVENTS_PATH: &str = "/api/sdk/events";
pub const SUMMARIES_PATH: &str = "/api/sdk/summaries";

type Reply = Result<HttpResponse, TransportError>;

#[derive(Default)]
struct Route {
	queued: VecDeque<Reply>,
	fallback: Option<Reply>,
}

/// Answers by request path: queued replies first, then the path's fallback.
#[derive(Default)]
pub struct RouteTransport {
	routes: Mutex<HashMap<String, Route>>,
	requests: Mutex<Vec<HttpRequest>>,
}

impl RouteTransport {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn reply(&self, path: &str, response: HttpResponse) {
		self
			.routes
			.lock()
			.entry(path.to_string())
			.or_default()
			.queued
			.push_back(Ok(response));
	}

	pub fn always(&self, path: &str, reply: Reply) {
		self.routes.lock().entry(path.to_string()).or_default().fallback = Some(reply);
	}

	pub fn requests_to(&self, path: &str) -> Vec<HttpRequest> {
		self
			.requests
			.lock()
			.iter()
			.filter(|r| r.path == path)
			.cloned()
			.collect()
	}

	pub fn count(&self, path: &str) -> usize {
		self.requests_to(path).len()
	}
}

#[async_trait]
impl HttpTransport for RouteTransport {
	async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
		let path = request.path.clone();
		self.requests.lock().push(request);

		let mut routes = self.routes.lock();
		let Some(route) = routes.get_mut(&path) else {
			return Ok(HttpResponse::new(404));
		};
		if let Some(reply) = route.queued.pop_front() {
			return reply;
		}
		route
			.fallback
			.clone()
			.unwrap_or_else(|| Ok(HttpResponse::new(404)))
	}
}

pub fn json(status: u16, body: Value) -> HttpResponse {
	HttpResponse::new(status)
		.with_header("content-type", "application/json")
		.with_body(body.to_string())
}

/// A builder wired to `transport` with in-memory storage.
pub fn client_builder(transport: Arc<RouteTransport>) -> FlagsyncClientBuilder {
	FlagsyncClient::builder()
		.sdk_key("sdk_integration")
		.transport(transport)
		.store(Arc::new(MemoryStore::new()))
}

/// Decodes the JSON body of a recorded request.
pub fn body_json(request: &HttpRequest) -> Value {
	request
		.body
		.as_deref()
		.and_then(|body| serde_json::from_slice(body).ok())
		.unwrap_or(Value::Null)
}
