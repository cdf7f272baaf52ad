// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Test doubles shared by the unit tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use flagsync_common_http::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use parking_lot::Mutex;

type Reply = Result<HttpResponse, TransportError>;

/// Replays queued replies in order, then repeats the fallback.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
	replies: Mutex<VecDeque<Reply>>,
	fallback: Mutex<Option<Reply>>,
	requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	pub(crate) fn reply(&self, response: HttpResponse) -> &Self {
		self.replies.lock().push_back(Ok(response));
		self
	}

	pub(crate) fn fail(&self, error: TransportError) -> &Self {
		self.replies.lock().push_back(Err(error));
		self
	}

	pub(crate) fn always(&self, reply: Reply) {
		*self.fallback.lock() = Some(reply);
	}

	pub(crate) fn requests(&self) -> Vec<HttpRequest> {
		self.requests.lock().clone()
	}

	pub(crate) fn request_count(&self) -> usize {
		self.requests.lock().len()
	}
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
	async fn request(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
		self.requests.lock().push(request);
		if let Some(reply) = self.replies.lock().pop_front() {
			return reply;
		}
		self
			.fallback
			.lock()
			.clone()
			.unwrap_or_else(|| Err(TransportError::Other("no scripted reply".to_string())))
	}
}

pub(crate) fn json_response(status: u16, body: serde_json::Value) -> HttpResponse {
	HttpResponse::new(status)
		.with_header("content-type", "application/json")
		.with_body(body.to_string())
}
