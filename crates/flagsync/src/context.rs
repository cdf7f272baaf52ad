// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Identity shared by every outgoing request: SDK key, user and session.

use std::sync::Arc;

use flagsync_common_http::HttpRequest;
use flagsync_core::{SessionId, UserContext};
use parking_lot::RwLock;
use serde_json::Value;

use crate::metadata::{collect_all, SharedMetadataProvider};
use crate::session::SessionManager;

pub const SESSION_HEADER: &str = "X-Session-Id";

pub struct SdkContext {
	sdk_key: String,
	user: RwLock<UserContext>,
	session: Arc<SessionManager>,
	metadata: Vec<SharedMetadataProvider>,
}

impl SdkContext {
	pub fn new(
		sdk_key: impl Into<String>,
		user: UserContext,
		session: Arc<SessionManager>,
		metadata: Vec<SharedMetadataProvider>,
	) -> Self {
		Self {
			sdk_key: sdk_key.into(),
			user: RwLock::new(user),
			session,
			metadata,
		}
	}

	pub fn session(&self) -> &Arc<SessionManager> {
		&self.session
	}

	pub fn session_id(&self) -> Option<SessionId> {
		self.session.session_id()
	}

	/// The user as configured by the application.
	pub fn user(&self) -> UserContext {
		self.user.read().clone()
	}

	/// The user with provider metadata merged into its attributes.
	pub fn user_with_metadata(&self) -> UserContext {
		let mut user = self.user();
		user.merge_attributes(collect_all(&self.metadata));
		user
	}

	pub fn set_user_id(&self, user_id: Option<String>) {
		self.user.write().user_id = user_id;
	}

	pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) {
		self.user.write().attributes.insert(key.into(), value.into());
	}

	/// Adds the authorization and session headers.
	pub fn authorize(&self, request: HttpRequest) -> HttpRequest {
		let request = request.header("Authorization", format!("Bearer {}", self.sdk_key));
		match self.session_id() {
			Some(id) => request.header(SESSION_HEADER, id.to_string()),
			None => request,
		}
	}
}
