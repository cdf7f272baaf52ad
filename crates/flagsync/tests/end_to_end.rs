// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! End-to-end tests against a mock HTTP server using the reqwest transport.

use std::sync::Arc;

use flagsync::{FlagsyncClient, FlagsyncError, MemoryStore, UserContext};
use serde_json::{json, Map, Value};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn start_server() -> MockServer {
	let server = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path("/api/sdk/config"))
		.and(header("authorization", "Bearer fs_sdk_e2e"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({
					"new_checkout": true,
					"max_items": 25
				}))
				.insert_header("ETag", "\"e2e-1\""),
		)
		.mount(&server)
		.await;

	Mock::given(method("POST"))
		.and(path("/api/sdk/events"))
		.and(header("content-type", "application/json"))
		.and(header_exists("x-session-id"))
		.respond_with(ResponseTemplate::new(202))
		.expect(1)
		.mount(&server)
		.await;

	server
}

#[tokio::test]
async fn client_fetches_config_and_delivers_events() {
	let server = start_server().await;

	let client = FlagsyncClient::builder()
		.sdk_key("fs_sdk_e2e")
		.base_url(format!("{}/", server.uri()))
		.store(Arc::new(MemoryStore::new()))
		.user(UserContext::anonymous("anon_e2e").with_user_id("user_e2e"))
		.build()
		.await
		.unwrap();

	assert!(client.get_bool("new_checkout", false));
	assert_eq!(client.get_json("max_items", json!(0)), json!(25));
	assert!(client.connection_state().is_connected());

	let mut properties = Map::new();
	properties.insert("items".into(), json!(3));
	client.track("checkout_completed", properties).unwrap();
	client.flush().await.unwrap();
	client.shutdown().await.unwrap();

	let requests = server.received_requests().await.unwrap();
	let events = requests
		.iter()
		.find(|r| r.url.path() == "/api/sdk/events")
		.unwrap();
	let body: Value = serde_json::from_slice(&events.body).unwrap();

	assert_eq!(body["user"]["user_id"], "user_e2e");
	assert_eq!(body["user"]["anonymous_id"], "anon_e2e");
	assert!(body["user"]["attributes"]["os"].is_string());
	assert_eq!(body["events"][0]["event_type"], "checkout_completed");
	assert_eq!(body["events"][0]["properties"]["items"], 3);
	assert!(body["events"][0]["session_id"].is_string());

	server.verify().await;
}

#[tokio::test]
async fn rejected_sdk_key_fails_build() {
	let server = MockServer::start().await;
	Mock::given(method("GET"))
		.and(path("/api/sdk/config"))
		.respond_with(ResponseTemplate::new(401))
		.expect(1)
		.mount(&server)
		.await;

	let result = FlagsyncClient::builder()
		.sdk_key("fs_sdk_revoked")
		.base_url(server.uri())
		.store(Arc::new(MemoryStore::new()))
		.build()
		.await;

	assert!(matches!(result, Err(FlagsyncError::AuthenticationFailed { status: 401 })));
}
