use super::{build_client, signed_in_store, test_runtime};
use futures::future::join_all;
use quire_core::credentials::{Credential, CredentialStore};
use quire_core::mock::{MockReply, MockTransport};
use quire_core::transport::Method;
use quire_core::{ClientError, RequestSpec};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

fn refresh_route(transport: &MockTransport, delay: Duration) {
    transport.route(Method::Post, "auth/refresh", move |_| {
        MockReply::json(200, json!({ "status": "success", "data": { "accessToken": "a2", "refreshToken": "r2" } }))
            .with_delay(delay)
    });
}

#[test]
fn concurrent_unauthorized_requests_share_one_refresh() {
    let runtime = test_runtime();
    let transport = MockTransport::new();
    transport.route(Method::Get, "notebooks", |request| match request.bearer() {
        Some("a2") => MockReply::json(200, json!({ "items": [] })),
        _ => MockReply::status(401).with_delay(Duration::from_millis(5)),
    });
    refresh_route(&transport, Duration::from_millis(40));
    let (client, notifier) = build_client(&transport, signed_in_store());

    let results = runtime.block_on(join_all(
        (0..6).map(|_| client.pipeline().execute(RequestSpec::get("notebooks"))),
    ));

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(transport.calls_to("auth/refresh"), 1);
    let replays: Vec<_> = transport
        .calls()
        .into_iter()
        .filter(|call| call.path == "notebooks" && call.bearer.as_deref() == Some("a2"))
        .collect();
    assert_eq!(replays.len(), 6);
    assert_eq!(
        client.pipeline().credentials().get(),
        Some(Credential::new("a2", "r2"))
    );
    assert!(notifier.notices().is_empty());
}

#[test]
fn failed_refresh_signs_out_once_for_every_waiter() {
    let runtime = test_runtime();
    let transport = MockTransport::new();
    transport.route(Method::Get, "notebooks", |_| MockReply::status(401));
    transport.route(Method::Post, "auth/refresh", |_| {
        MockReply::status(401).with_delay(Duration::from_millis(30))
    });
    let (client, notifier) = build_client(&transport, signed_in_store());

    let results = runtime.block_on(join_all(
        (0..3).map(|_| client.pipeline().execute(RequestSpec::get("notebooks"))),
    ));

    for result in results {
        assert_eq!(result.unwrap_err(), ClientError::AuthExpired);
    }
    assert_eq!(transport.calls_to("auth/refresh"), 1);
    assert!(!client.auth().is_signed_in());
    assert_eq!(notifier.notices().len(), 1);
    assert_eq!(notifier.redirects(), 1);
}

#[test]
fn credentials_survive_a_restart() {
    let runtime = test_runtime();
    let dir = TempDir::new().expect("temp dir");
    let transport = MockTransport::new();
    transport.route(Method::Post, "auth/login", |_| {
        MockReply::json(200, json!({ "status": "success", "data": { "accessToken": "a1", "refreshToken": "r1" } }))
    });
    transport.route(Method::Get, "auth/verify", |request| match request.bearer() {
        Some("a1") => MockReply::json(200, json!({ "status": "success", "data": { "user": { "email": "ada@example.com" } } })),
        _ => MockReply::status(401),
    });

    {
        let store = CredentialStore::open(dir.path()).expect("store");
        let (client, _) = build_client(&transport, store);
        runtime
            .block_on(client.auth().login("ada@example.com", "pw"))
            .expect("login");
    }

    let store = CredentialStore::open(dir.path()).expect("reopened store");
    let (client, _) = build_client(&transport, store);
    let user = runtime.block_on(client.auth().verify()).expect("verify");

    assert_eq!(user.and_then(|user| user.email).as_deref(), Some("ada@example.com"));
    assert_eq!(transport.calls_to("auth/refresh"), 0);
}

#[test]
fn already_setup_redirects_without_refresh() {
    let runtime = test_runtime();
    let transport = MockTransport::new();
    transport.route(Method::Post, "setup", |_| {
        MockReply::json(403, json!({ "code": "already_setup", "message": "done" }))
    });
    let (client, notifier) = build_client(&transport, signed_in_store());

    let err = runtime
        .block_on(client.pipeline().execute(RequestSpec::post_json("setup", json!({}))))
        .unwrap_err();

    assert_eq!(err, ClientError::SetupCompleted);
    assert!(!client.auth().is_signed_in());
    assert_eq!(notifier.notices().len(), 1);
    assert_eq!(notifier.redirects(), 1);
    assert_eq!(transport.calls_to("auth/refresh"), 0);
}
