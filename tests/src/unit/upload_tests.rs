use super::{build_client, signed_in_store, test_runtime};
use futures::future::join_all;
use quire_core::mock::{MockReply, MockTransport};
use quire_core::transport::{Method, RequestBody};
use quire_core::upload::{LocalFile, UploadSubscription};
use quire_core::{TransferStatus, UploadUpdate};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

async fn finish(mut updates: UploadSubscription) -> Vec<UploadUpdate> {
    let mut all = Vec::new();
    while let Some(update) = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("upload update in time")
    {
        all.push(update);
    }
    all
}

#[test]
fn one_failing_transfer_does_not_disturb_the_others() {
    let runtime = test_runtime();
    let transport = MockTransport::new();
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = failed_once.clone();
    transport.route(Method::Post, "files/upload", move |request| {
        let name = match &request.body {
            RequestBody::File(part) => part.file_name.clone(),
            _ => String::new(),
        };
        if name == "broken.pdf" && !flag.swap(true, Ordering::SeqCst) {
            return MockReply::status(200)
                .with_progress(&[25, 50], Duration::from_millis(10))
                .fail_body("connection reset");
        }
        MockReply::json(200, json!({ "id": format!("remote-{name}"), "url": format!("https://files/{name}") }))
            .with_progress(&[20, 40, 60, 80, 100], Duration::from_millis(10))
    });
    let (client, notifier) = build_client(&transport, signed_in_store());

    let files = ["a.png", "broken.pdf", "c.mp3"].map(|name| {
        let mime = match name {
            "a.png" => "image/png",
            "broken.pdf" => "application/pdf",
            _ => "audio/mpeg",
        };
        LocalFile::new(name, mime, vec![1u8; 2048])
    });

    let (ids, outcomes) = runtime.block_on(async {
        let mut ids = Vec::new();
        let mut subscriptions = Vec::new();
        for file in files {
            let (id, updates) = client.upload_file(file).expect("admitted");
            ids.push(id);
            subscriptions.push(updates);
        }
        (ids, join_all(subscriptions.into_iter().map(finish)).await)
    });

    assert!(outcomes[1].contains(&UploadUpdate::Progress(50)));
    assert!(matches!(outcomes[1].last(), Some(UploadUpdate::Failed { .. })));
    for index in [0, 2] {
        let transfer = client.uploads().get(ids[index]).expect("tracked");
        assert_eq!(transfer.status, TransferStatus::Success);
        assert_eq!(transfer.progress, 100);
    }
    let broken = client.uploads().get(ids[1]).expect("tracked");
    assert_eq!(broken.status, TransferStatus::Failed);
    assert_eq!(broken.progress, -1);
    assert_eq!(notifier.notices().len(), 1);

    let retried = runtime.block_on(async { finish(client.retry_upload(ids[1]).expect("retry")).await });

    assert!(matches!(retried.last(), Some(UploadUpdate::Succeeded { remote_id, .. }) if remote_id == "remote-broken.pdf"));
    assert_eq!(
        client.uploads().completed_remote_ids(),
        vec!["remote-a.png", "remote-broken.pdf", "remote-c.mp3"]
    );
}

#[test]
fn upload_with_expired_token_is_sent_again_once() {
    let runtime = test_runtime();
    let transport = MockTransport::new();
    transport.route(Method::Post, "files/upload", |request| match request.bearer() {
        Some("a2") => MockReply::json(200, json!({ "id": "f", "url": "u/f" })),
        _ => MockReply::status(401),
    });
    transport.route(Method::Post, "auth/refresh", |_| {
        MockReply::json(200, json!({ "status": "success", "data": { "accessToken": "a2", "refreshToken": "r2" } }))
    });
    let (client, _) = build_client(&transport, signed_in_store());

    let updates = runtime.block_on(async {
        let (_, updates) = client
            .upload_file(LocalFile::new("doc.txt", "text/plain", "body"))
            .expect("admitted");
        finish(updates).await
    });

    assert!(matches!(updates.last(), Some(UploadUpdate::Succeeded { .. })));
    assert_eq!(transport.calls_to("files/upload"), 2);
    assert_eq!(transport.calls_to("auth/refresh"), 1);
    let calls = transport.calls();
    let uploads: Vec<_> = calls.iter().filter(|call| call.path == "files/upload").collect();
    assert!(uploads.iter().all(|call| call.file_name.as_deref() == Some("doc.txt")));
}
