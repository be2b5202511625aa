use super::{build_client, signed_in_store, test_runtime};
use quire::DeltaPrinter;
use quire_core::chat::{ChatSession, ChatSettings, ChatSubscription};
use quire_core::mock::{sse_event, MockReply, MockTransport, SSE_DONE};
use quire_core::transport::{HttpRequest, Method};
use quire_core::upload::LocalFile;
use quire_core::{ChatUpdate, ClientError, TransferStatus, TurnStatus, UploadUpdate};
use serde_json::json;
use std::time::Duration;

fn last_user_message(request: &HttpRequest) -> String {
    request
        .json_body()
        .and_then(|body| body["messages"].as_array()?.last()?["content"].as_str().map(str::to_owned))
        .unwrap_or_default()
}

async fn collect(mut updates: ChatSubscription) -> Vec<ChatUpdate> {
    let mut all = Vec::new();
    while let Some(update) = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .expect("chat update in time")
    {
        all.push(update);
    }
    all
}

#[test]
fn hello_streams_into_a_settled_hi() {
    let runtime = test_runtime();
    let transport = MockTransport::new();
    transport.route(Method::Post, "llm/chat", |_| {
        MockReply::stream([
            sse_event(&json!({ "type": "start", "requestId": "r1" })),
            sse_event(&json!({ "content": "H" })),
            sse_event(&json!({ "content": "Hi" })),
            SSE_DONE.to_string(),
        ])
        .with_chunk_delay(Duration::from_millis(5))
    });
    let (client, notifier) = build_client(&transport, signed_in_store());

    let updates = runtime.block_on(async { collect(client.send_chat("hello").expect("send")).await });

    let mut printer = DeltaPrinter::default();
    let mut rendered = String::new();
    for update in &updates {
        if let ChatUpdate::Delta { text } = update {
            rendered.push_str(&printer.push(text));
        }
    }
    assert_eq!(rendered, "Hi");
    assert_eq!(
        updates.first(),
        Some(&ChatUpdate::Started {
            request_id: "r1".into()
        })
    );

    let turn = client.chat().turn();
    assert_eq!(turn.status, TurnStatus::Settled);
    assert!(turn.accumulated_text.is_empty());
    assert_eq!(turn.request_id.as_deref(), Some("r1"));
    let messages = client.chat().messages();
    assert_eq!(messages.last().map(|message| message.content.as_str()), Some("Hi"));
    assert!(notifier.notices().is_empty());
}

#[test]
fn expired_token_is_refreshed_before_the_stream_starts() {
    let runtime = test_runtime();
    let transport = MockTransport::new();
    transport.route(Method::Post, "llm/chat", |request| match request.bearer() {
        Some("a2") => MockReply::stream([sse_event(&json!({ "content": "fresh" })), SSE_DONE.to_string()]),
        _ => MockReply::status(401),
    });
    transport.route(Method::Post, "auth/refresh", |_| {
        MockReply::json(200, json!({ "status": "success", "data": { "accessToken": "a2", "refreshToken": "r2" } }))
    });
    let (client, _) = build_client(&transport, signed_in_store());

    let updates = runtime.block_on(async { collect(client.send_chat("hi").expect("send")).await });

    assert!(matches!(updates.last(), Some(ChatUpdate::Done { message }) if message.content == "fresh"));
    assert_eq!(transport.calls_to("auth/refresh"), 1);
    assert_eq!(transport.calls_to("llm/chat"), 2);
}

#[test]
fn unauthorized_after_refresh_fails_without_looping() {
    let runtime = test_runtime();
    let transport = MockTransport::new();
    transport.route(Method::Post, "llm/chat", |_| MockReply::status(401));
    transport.route(Method::Post, "auth/refresh", |_| {
        MockReply::json(200, json!({ "status": "success", "data": { "accessToken": "a2", "refreshToken": "r2" } }))
    });
    let (client, notifier) = build_client(&transport, signed_in_store());

    let updates = runtime.block_on(async { collect(client.send_chat("hi").expect("send")).await });

    assert_eq!(
        updates,
        vec![ChatUpdate::Failed {
            error: ClientError::AuthExpired
        }]
    );
    assert_eq!(transport.calls_to("auth/refresh"), 1);
    assert_eq!(transport.calls_to("llm/chat"), 2);
    assert_eq!(notifier.notices().len(), 1);
    assert_eq!(notifier.redirects(), 1);
    assert!(!client.auth().is_signed_in());
}

#[test]
fn cancelling_one_turn_leaves_other_work_alone() {
    let runtime = test_runtime();
    let transport = MockTransport::new();
    transport.route(Method::Post, "llm/chat", |request| {
        if last_user_message(request) == "long essay" {
            MockReply::stream([
                sse_event(&json!({ "type": "start", "requestId": "ra" })),
                sse_event(&json!({ "content": "Once" })),
            ])
            .hang_body()
        } else {
            MockReply::stream([
                sse_event(&json!({ "type": "start", "requestId": "rb" })),
                sse_event(&json!({ "content": "B" })),
                sse_event(&json!({ "content": "B done" })),
                SSE_DONE.to_string(),
            ])
            .with_chunk_delay(Duration::from_millis(20))
        }
    });
    transport.route(Method::Post, "llm/stop", |_| MockReply::json(200, json!({ "status": "ok" })));
    transport.route(Method::Post, "files/upload", |_| {
        MockReply::json(200, json!({ "id": "c", "url": "u/c" }))
            .with_progress(&[30, 60, 90], Duration::from_millis(20))
    });
    let (client, notifier) = build_client(&transport, signed_in_store());
    let other = ChatSession::new(client.pipeline().clone(), ChatSettings::default());

    runtime.block_on(async {
        let mut a = client.send_chat("long essay").expect("send a");
        let b = other.send("short answer").expect("send b");
        let (upload_id, c) = client
            .upload_file(LocalFile::new("c.txt", "text/plain", "contents"))
            .expect("upload c");

        while let Some(update) = a.recv().await {
            if matches!(update, ChatUpdate::Delta { .. }) {
                break;
            }
        }
        assert!(client.cancel_chat());
        assert_eq!(a.recv().await, Some(ChatUpdate::Cancelled));

        let b_updates = collect(b).await;
        assert!(matches!(b_updates.last(), Some(ChatUpdate::Done { message }) if message.content == "B done"));

        let mut c = c;
        let mut c_last = None;
        while let Some(update) = c.recv().await {
            c_last = Some(update);
        }
        assert!(matches!(c_last, Some(UploadUpdate::Succeeded { .. })));
        assert_eq!(
            client.uploads().get(upload_id).map(|transfer| transfer.status),
            Some(TransferStatus::Success)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    });

    assert_eq!(client.chat().turn().status, TurnStatus::Cancelled);
    assert_eq!(other.turn().status, TurnStatus::Settled);
    let stops: Vec<_> = transport
        .calls()
        .into_iter()
        .filter(|call| call.path == "llm/stop")
        .collect();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].body, Some(json!({ "requestId": "ra" })));
    assert!(notifier.notices().is_empty());
}
