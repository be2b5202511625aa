use anyhow::{bail, ensure, Result};
use clap::{Parser, Subcommand};
use quire_core::credentials::CredentialStore;
use quire_core::mock::{sse_event, MockReply, MockTransport, SSE_DONE};
use quire_core::transport::Method;
use quire_core::upload::LocalFile;
use quire_core::{telemetry, ChatUpdate, ClientConfig, QuireClient, TracingNotifier, UploadUpdate};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Quire")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run login, an expired-token chat turn and an upload against a scripted backend.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn scripted_backend() -> MockTransport {
    let transport = MockTransport::new();
    transport.route(Method::Post, "auth/login", |_| {
        MockReply::json(
            200,
            json!({ "status": "success", "data": { "accessToken": "a1", "refreshToken": "r1", "user": { "email": "smoke@quire.dev" } } }),
        )
    });
    transport.route(Method::Post, "auth/refresh", |_| {
        MockReply::json(200, json!({ "status": "success", "data": { "accessToken": "a2", "refreshToken": "r2" } }))
    });
    // The first access token is already expired server side.
    transport.route(Method::Post, "llm/chat", |request| match request.bearer() {
        Some("a2") => MockReply::stream([
            sse_event(&json!({ "type": "start", "requestId": "smoke-1" })),
            sse_event(&json!({ "content": "pong" })),
            SSE_DONE.to_string(),
        ])
        .with_chunk_delay(Duration::from_millis(10)),
        _ => MockReply::status(401),
    });
    transport.route(Method::Post, "files/upload", |_| {
        MockReply::json(200, json!({ "id": "file-1", "url": "https://files.quire.dev/file-1" }))
            .with_progress(&[25, 50, 75, 100], Duration::from_millis(10))
    });
    transport
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;
    let transport = scripted_backend();
    let config = ClientConfig::with_base_url("http://quire.invalid/api/".parse()?);
    let client = QuireClient::new(
        &config,
        CredentialStore::open(temp_dir.path())?,
        Arc::new(transport.clone()),
        Arc::new(TracingNotifier),
        Arc::new(TracingNotifier),
    );

    runtime.block_on(async {
        client.auth().login("smoke@quire.dev", "secret").await?;

        let mut updates = client.send_chat("ping from xtask")?;
        let mut answer = None;
        while let Some(update) = updates.recv().await {
            match update {
                ChatUpdate::Done { message } => answer = Some(message.content),
                ChatUpdate::Failed { error } => bail!("chat failed: {error}"),
                _ => {}
            }
        }
        ensure!(answer.as_deref() == Some("pong"), "unexpected answer {answer:?}");

        let (_, mut progress) =
            client.upload_file(LocalFile::new("notes.txt", "text/plain", "smoke test"))?;
        while let Some(update) = progress.recv().await {
            if let UploadUpdate::Failed { error } = update {
                bail!("upload failed: {error}");
            }
        }
        Ok(())
    })?;

    let credential = CredentialStore::open(temp_dir.path())?.get();
    ensure!(
        credential.map(|credential| credential.access_token).as_deref() == Some("a2"),
        "refreshed credential was not persisted"
    );
    info!(
        refreshes = client.pipeline().refresh_coordinator().exchanges(),
        uploaded = ?client.uploads().completed_remote_ids(),
        calls = transport.calls().len(),
        "smoke test passed"
    );
    Ok(())
}
