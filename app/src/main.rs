use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use quire::{progress_line, DeltaPrinter, TerminalNotifier};
use quire_core::upload::{LocalFile, UploadSubscription};
use quire_core::{telemetry, ChatUpdate, ClientConfig, QuireClient, UploadUpdate};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Time given to the best-effort stop request before the process exits.
const STOP_GRACE: Duration = Duration::from_millis(300);

#[derive(Parser, Debug)]
#[command(name = "quire", version, about = "Talk to a Quire notebook server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and store the issued credentials.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Forget the stored credentials.
    Logout,
    /// Check the stored session with the server.
    Verify,
    /// Send one message and stream the answer. Ctrl-C stops it.
    Chat {
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Upload files concurrently. Ctrl-C cancels the ones still running.
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing(telemetry::default_filter())?;
    let cli = Cli::parse();

    let config = ClientConfig::load().map_err(|err| anyhow!(err.user_message()))?;
    let terminal = Arc::new(TerminalNotifier);
    let client = QuireClient::from_config(&config, terminal.clone(), terminal)?;

    match cli.command {
        Command::Login { email, password } => {
            let user = client
                .auth()
                .login(&email, &password)
                .await
                .map_err(|err| anyhow!(err.user_message()))?;
            if let Some(name) = user.and_then(|user| user.name.or(user.email)) {
                println!("Signed in as {name}.");
            }
        }
        Command::Logout => {
            client.auth().logout()?;
            println!("Signed out.");
        }
        Command::Verify => {
            if !client.auth().is_signed_in() {
                bail!("not signed in");
            }
            let user = client
                .auth()
                .verify()
                .await
                .map_err(|err| anyhow!(err.user_message()))?;
            match user.and_then(|user| user.email.or(user.name)) {
                Some(who) => println!("Session valid for {who}."),
                None => println!("Session valid."),
            }
        }
        Command::Chat { text } => chat(&client, text.join(" ")).await?,
        Command::Upload { files } => upload(&client, files).await?,
    }
    Ok(())
}

async fn chat(client: &QuireClient, text: String) -> anyhow::Result<()> {
    let mut updates = client
        .send_chat(text)
        .map_err(|err| anyhow!(err.user_message()))?;
    let mut printer = DeltaPrinter::default();
    let mut stdout = std::io::stdout();
    loop {
        let update = tokio::select! {
            update = updates.recv() => update,
            _ = tokio::signal::ctrl_c() => {
                client.cancel_chat();
                continue;
            }
        };
        match update {
            Some(ChatUpdate::Started { request_id }) => debug!(%request_id, "answer started"),
            Some(ChatUpdate::Delta { text }) => {
                write!(stdout, "{}", printer.push(&text))?;
                stdout.flush()?;
            }
            Some(ChatUpdate::Done { message }) => {
                write!(stdout, "{}", printer.push(&message.content))?;
                writeln!(stdout)?;
                return Ok(());
            }
            Some(ChatUpdate::Failed { error }) => {
                if !printer.shown().is_empty() {
                    writeln!(stdout)?;
                }
                bail!(error.user_message());
            }
            Some(ChatUpdate::Cancelled) => {
                writeln!(stdout)?;
                eprintln!("Stopped.");
                tokio::time::sleep(STOP_GRACE).await;
                return Ok(());
            }
            None => return Ok(()),
        }
    }
}

async fn upload(client: &QuireClient, paths: Vec<PathBuf>) -> anyhow::Result<()> {
    let mut started: Vec<(String, Uuid, UploadSubscription)> = Vec::new();
    for path in paths {
        let file = LocalFile::from_path(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let name = file.name.clone();
        // Rejections were already reported by the notifier.
        if let Ok((id, updates)) = client.upload_file(file) {
            started.push((name, id, updates));
        }
    }
    let ids: Vec<Uuid> = started.iter().map(|(_, id, _)| *id).collect();
    let watchers = join_all(
        started
            .into_iter()
            .map(|(name, _, updates)| watch_upload(name, updates)),
    );
    tokio::pin!(watchers);

    let outcomes = tokio::select! {
        outcomes = &mut watchers => outcomes,
        _ = tokio::signal::ctrl_c() => {
            for id in &ids {
                client.cancel_upload(*id);
            }
            watchers.await
        }
    };

    let failed = outcomes.iter().filter(|ok| !**ok).count();
    let ids = client.uploads().completed_remote_ids();
    if !ids.is_empty() {
        println!("Uploaded: {}", ids.join(", "));
    }
    if failed > 0 {
        bail!("{failed} upload(s) failed");
    }
    Ok(())
}

async fn watch_upload(name: String, mut updates: UploadSubscription) -> bool {
    let mut ok = false;
    while let Some(update) = updates.recv().await {
        match update {
            UploadUpdate::CancelHandle => debug!(file = %name, "upload started"),
            UploadUpdate::Progress(percent) => eprintln!("{}", progress_line(&name, percent)),
            UploadUpdate::Succeeded { url, .. } => {
                eprintln!("{} -> {url}", progress_line(&name, 100));
                ok = true;
            }
            UploadUpdate::Failed { error } => eprintln!("{name}: {}", error.user_message()),
        }
    }
    ok
}
