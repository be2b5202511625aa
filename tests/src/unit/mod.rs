mod auth_tests;
mod chat_tests;
mod upload_tests;

use quire_core::credentials::{Credential, CredentialStore};
use quire_core::mock::{MockTransport, RecordingNotifier};
use quire_core::pipeline::{PipelineSettings, RetryPolicy};
use quire_core::{ClientConfig, QuireClient};
use std::sync::Arc;
use std::time::Duration;

fn test_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::with_base_url("http://quire.test/api/".parse().expect("url"));
    config.pipeline = PipelineSettings {
        timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            backoff: Duration::from_millis(5),
            ..RetryPolicy::default()
        },
    };
    config
}

fn signed_in_store() -> CredentialStore {
    let store = CredentialStore::in_memory();
    store.set(Credential::new("a1", "r1")).expect("seed credential");
    store
}

fn build_client(
    transport: &MockTransport,
    store: CredentialStore,
) -> (QuireClient, RecordingNotifier) {
    let notifier = RecordingNotifier::default();
    let client = QuireClient::new(
        &test_config(),
        store,
        Arc::new(transport.clone()),
        Arc::new(notifier.clone()),
        Arc::new(notifier.clone()),
    );
    (client, notifier)
}
