//! In-process stand-ins for the network and the front end, used by tests and
//! by `cargo xtask smoke`.

use crate::error::ClientError;
use crate::notify::{LoginRedirect, Notice, Notifier};
use crate::transport::{
    ByteStream, HttpRequest, HttpResponse, Method, RequestBody, Transport, TransferProgress,
    TransportError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

pub fn sse_event(payload: &Value) -> String {
    format!("data: {payload}\n\n")
}

pub const SSE_DONE: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone)]
enum Failure {
    Connect(String),
    Timeout,
}

#[derive(Debug, Clone)]
enum Tail {
    End,
    Fail(String),
    Hang,
}

#[derive(Debug, Clone)]
pub struct MockReply {
    status: u16,
    content_type: Option<String>,
    chunks: Vec<Bytes>,
    delay: Duration,
    chunk_delay: Duration,
    progress: Vec<u8>,
    progress_delay: Duration,
    failure: Option<Failure>,
    stall: bool,
    tail: Tail,
}

impl MockReply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: None,
            chunks: Vec::new(),
            delay: Duration::ZERO,
            chunk_delay: Duration::ZERO,
            progress: Vec::new(),
            progress_delay: Duration::ZERO,
            failure: None,
            stall: false,
            tail: Tail::End,
        }
    }

    pub fn json(status: u16, body: Value) -> Self {
        let mut reply = Self::status(status);
        reply.content_type = Some("application/json".to_string());
        reply.chunks = vec![Bytes::from(body.to_string())];
        reply
    }

    /// An event-stream body delivered as the given chunks, in order.
    pub fn stream<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Vec<u8>>,
    {
        let mut reply = Self::status(200);
        reply.content_type = Some("text/event-stream".to_string());
        reply.chunks = chunks
            .into_iter()
            .map(|chunk| Bytes::from(chunk.into()))
            .collect();
        reply
    }

    pub fn connect_error(message: impl Into<String>) -> Self {
        let mut reply = Self::status(0);
        reply.failure = Some(Failure::Connect(message.into()));
        reply
    }

    pub fn timeout() -> Self {
        let mut reply = Self::status(0);
        reply.failure = Some(Failure::Timeout);
        reply
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Upload progress percentages reported before the response is produced.
    pub fn with_progress(mut self, steps: &[u8], step_delay: Duration) -> Self {
        self.progress = steps.to_vec();
        self.progress_delay = step_delay;
        self
    }

    /// Never produce a response head (after any progress steps).
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }

    /// Fail the body read once all chunks were delivered.
    pub fn fail_body(mut self, message: impl Into<String>) -> Self {
        self.tail = Tail::Fail(message.into());
        self
    }

    /// Keep the body open forever once all chunks were delivered.
    pub fn hang_body(mut self) -> Self {
        self.tail = Tail::Hang;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
    pub body: Option<Value>,
    pub file_name: Option<String>,
}

type Handler = Arc<dyn Fn(&HttpRequest) -> MockReply + Send + Sync>;

#[derive(Default)]
struct MockState {
    routes: RwLock<HashMap<(Method, String), Handler>>,
    calls: Mutex<Vec<RecordedCall>>,
}

/// Route table of handlers that script the backend. Unrouted calls get a 404.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F>(&self, method: Method, path: &str, handler: F) -> &Self
    where
        F: Fn(&HttpRequest) -> MockReply + Send + Sync + 'static,
    {
        self.state
            .routes
            .write()
            .insert((method, path.to_string()), Arc::new(handler));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.state
            .calls
            .lock()
            .iter()
            .filter(|call| call.path == path)
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let (body, file_name) = match &request.body {
            RequestBody::Empty => (None, None),
            RequestBody::Json(value) => (Some(value.clone()), None),
            RequestBody::File(part) => (None, Some(part.file_name.clone())),
        };
        self.state.calls.lock().push(RecordedCall {
            method: request.method,
            path: request.path.clone(),
            bearer: request.bearer.clone(),
            body,
            file_name,
        });

        let handler = self
            .state
            .routes
            .read()
            .get(&(request.method, request.path.clone()))
            .cloned();
        let reply = match handler {
            Some(handler) => handler(&request),
            None => MockReply::status(404),
        };

        if !reply.delay.is_zero() {
            sleep(reply.delay).await;
        }
        if let Some(tx) = &request.progress {
            for percent in &reply.progress {
                if !reply.progress_delay.is_zero() {
                    sleep(reply.progress_delay).await;
                }
                let _ = tx.send(TransferProgress {
                    sent: u64::from(*percent),
                    total: 100,
                });
            }
        }
        match reply.failure {
            Some(Failure::Connect(message)) => return Err(TransportError::Connect(message)),
            Some(Failure::Timeout) => return Err(TransportError::Timeout),
            None => {}
        }
        if reply.stall {
            futures::future::pending::<()>().await;
        }

        let chunk_delay = reply.chunk_delay;
        let body = stream::iter(reply.chunks).then(move |chunk| async move {
            if !chunk_delay.is_zero() {
                sleep(chunk_delay).await;
            }
            Ok::<Bytes, TransportError>(chunk)
        });
        let tail: ByteStream = match reply.tail {
            Tail::End => stream::empty().boxed(),
            Tail::Fail(message) => {
                stream::once(async move { Err(TransportError::Body(message)) }).boxed()
            }
            Tail::Hang => stream::pending().boxed(),
        };
        Ok(HttpResponse::streaming(
            reply.status,
            reply.content_type,
            body.chain(tail).boxed(),
        ))
    }
}

/// Front-end double that records notices and login redirects.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    notices: Arc<Mutex<Vec<Notice>>>,
    redirects: Arc<AtomicUsize>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    pub fn redirects(&self) -> usize {
        self.redirects.load(Ordering::SeqCst)
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}

impl LoginRedirect for RecordingNotifier {
    fn redirect_to_login(&self, _reason: &ClientError) {
        self.redirects.fetch_add(1, Ordering::SeqCst);
    }
}
