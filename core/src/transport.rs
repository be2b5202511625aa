use crate::error::ClientError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;
use url::Url;

/// Upload bodies are handed to the socket in slices of this size so that
/// progress can be observed while the request is in flight.
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Json,
    Binary,
    /// `text/event-stream`; the body is handed over unread.
    Stream,
}

impl ResponseKind {
    pub fn accept(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Binary => "application/octet-stream",
            Self::Stream => "text/event-stream",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FilePart {
    pub field: String,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    File(FilePart),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub sent: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        let ratio = self.sent.min(self.total) as f64 / self.total as f64;
        (ratio * 100.0).round() as u8
    }
}

pub type ProgressSender = UnboundedSender<TransferProgress>;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path relative to the API base URL.
    pub path: String,
    pub bearer: Option<String>,
    pub accept: &'static str,
    pub body: RequestBody,
    pub progress: Option<ProgressSender>,
}

impl HttpRequest {
    pub fn bearer(&self) -> Option<&str> {
        self.bearer.as_deref()
    }

    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            RequestBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("timed out")]
    Timeout,
    #[error("body read failed: {0}")]
    Body(String),
    #[error("invalid request: {0}")]
    Request(String),
}

pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

enum ResponseBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    body: ResponseBody,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            ResponseBody::Buffered(bytes) => format!("{} bytes", bytes.len()),
            ResponseBody::Streaming(_) => "<stream>".to_string(),
        };
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("body", &body)
            .finish()
    }
}

impl HttpResponse {
    pub fn buffered(status: u16, content_type: Option<String>, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type,
            body: ResponseBody::Buffered(body.into()),
        }
    }

    pub fn streaming(status: u16, content_type: Option<String>, stream: ByteStream) -> Self {
        Self {
            status,
            content_type,
            body: ResponseBody::Streaming(stream),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body, if it has already been read into memory.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Buffered(bytes) => Some(bytes),
            ResponseBody::Streaming(_) => None,
        }
    }

    pub fn replace_body(&mut self, body: impl Into<Bytes>) {
        self.body = ResponseBody::Buffered(body.into());
    }

    pub async fn buffer(self) -> Result<Self, TransportError> {
        let status = self.status;
        let content_type = self.content_type.clone();
        let bytes = self.bytes().await?;
        Ok(Self::buffered(status, content_type, bytes))
    }

    pub async fn bytes(self) -> Result<Bytes, TransportError> {
        match self.body {
            ResponseBody::Buffered(bytes) => Ok(bytes),
            ResponseBody::Streaming(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    pub async fn text(self) -> Result<String, TransportError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn json<T: DeserializeOwned>(self) -> Result<T, ClientError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| ClientError::Decode(err.to_string()))
    }

    pub fn into_stream(self) -> ByteStream {
        match self.body {
            ResponseBody::Buffered(bytes) => {
                futures::stream::once(async move { Ok(bytes) }).boxed()
            }
            ResponseBody::Streaming(stream) => stream,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    base_url: Url,
}

impl ReqwestTransport {
    pub fn new(base_url: Url) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("quire/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: reqwest::Client, mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self { client, base_url }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| TransportError::Request(format!("bad path {path}: {err}")))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = self.url_for(&request.path)?;
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self
            .client
            .request(method, url)
            .header(ACCEPT, request.accept);
        if let Some(token) = request.bearer.as_deref() {
            builder = builder.bearer_auth(token);
        }
        builder = match request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::File(part) => builder.multipart(file_form(part, request.progress)?),
        };

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let stream = response
            .bytes_stream()
            .map_err(|err| TransportError::Body(err.to_string()))
            .boxed();
        Ok(HttpResponse::streaming(status, content_type, stream))
    }
}

fn file_form(part: FilePart, progress: Option<ProgressSender>) -> Result<Form, TransportError> {
    let total = part.bytes.len() as u64;
    let chunks: Vec<Bytes> = (0..part.bytes.len())
        .step_by(UPLOAD_CHUNK_BYTES)
        .map(|start| {
            let end = (start + UPLOAD_CHUNK_BYTES).min(part.bytes.len());
            part.bytes.slice(start..end)
        })
        .collect();
    let mut sent = 0u64;
    let body = futures::stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        if let Some(tx) = &progress {
            let _ = tx.send(TransferProgress { sent, total });
        }
        Ok::<Bytes, std::io::Error>(chunk)
    });
    let file = Part::stream_with_length(reqwest::Body::wrap_stream(body), total)
        .file_name(part.file_name)
        .mime_str(&part.mime_type)
        .map_err(|err| TransportError::Request(err.to_string()))?;
    Ok(Form::new().part(part.field, file))
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connect(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percentages_are_rounded_and_clamped() {
        assert_eq!(TransferProgress { sent: 0, total: 200 }.percent(), 0);
        assert_eq!(TransferProgress { sent: 101, total: 200 }.percent(), 51);
        assert_eq!(TransferProgress { sent: 250, total: 200 }.percent(), 100);
        assert_eq!(TransferProgress { sent: 0, total: 0 }.percent(), 100);
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let transport = ReqwestTransport::with_client(
            reqwest::Client::new(),
            Url::parse("https://notes.example.com/api").unwrap(),
        );
        let url = transport.url_for("/llm/chat").unwrap();
        assert_eq!(url.as_str(), "https://notes.example.com/api/llm/chat");
    }

    #[tokio::test]
    async fn streaming_bodies_collect_in_order() {
        let stream = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"{\"a\":")),
            Ok(Bytes::from_static(b"1}")),
        ])
        .boxed();
        let response = HttpResponse::streaming(200, None, stream);
        let value: Value = response.json().await.unwrap();
        assert_eq!(value["a"], 1);
    }
}
