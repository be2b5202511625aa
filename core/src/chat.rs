use crate::error::ClientError;
use crate::notify::{Notice, Notifier};
use crate::pipeline::{RequestPipeline, RequestSpec};
use crate::sse::{ContentMode, StreamDecoder, StreamEvent};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    fn wire(&self) -> Value {
        json!({ "role": self.role, "content": self.content })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    #[default]
    Idle,
    Sending,
    Streaming,
    Settled,
    Cancelled,
    Failed,
}

impl TurnStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatTurn {
    pub id: Uuid,
    pub request_id: Option<String>,
    /// The in-progress answer. Emptied when the turn settles, fails or is cancelled.
    pub accumulated_text: String,
    pub status: TurnStatus,
    pub error: Option<ClientError>,
}

/// Progress of one turn, delivered to the subscriber returned by [`ChatSession::send`].
/// Exactly one of `Done`, `Failed` or `Cancelled` ends the sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    Started { request_id: String },
    Delta { text: String },
    Done { message: ChatMessage },
    Failed { error: ClientError },
    Cancelled,
}

pub type ChatSubscription = UnboundedReceiver<ChatUpdate>;

#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub chat_path: String,
    pub stop_path: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub content_mode: ContentMode,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            chat_path: "llm/chat".to_string(),
            stop_path: "llm/stop".to_string(),
            model: "Qwen/Qwen2.5-7B-Instruct".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            content_mode: ContentMode::Cumulative,
        }
    }
}

struct LiveTurn {
    cancel: CancellationToken,
    updates: UnboundedSender<ChatUpdate>,
    prompt: Uuid,
}

#[derive(Default)]
struct SessionState {
    messages: Vec<ChatMessage>,
    turn: ChatTurn,
    live: Option<LiveTurn>,
}

impl SessionState {
    /// Ends the live turn. A turn that produced no answer takes its prompt
    /// out of the history, so a resend does not repeat it.
    fn end_without_answer(&mut self) -> Option<LiveTurn> {
        let live = self.live.take()?;
        self.messages.retain(|message| message.id != live.prompt);
        Some(live)
    }
}

/// Every mutation goes through the shared state keyed by turn id, so a
/// background stream of an older turn can never write into a newer one.
#[derive(Clone)]
pub struct ChatSession {
    state: Arc<RwLock<SessionState>>,
    pipeline: Arc<RequestPipeline>,
    notifier: Arc<dyn Notifier>,
    settings: ChatSettings,
}

impl ChatSession {
    pub fn new(pipeline: Arc<RequestPipeline>, settings: ChatSettings) -> Self {
        let notifier = pipeline.notifier().clone();
        Self {
            state: Arc::new(RwLock::new(SessionState::default())),
            pipeline,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.state.read().messages.clone()
    }

    pub fn turn(&self) -> ChatTurn {
        self.state.read().turn.clone()
    }

    /// Starts a turn for `text`. Must be called within a tokio runtime.
    pub fn send(&self, text: impl Into<String>) -> Result<ChatSubscription, ClientError> {
        let text = text.into();
        let content = text.trim();
        if content.is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let (tx, rx) = unbounded_channel();
        let cancel = CancellationToken::new();
        let (turn_id, body) = {
            let mut state = self.state.write();
            if state.turn.status.is_live() {
                return Err(ClientError::Busy);
            }
            let prompt = ChatMessage::new(MessageRole::User, content);
            let prompt_id = prompt.id;
            state.messages.push(prompt);
            let turn_id = Uuid::new_v4();
            state.turn = ChatTurn {
                id: turn_id,
                status: TurnStatus::Sending,
                ..ChatTurn::default()
            };
            state.live = Some(LiveTurn {
                cancel: cancel.clone(),
                updates: tx,
                prompt: prompt_id,
            });
            (turn_id, self.request_body(&state.messages))
        };
        info!(%turn_id, "sending chat turn");

        let session = self.clone();
        tokio::spawn(async move {
            session.drive(turn_id, body, cancel).await;
        });
        Ok(rx)
    }

    /// Stops the live turn: the local read ends at once and, when the server
    /// id is known, a stop request is sent in the background. Returns `false`
    /// when there was nothing to cancel.
    pub fn cancel(&self) -> bool {
        let (live, request_id, turn_id) = {
            let mut state = self.state.write();
            if !state.turn.status.is_live() {
                return false;
            }
            state.turn.status = TurnStatus::Cancelled;
            state.turn.accumulated_text.clear();
            (
                state.end_without_answer(),
                state.turn.request_id.clone(),
                state.turn.id,
            )
        };
        if let Some(live) = live {
            live.cancel.cancel();
            let _ = live.updates.send(ChatUpdate::Cancelled);
        }
        info!(%turn_id, "chat turn cancelled");
        match request_id {
            Some(request_id) => self.spawn_stop(json!({ "requestId": request_id })),
            None => debug!(%turn_id, "no request id yet, local abort only"),
        }
        true
    }

    /// Asks the server to stop every generation of this user. Best effort.
    pub async fn stop_all(&self) -> Result<(), ClientError> {
        self.pipeline
            .execute(RequestSpec::post_json(
                self.settings.stop_path.clone(),
                json!({ "stopAll": true }),
            ))
            .await
            .map(|_| ())
    }

    pub fn clear(&self) {
        self.cancel();
        let mut state = self.state.write();
        state.messages.clear();
        state.turn = ChatTurn::default();
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        json!({
            "messages": messages.iter().map(ChatMessage::wire).collect::<Vec<_>>(),
            "model": self.settings.model,
            "stream": true,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
        })
    }

    async fn drive(&self, turn_id: Uuid, body: Value, cancel: CancellationToken) {
        let spec = RequestSpec::post_json(self.settings.chat_path.clone(), body).streaming();
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            result = self.pipeline.execute(spec) => result,
        };
        let response = match response {
            Ok(response) => response,
            Err(err) => {
                self.fail(turn_id, err);
                return;
            }
        };

        let mut decoder = StreamDecoder::new(self.settings.content_mode);
        let mut stream = response.into_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            let events = match next {
                Some(Ok(chunk)) => decoder.feed(&chunk),
                Some(Err(err)) => decoder.fail(err.to_string()),
                None => decoder.finish(),
            };
            for event in events {
                if !self.apply(turn_id, event) {
                    return;
                }
            }
            if decoder.is_finished() {
                return;
            }
        }
    }

    fn apply(&self, turn_id: Uuid, event: StreamEvent) -> bool {
        let mut state = self.state.write();
        if state.turn.id != turn_id || !state.turn.status.is_live() {
            return false;
        }
        match event {
            StreamEvent::Start { request_id } => {
                debug!(%turn_id, %request_id, "stream started");
                state.turn.status = TurnStatus::Streaming;
                state.turn.request_id = Some(request_id.clone());
                emit(&state, ChatUpdate::Started { request_id });
                true
            }
            StreamEvent::Delta { text } => {
                state.turn.status = TurnStatus::Streaming;
                state.turn.accumulated_text.clone_from(&text);
                emit(&state, ChatUpdate::Delta { text });
                true
            }
            StreamEvent::Done => {
                let answer = std::mem::take(&mut state.turn.accumulated_text);
                let message = ChatMessage::new(MessageRole::Assistant, answer);
                state.messages.push(message.clone());
                state.turn.status = TurnStatus::Settled;
                if let Some(live) = state.live.take() {
                    let _ = live.updates.send(ChatUpdate::Done { message });
                }
                info!(%turn_id, "chat turn settled");
                false
            }
            StreamEvent::Error { message } => {
                drop(state);
                self.fail(turn_id, ClientError::Stream(message));
                false
            }
        }
    }

    fn fail(&self, turn_id: Uuid, err: ClientError) {
        let live = {
            let mut state = self.state.write();
            if state.turn.id != turn_id || !state.turn.status.is_live() {
                return;
            }
            state.turn.status = TurnStatus::Failed;
            state.turn.accumulated_text.clear();
            state.turn.error = Some(err.clone());
            state.end_without_answer()
        };
        warn!(%turn_id, %err, "chat turn failed");
        if !err.is_auth() {
            self.notifier.notify(Notice::error(err.user_message()));
        }
        if let Some(live) = live {
            let _ = live.updates.send(ChatUpdate::Failed { error: err });
        }
    }

    fn spawn_stop(&self, body: Value) {
        let pipeline = self.pipeline.clone();
        let spec = RequestSpec::post_json(self.settings.stop_path.clone(), body);
        tokio::spawn(async move {
            match pipeline.execute(spec).await {
                Ok(_) => debug!("server acknowledged stop request"),
                Err(err) => warn!(%err, "stop request failed"),
            }
        });
    }
}

fn emit(state: &SessionState, update: ChatUpdate) {
    if let Some(live) = &state.live {
        let _ = live.updates.send(update);
    }
}
