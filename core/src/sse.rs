use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Start { request_id: String },
    /// Full answer text so far.
    Delta { text: String },
    Done,
    Error { message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentMode {
    /// Each payload carries the whole answer so far.
    #[default]
    Cumulative,
    /// Each payload carries only new text; the decoder appends it.
    Incremental,
}

/// Incremental decoder for a `data:`-framed event stream.
///
/// Bytes may be split anywhere, including inside a UTF-8 sequence; the
/// emitted events do not depend on where the splits fall. After the first
/// terminal event the decoder ignores further input.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    mode: ContentMode,
    pending: Vec<u8>,
    line: String,
    data: Vec<String>,
    answer: String,
    started: bool,
    finished: bool,
}

impl StreamDecoder {
    pub fn new(mode: ContentMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.pending.extend_from_slice(bytes);
        let text = self.take_decodable();
        self.push_text(&text, &mut events);
        events
    }

    /// Flushes buffered input at end of stream. Ends with `Done` unless a
    /// terminal event was already emitted.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        if !self.pending.is_empty() {
            let rest = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.push_text(&rest, &mut events);
        }
        if !self.finished && !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.handle_line(&line, &mut events);
        }
        if !self.finished && !self.data.is_empty() {
            self.dispatch(&mut events);
        }
        if !self.finished {
            self.finished = true;
            events.push(StreamEvent::Done);
        }
        events
    }

    /// Ends the session with an error (read failure, bad status). Emits
    /// nothing when the session already ended.
    pub fn fail(&mut self, message: impl Into<String>) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![StreamEvent::Error {
            message: message.into(),
        }]
    }

    /// Removes the longest prefix of `pending` that decodes, keeping an
    /// incomplete trailing sequence for the next feed. Invalid bytes become
    /// U+FFFD.
    fn take_decodable(&mut self) -> String {
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let keep = rest.to_vec();
        self.pending = keep;
        out
    }

    fn push_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        for ch in text.chars() {
            if self.finished {
                return;
            }
            if ch == '\n' {
                let line = std::mem::take(&mut self.line);
                self.handle_line(line.strip_suffix('\r').unwrap_or(&line), events);
            } else {
                self.line.push(ch);
            }
        }
    }

    fn handle_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                self.dispatch(events);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            let value = value.strip_prefix(' ').unwrap_or(value);
            self.data.push(value.to_string());
        }
        // `event:`, `id:` and `retry:` fields carry nothing this protocol uses.
    }

    fn dispatch(&mut self, events: &mut Vec<StreamEvent>) {
        let payload = self.data.join("\n");
        self.data.clear();
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            self.finished = true;
            events.push(StreamEvent::Done);
            return;
        }
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                self.finished = true;
                events.push(StreamEvent::Error {
                    message: format!("malformed stream payload: {err}"),
                });
                return;
            }
        };
        let kind = value.get("type").and_then(Value::as_str);

        if kind == Some("start") {
            if let Some(request_id) = value.get("requestId").and_then(Value::as_str) {
                if self.started || !self.answer.is_empty() {
                    debug!(request_id, "ignoring late start event");
                } else {
                    self.started = true;
                    events.push(StreamEvent::Start {
                        request_id: request_id.to_string(),
                    });
                }
                return;
            }
        }

        if let Some(message) = error_message(&value, kind) {
            self.finished = true;
            events.push(StreamEvent::Error { message });
            return;
        }

        if let Some(content) = content_of(&value) {
            if content.is_empty() {
                return;
            }
            match self.mode {
                ContentMode::Cumulative => {
                    self.answer.clear();
                    self.answer.push_str(content);
                }
                ContentMode::Incremental => self.answer.push_str(content),
            }
            events.push(StreamEvent::Delta {
                text: self.answer.clone(),
            });
        }
    }
}

fn content_of(value: &Value) -> Option<&str> {
    value
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .or_else(|| value.get("content").and_then(Value::as_str))
}

fn error_message(value: &Value, kind: Option<&str>) -> Option<String> {
    let error = value.get("error").filter(|err| !err.is_null());
    if kind != Some("error") && error.is_none() {
        return None;
    }
    let message = error
        .and_then(|err| err.get("message").or(Some(err)))
        .and_then(Value::as_str)
        .or_else(|| value.get("message").and_then(Value::as_str))
        .unwrap_or("stream reported an error");
    Some(message.to_string())
}
