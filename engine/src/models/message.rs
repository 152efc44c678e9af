//! Streaming progress messages
//!
//! One JSON object per event is sent over the streaming transport and
//! mirrored into the log store. Oversized payloads are split into ordered
//! fragments carrying a `chunk: "i/n"` marker.

use serde::{Deserialize, Serialize};

/// Event type carried by a stream message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Start,
    Phase,
    Task,
    Play,
    Ok,
    Changed,
    Failed,
    Skipped,
    Output,
    Error,
    Complete,
}

/// Terminal outcome reported on a `complete` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Success,
    Error,
}

/// A single structured progress message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub event: EventType,

    pub message: String,

    /// Fragment marker `"<i>/<n>"`, present only when a message was split
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,

    /// Name of the task this message belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,

    /// Sequence number of the task this message belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_number: Option<u32>,

    /// Terminal status, set on `complete` messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CompletionStatus>,

    /// Process return code, set on `complete` messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_code: Option<i32>,
}

impl StreamMessage {
    /// Create a plain message of the given event type
    pub fn new(event: EventType, message: impl Into<String>) -> Self {
        Self {
            event,
            message: message.into(),
            chunk: None,
            task_name: None,
            task_number: None,
            status: None,
            return_code: None,
        }
    }

    /// Create a message attributed to a task
    pub fn for_task(
        event: EventType,
        message: impl Into<String>,
        task_name: impl Into<String>,
        task_number: u32,
    ) -> Self {
        Self {
            task_name: Some(task_name.into()),
            task_number: Some(task_number),
            ..Self::new(event, message)
        }
    }

    /// Create the terminal `complete` message
    pub fn complete(status: CompletionStatus, return_code: i32, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            return_code: Some(return_code),
            ..Self::new(EventType::Complete, message)
        }
    }

    /// Split this message into size-bounded frames.
    ///
    /// A payload within `limit` yields the message unchanged. Larger payloads
    /// are split into ordered fragments, each carrying a `"i/n"` chunk marker
    /// and the remaining fields of the original message.
    pub fn into_frames(self, limit: usize) -> Vec<StreamMessage> {
        let parts = chunk_payload(&self.message, limit);
        if parts.len() <= 1 {
            return vec![self];
        }
        let total = parts.len();
        parts
            .into_iter()
            .enumerate()
            .map(|(i, part)| StreamMessage {
                message: part,
                chunk: Some(format!("{}/{}", i + 1, total)),
                ..self.clone()
            })
            .collect()
    }
}

/// Split a payload into fragments of at most `limit` bytes.
///
/// Fragments break at line boundaries where possible; a single line longer
/// than the limit is split at UTF-8 character boundaries. Concatenating the
/// fragments in order reproduces the payload byte-for-byte. A `limit` of
/// zero disables chunking.
pub fn chunk_payload(payload: &str, limit: usize) -> Vec<String> {
    if limit == 0 || payload.len() <= limit {
        return vec![payload.to_string()];
    }

    let mut fragments = Vec::new();
    let mut current = String::new();

    for line in payload.split_inclusive('\n') {
        if line.len() > limit {
            // Flush whatever was accumulated, then split the long line
            // at character boundaries.
            if !current.is_empty() {
                fragments.push(std::mem::take(&mut current));
            }
            let mut rest = line;
            while !rest.is_empty() {
                let cut = floor_char_boundary(rest, limit.min(rest.len()));
                let (head, tail) = rest.split_at(cut);
                fragments.push(head.to_string());
                rest = tail;
            }
            continue;
        }

        if current.len() + line.len() > limit && !current.is_empty() {
            fragments.push(std::mem::take(&mut current));
        }
        current.push_str(line);
    }

    if !current.is_empty() {
        fragments.push(current);
    }

    fragments
}

/// Largest index `<= at` that falls on a character boundary
fn floor_char_boundary(s: &str, at: usize) -> usize {
    let mut idx = at;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    // A multi-byte character wider than the limit still has to move forward.
    if idx == 0 {
        idx = s
            .char_indices()
            .nth(1)
            .map(|(i, _)| i)
            .unwrap_or(s.len());
    }
    idx
}
