//! Streaming event types and utilities

use crate::types::{StopReason, Usage};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// Events emitted by a generation source during one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageEvent {
    /// Upstream accepted the request
    Start { model: String },
    /// Text content delta
    TextDelta { delta: String },
    /// Generation finished
    Done { stop_reason: StopReason, usage: Usage },
    /// Error occurred; nothing follows
    Error { message: String },
}

impl MessageEvent {
    /// Check if this is a terminal event (Done or Error)
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageEvent::Done { .. } | MessageEvent::Error { .. })
    }
}

/// A stream of message events
pub type MessageEventStream = Pin<Box<dyn Stream<Item = MessageEvent> + Send>>;

/// How one generation call ended, as seen by [`TextAccumulator`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// A `Done` event arrived
    Finished(StopReason),
    /// An `Error` event arrived
    Failed(String),
    /// The stream ended without a terminal event
    Interrupted,
}

/// Collects the text of one generation call from its events
#[derive(Debug, Default)]
pub struct TextAccumulator {
    text: String,
    usage: Usage,
    termination: Option<Termination>,
}

impl TextAccumulator {
    /// Create a new accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a streaming event and update the state.
    ///
    /// Events after the first terminal event are ignored.
    pub fn process_event(&mut self, event: &MessageEvent) {
        if self.termination.is_some() {
            return;
        }
        match event {
            MessageEvent::TextDelta { delta } => self.text.push_str(delta),
            MessageEvent::Done { stop_reason, usage } => {
                self.usage = usage.clone();
                self.termination = Some(Termination::Finished(*stop_reason));
            }
            MessageEvent::Error { message } => {
                self.termination = Some(Termination::Failed(message.clone()));
            }
            MessageEvent::Start { .. } => {}
        }
    }

    /// Text received so far
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.is_some()
    }

    /// Consume the accumulator; a stream that ended silently reports `Interrupted`.
    pub fn finish(self) -> (String, Termination) {
        let termination = self.termination.unwrap_or(Termination::Interrupted);
        (self.text, termination)
    }
}
