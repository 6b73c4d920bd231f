//! Conversation history and continuation assembly

use stitch_ai::{Context, Message};

/// Directive appended as a user turn when a segment was cut off.
pub const CONTINUE_PROMPT: &str = "Continue your prior response. IMPORTANT: Immediately begin from where you left off without any interruptions.
Do not repeat any content, including artifact and action tags.";

/// The history of one request, append-only.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    context: Context,
}

impl Conversation {
    pub fn new(system_prompt: Option<String>, messages: Vec<Message>) -> Self {
        Self {
            context: Context {
                system_prompt,
                messages,
            },
        }
    }

    /// Append a message to the end of the history
    pub fn push(&mut self, message: Message) {
        self.context.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.context.messages
    }

    pub fn len(&self) -> usize {
        self.context.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.context.messages.is_empty()
    }

    /// The request context handed to a generation source
    pub fn context(&self) -> &Context {
        &self.context
    }
}

/// Extend `conversation` with the partial answer and the continuation directive.
pub fn assemble_continuation(mut conversation: Conversation, partial: &str) -> Conversation {
    conversation.push(Message::assistant(partial));
    conversation.push(Message::user(CONTINUE_PROMPT));
    conversation
}
