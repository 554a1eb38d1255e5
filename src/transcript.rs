use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Therapist,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Role::Client => "CLIENT",
            Role::Therapist => "THERAPIST",
        }
    }

    fn counterpart(self) -> Role {
        match self {
            Role::Client => Role::Therapist,
            Role::Therapist => Role::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn client(content: impl Into<String>) -> Self {
        Self {
            role: Role::Client,
            content: content.into(),
        }
    }

    pub fn therapist(content: impl Into<String>) -> Self {
        Self {
            role: Role::Therapist,
            content: content.into(),
        }
    }

    /// Chat form used for both role agents: the client speaks as `user`,
    /// the therapist as `assistant`.
    pub fn to_chat_message(&self) -> ChatMessage {
        match self.role {
            Role::Client => ChatMessage::user(self.content.clone()),
            Role::Therapist => ChatMessage::assistant(self.content.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transcript out of order: expected a {expected} message at position {position}, got {actual}")]
pub struct TranscriptError {
    pub position: usize,
    pub expected: Role,
    pub actual: Role,
}

/// Conversation in speaking order. Always starts with the client and
/// alternates; `push` refuses anything else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Message>", into = "Vec<Message>")]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(turns: usize) -> Self {
        Self {
            messages: Vec::with_capacity(turns * 2),
        }
    }

    pub fn next_role(&self) -> Role {
        self.messages
            .last()
            .map(|message| message.role.counterpart())
            .unwrap_or(Role::Client)
    }

    pub fn push(&mut self, message: Message) -> Result<(), TranscriptError> {
        let expected = self.next_role();
        if message.role != expected {
            return Err(TranscriptError {
                position: self.messages.len(),
                expected,
                actual: message.role,
            });
        }
        self.messages.push(message);
        Ok(())
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Completed client/therapist pairs.
    pub fn turns(&self) -> usize {
        self.messages.len() / 2
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_chat_message).collect()
    }

    /// `CLIENT: ...` / `THERAPIST: ...` lines, newline separated.
    pub fn to_labeled_text(&self) -> String {
        self.messages
            .iter()
            .map(|message| format!("{}: {}", message.role.label(), message.content))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl TryFrom<Vec<Message>> for Transcript {
    type Error = TranscriptError;

    fn try_from(messages: Vec<Message>) -> Result<Self, Self::Error> {
        let mut transcript = Transcript::with_capacity(messages.len() / 2 + 1);
        for message in messages {
            transcript.push(message)?;
        }
        Ok(transcript)
    }
}

impl From<Transcript> for Vec<Message> {
    fn from(transcript: Transcript) -> Self {
        transcript.messages
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use crate::types::MessageRole;

    use super::{Message, Role, Transcript};

    #[test]
    fn accepts_alternating_messages_starting_with_client() {
        let mut transcript = Transcript::new();
        transcript.push(Message::client("hi")).unwrap();
        transcript.push(Message::therapist("hello")).unwrap();
        transcript.push(Message::client("again")).unwrap();

        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript.turns(), 1);
        assert_eq!(transcript.next_role(), Role::Therapist);
    }

    #[test]
    fn rejects_therapist_first_and_repeats() {
        let mut transcript = Transcript::new();
        let err = transcript.push(Message::therapist("too early")).unwrap_err();
        assert_eq!(err.position, 0);
        assert_eq!(err.expected, Role::Client);

        transcript.push(Message::client("one")).unwrap();
        let err = transcript.push(Message::client("two")).unwrap_err();
        assert_eq!(err.position, 1);
        assert_eq!(err.actual, Role::Client);
        assert_eq!(transcript.len(), 1);
    }

    #[test]
    fn labels_lines_for_scoring() {
        let mut transcript = Transcript::new();
        transcript.push(Message::client("I can't sleep.")).unwrap();
        transcript.push(Message::therapist("That sounds exhausting.")).unwrap();

        assert_eq!(
            transcript.to_labeled_text(),
            "CLIENT: I can't sleep.\nTHERAPIST: That sounds exhausting."
        );
        assert_eq!(Transcript::new().to_labeled_text(), "");
    }

    #[test]
    fn deserializing_enforces_alternation() {
        let ok = r#"[{"role":"client","content":"a"},{"role":"therapist","content":"b"}]"#;
        let transcript: Transcript = serde_json::from_str(ok).unwrap();
        assert_eq!(transcript.len(), 2);

        let bad = r#"[{"role":"therapist","content":"b"}]"#;
        assert!(serde_json::from_str::<Transcript>(bad).is_err());
    }

    #[test]
    fn maps_roles_to_chat_roles() {
        let mut transcript = Transcript::new();
        transcript.push(Message::client("a")).unwrap();
        transcript.push(Message::therapist("b")).unwrap();

        let chat = transcript.to_chat_messages();
        assert_eq!(chat[0].role, MessageRole::User);
        assert_eq!(chat[1].role, MessageRole::Assistant);
    }
}
