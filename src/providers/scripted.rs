use std::{collections::VecDeque, sync::Mutex, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;

use crate::{
    providers::LLMProvider,
    types::{CompletionRequest, CompletionResponse},
    LLMError,
};

/// One canned provider reply, optionally delayed.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub response: Result<String, String>,
    pub latency: Option<Duration>,
}

impl ScriptedTurn {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            response: Ok(text.into()),
            latency: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            response: Err(message.into()),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

/// Provider that replays queued replies in call order. Once the queue is
/// drained it answers with the fallback reply, or errors when none is set.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    fallback: Option<ScriptedTurn>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns<I>(turns: I) -> Self
    where
        I: IntoIterator<Item = ScriptedTurn>,
    {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn from_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_turns(replies.into_iter().map(ScriptedTurn::reply))
    }

    pub fn with_fallback(mut self, turn: ScriptedTurn) -> Self {
        self.fallback = Some(turn);
        self
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let queued = self
            .turns
            .lock()
            .ok()
            .and_then(|mut guard| guard.pop_front());
        queued.or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        if let Ok(mut guard) = self.requests.lock() {
            guard.push(request);
        }

        let turn = self
            .next_turn()
            .ok_or_else(|| LLMError::Provider("no more scripted responses".to_string()))?;

        if let Some(latency) = turn.latency {
            sleep(latency).await;
        }

        match turn.response {
            Ok(text) => Ok(CompletionResponse::from_text(text)),
            Err(message) => Err(LLMError::Provider(message)),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use crate::{providers::LLMProvider, types::CompletionRequest, LLMError};

    use super::{ScriptedProvider, ScriptedTurn};

    fn request() -> CompletionRequest {
        CompletionRequest::new("model", Vec::new())
    }

    #[tokio::test]
    async fn replays_in_order_then_errors() {
        let provider = ScriptedProvider::from_replies(["first", "second"]);

        let a = provider.complete(request()).await.unwrap();
        let b = provider.complete(request()).await.unwrap();
        assert_eq!(a.message.text(), Some("first"));
        assert_eq!(b.message.text(), Some("second"));

        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, LLMError::Provider(_)));
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn falls_back_once_drained() {
        let provider = ScriptedProvider::from_replies(["only"])
            .with_fallback(ScriptedTurn::reply("again"));

        provider.complete(request()).await.unwrap();
        let next = provider.complete(request()).await.unwrap();
        assert_eq!(next.message.text(), Some("again"));
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_provider_error() {
        let provider = ScriptedProvider::from_turns([ScriptedTurn::failure("boom")]);
        let err = provider.complete(request()).await.unwrap_err();
        assert!(matches!(err, LLMError::Provider(message) if message == "boom"));
    }
}
