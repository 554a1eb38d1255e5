use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time;
use tracing::{debug, warn};

use crate::{
    config::EvalConfig,
    persona::Persona,
    phase::TurnPhase,
    transcript::{Role, Transcript},
    types::{ChatMessage, CompletionRequest, Sampling},
    LLMError, LLMProvider,
};

pub const CLIENT_FILLER: &str = "I'm not sure how to express what I'm feeling right now.";
pub const THERAPIST_FILLER: &str =
    "I'm here to support you. Could you tell me more about what you're experiencing?";

const CLIENT_CUE: &str = "(You think about what to share and then respond as the client)";

/// Everything a role agent may look at when producing its next line.
#[derive(Debug, Clone, Copy)]
pub struct TurnContext<'a> {
    pub persona: &'a Persona,
    pub transcript: &'a Transcript,
    pub turn_index: usize,
    pub phase: TurnPhase,
}

impl<'a> TurnContext<'a> {
    pub fn new(persona: &'a Persona, transcript: &'a Transcript, turn_index: usize) -> Self {
        Self {
            persona,
            transcript,
            turn_index,
            phase: TurnPhase::for_turn(turn_index),
        }
    }
}

/// One side of a simulated session. Implementations never fail: any
/// provider problem is absorbed and replaced with a filler line.
#[async_trait]
pub trait RoleAgent: Send + Sync {
    fn role(&self) -> Role;

    async fn produce(&self, context: TurnContext<'_>) -> String;
}

/// Sends one completion under `timeout` and returns the trimmed text.
pub(crate) async fn complete_text(
    provider: &dyn LLMProvider,
    request: CompletionRequest,
    timeout: Duration,
) -> Result<String, LLMError> {
    let response = time::timeout(timeout, provider.complete(request))
        .await
        .map_err(|_| LLMError::Timeout(timeout))??;

    Ok(response
        .message
        .text()
        .map(str::trim)
        .unwrap_or_default()
        .to_string())
}

pub struct ClientSimulator {
    provider: Arc<dyn LLMProvider>,
    model: String,
    sampling: Sampling,
    timeout: Duration,
}

impl fmt::Debug for ClientSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSimulator")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("sampling", &self.sampling)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ClientSimulator {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &EvalConfig) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            sampling: config.client_sampling,
            timeout: config.api_timeout,
        }
    }

    fn build_request(&self, context: &TurnContext<'_>) -> Result<CompletionRequest, String> {
        let persona_prompt = context
            .persona
            .system_prompt()
            .map_err(|err| err.to_string())?;

        let mut messages = Vec::with_capacity(context.transcript.len() + 2);
        messages.push(ChatMessage::system(format!(
            "{persona_prompt}\n\n{}",
            context.phase.guidance()
        )));
        messages.extend(context.transcript.to_chat_messages());
        messages.push(ChatMessage::assistant(CLIENT_CUE));

        Ok(self
            .sampling
            .apply(CompletionRequest::new(self.model.clone(), messages)))
    }
}

#[async_trait]
impl RoleAgent for ClientSimulator {
    fn role(&self) -> Role {
        Role::Client
    }

    async fn produce(&self, context: TurnContext<'_>) -> String {
        let request = match self.build_request(&context) {
            Ok(request) => request,
            Err(error) => {
                warn!(persona = %context.persona.name, %error, "client prompt failed to render; using filler");
                return CLIENT_FILLER.to_string();
            }
        };

        match complete_text(self.provider.as_ref(), request, self.timeout).await {
            Ok(text) if !text.is_empty() => {
                debug!(persona = %context.persona.name, turn = context.turn_index, phase = %context.phase, "client spoke");
                text
            }
            Ok(_) => {
                warn!(persona = %context.persona.name, turn = context.turn_index, "client simulator returned empty text; using filler");
                CLIENT_FILLER.to_string()
            }
            Err(error) => {
                warn!(persona = %context.persona.name, turn = context.turn_index, %error, "client simulator failed; using filler");
                CLIENT_FILLER.to_string()
            }
        }
    }
}

pub struct Therapist {
    provider: Arc<dyn LLMProvider>,
    model: String,
    sampling: Sampling,
    timeout: Duration,
    instructions: String,
}

impl fmt::Debug for Therapist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Therapist")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("sampling", &self.sampling)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Therapist {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &EvalConfig) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            sampling: config.therapist_sampling,
            timeout: config.api_timeout,
            instructions: default_instructions(config.therapist_max_words),
        }
    }

    /// Replaces the therapist system prompt, e.g. to evaluate a different
    /// therapeutic style.
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }
}

fn default_instructions(max_words: usize) -> String {
    format!(
        "You are a warm, evidence-based therapist working in online text therapy. \
Reflect the client's feelings, validate their experience, and ask at most one open question. \
Avoid advice until you understand the problem. Keep responses under {max_words} words."
    )
}

#[async_trait]
impl RoleAgent for Therapist {
    fn role(&self) -> Role {
        Role::Therapist
    }

    async fn produce(&self, context: TurnContext<'_>) -> String {
        let mut messages = Vec::with_capacity(context.transcript.len() + 1);
        messages.push(ChatMessage::system(self.instructions.clone()));
        messages.extend(context.transcript.to_chat_messages());

        let request = self
            .sampling
            .apply(CompletionRequest::new(self.model.clone(), messages));

        match complete_text(self.provider.as_ref(), request, self.timeout).await {
            Ok(text) if !text.is_empty() => text,
            Ok(_) => {
                warn!(persona = %context.persona.name, turn = context.turn_index, "therapist returned empty text; using filler");
                THERAPIST_FILLER.to_string()
            }
            Err(error) => {
                warn!(persona = %context.persona.name, turn = context.turn_index, %error, "therapist response failed; using filler");
                THERAPIST_FILLER.to_string()
            }
        }
    }
}
