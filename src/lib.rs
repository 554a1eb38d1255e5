pub mod error;
pub mod providers;
pub mod types;
pub mod config;
pub mod persona;
pub mod transcript;
pub mod phase;
pub mod agents;
pub mod driver;
pub mod scoring;
pub mod conversation;
pub mod scheduler;
pub mod eval;

pub use error::{ConfigError, LLMError};
pub use providers::LLMProvider;
pub use types::{
    ChatMessage, CompletionRequest, CompletionResponse, MessageRole, Sampling, TokenUsage,
};
pub use config::EvalConfig;
pub use persona::{Persona, PersonaCatalog, PersonaError};
pub use transcript::{Message, Role, Transcript, TranscriptError};
pub use phase::TurnPhase;
pub use agents::{
    ClientSimulator,
    RoleAgent,
    Therapist,
    TurnContext,
};
pub use driver::TurnDriver;
pub use scoring::{
    ScoreParseError,
    ScoreRecord,
    ScoringError,
    ScoringPipeline,
};
pub use conversation::{
    ConversationError,
    ConversationResult,
    ConversationRunner,
};
pub use scheduler::{
    BatchError,
    BatchEvent,
    ConcurrencyScheduler,
};
pub use eval::EvalReport;
