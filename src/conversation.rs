use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::{
    agents::{ClientSimulator, Therapist},
    config::EvalConfig,
    driver::TurnDriver,
    persona::Persona,
    scoring::{ScoreRecord, ScoringError, ScoringPipeline},
    transcript::{Transcript, TranscriptError},
    LLMProvider,
};

#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error(transparent)]
    Transcript(#[from] TranscriptError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error("concurrency limiter closed before the conversation was admitted")]
    SchedulerClosed,
}

/// One finished and scored session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationResult {
    pub persona: Persona,
    pub transcript: Transcript,
    pub evaluation: ScoreRecord,
    #[serde(rename = "duration_seconds", with = "duration_seconds")]
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationResult {
    pub fn format_transcript(&self) -> String {
        self.transcript.to_labeled_text()
    }
}

mod duration_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Drives one persona through the turn loop and then scores it.
#[derive(Clone)]
pub struct ConversationRunner {
    driver: TurnDriver,
    scorer: Arc<ScoringPipeline>,
    turns: usize,
}

impl fmt::Debug for ConversationRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationRunner")
            .field("driver", &self.driver)
            .field("scorer", &self.scorer)
            .field("turns", &self.turns)
            .finish()
    }
}

impl ConversationRunner {
    pub fn new(driver: TurnDriver, scorer: Arc<ScoringPipeline>, turns: usize) -> Self {
        Self {
            driver,
            scorer,
            turns,
        }
    }

    /// Client, therapist and scorer all talk to `provider`.
    pub fn from_config(provider: Arc<dyn LLMProvider>, config: &EvalConfig) -> Self {
        Self::with_providers(
            Arc::clone(&provider),
            Arc::clone(&provider),
            provider,
            config,
        )
    }

    pub fn with_providers(
        client: Arc<dyn LLMProvider>,
        therapist: Arc<dyn LLMProvider>,
        scorer: Arc<dyn LLMProvider>,
        config: &EvalConfig,
    ) -> Self {
        let driver = TurnDriver::new(
            Arc::new(ClientSimulator::new(client, config)),
            Arc::new(Therapist::new(therapist, config)),
        );
        let scorer = Arc::new(ScoringPipeline::new(scorer, config));
        Self::new(driver, scorer, config.turns)
    }

    pub fn turns(&self) -> usize {
        self.turns
    }

    pub async fn run(&self, persona: Persona) -> Result<ConversationResult, ConversationError> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let transcript = self.driver.run(&persona, self.turns).await?;
        let evaluation = self.scorer.evaluate(&transcript).await?;

        let duration = clock.elapsed();
        debug!(persona = %persona.name, ?duration, overall = evaluation.overall_score, "conversation finished");

        Ok(ConversationResult {
            persona,
            transcript,
            evaluation,
            duration,
            started_at,
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        config::EvalConfig,
        persona::PersonaCatalog,
        providers::scripted::{ScriptedProvider, ScriptedTurn},
        scoring::ScoringError,
        transcript::Role,
    };

    use super::{ConversationError, ConversationResult, ConversationRunner};

    const SCORE: &str = r#"{"empathy_reflection":6,"validation_affirmation":5,"question_quality":7,
        "supportive_tone":8,"alliance_goal":2,"alliance_approach":1,"alliance_bond":2,
        "alliance_score":6,"overall_score":6,"strengths":"Curious.","improvements":"Slow down.",
        "red_flags":null}"#;

    fn runner(scorer: ScriptedProvider, turns: usize) -> ConversationRunner {
        let chat = Arc::new(
            ScriptedProvider::new().with_fallback(ScriptedTurn::reply("a line")),
        );
        ConversationRunner::with_providers(
            chat.clone(),
            chat,
            Arc::new(scorer),
            &EvalConfig::new().with_turns(turns),
        )
    }

    #[tokio::test]
    async fn assembles_result() {
        let persona = PersonaCatalog::builtin().personas()[5].clone();
        let result = runner(ScriptedProvider::from_replies([SCORE]), 3)
            .run(persona.clone())
            .await
            .unwrap();

        assert_eq!(result.persona, persona);
        assert_eq!(result.transcript.len(), 6);
        assert_eq!(result.transcript.messages()[0].role, Role::Client);
        assert_eq!(result.evaluation.overall_score, 6);
        assert!(result.timestamp >= result.started_at);
    }

    #[tokio::test]
    async fn scoring_transport_failure_fails_the_task() {
        let persona = PersonaCatalog::builtin().personas()[0].clone();
        let err = runner(ScriptedProvider::from_turns([ScriptedTurn::failure("502")]), 1)
            .run(persona)
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::Scoring(ScoringError::Provider(_))));
    }

    #[tokio::test]
    async fn result_roundtrips_through_json() {
        let persona = PersonaCatalog::builtin().personas()[9].clone();
        let result = runner(ScriptedProvider::from_replies([SCORE]), 2)
            .run(persona)
            .await
            .unwrap();

        let json = serde_json::to_value(&result).unwrap();
        assert!(json["duration_seconds"].is_f64());
        assert_eq!(json["transcript"][0]["role"], "client");

        let back: ConversationResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.persona, result.persona);
        assert_eq!(back.transcript, result.transcript);
        assert_eq!(back.evaluation, result.evaluation);
        assert_eq!(back.timestamp, result.timestamp);
    }
}
