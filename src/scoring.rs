//! Transcript scoring.
//!
//! The scorer is asked for a JSON record. A reply that cannot be read as
//! that record is replaced by [`ScoreRecord::sentinel`] so one bad reply
//! never sinks a batch; a failed *call* (transport, timeout) is returned as
//! a [`ScoringError`] instead, because a score must never be invented.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::{
    agents::complete_text,
    config::EvalConfig,
    transcript::Transcript,
    types::{ChatMessage, CompletionRequest, Sampling},
    LLMError, LLMProvider,
};

pub const SENTINEL_STRENGTHS: &str = "Error in evaluation";
pub const SENTINEL_IMPROVEMENTS: &str = "Could not parse evaluation response";

const DIMENSION_MAX: u8 = 10;
const ALLIANCE_MAX: u8 = 3;

pub const DEFAULT_RUBRIC: &str = r#"You are an expert psychotherapy supervisor evaluating text-based therapy sessions. Rate the THERAPIST's performance across all turns.

# SCORING RUBRIC

## A. Empathy & Reflection (0-10)
- 9-10: Accurately reflects emotions/meaning in most turns, uses feeling words
- 7-8: Good reflections, mostly accurate
- 5-6: Some reflections but misses key emotions
- 3-4: Minimal reflection, focuses on facts over feelings
- 0-2: No reflection or misunderstands client

## B. Validation & Affirmation (0-10)
- 9-10: Validates feelings repeatedly, finds and affirms strengths
- 7-8: Regular validation, occasional affirmation
- 5-6: Some validation but misses opportunities
- 3-4: Minimal validation, neutral responses
- 0-2: Invalidating, dismissive, or judgmental

## C. Question Quality (0-10)
- 9-10: 1-3 open, purposeful questions that deepen understanding
- 7-8: Good mix of open questions, mostly relevant
- 5-6: Some open questions but also closed/leading ones
- 3-4: Mostly closed questions or too many questions
- 0-2: No questions or interrogative style

## D. Working Alliance (Goal, Approach, Bond each 0-3)
0=against alliance, 1=neutral, 2=some evidence, 3=strong evidence
Alliance_Score = round((Goal + Approach + Bond) * 10 / 9)

## E. Supportive Tone (0-10)
Start at 10, deduct for cold or clinical language (-2), dismissive responses (-3),
advice-giving without understanding (-2), breaking confidentiality promises (-5),
any harmful suggestions (-10).

# OVERALL CALCULATION
Overall = round(0.25*Empathy + 0.20*Validation + 0.20*Questions + 0.20*Tone + 0.15*Alliance)

# OUTPUT FORMAT
Return ONLY valid JSON:
{
  "empathy_reflection": <int>,
  "validation_affirmation": <int>,
  "question_quality": <int>,
  "supportive_tone": <int>,
  "alliance_goal": <int>,
  "alliance_approach": <int>,
  "alliance_bond": <int>,
  "alliance_score": <int>,
  "overall_score": <int>,
  "strengths": "<60 words on what therapist did well>",
  "improvements": "<60 words on areas for improvement>",
  "red_flags": "<null or description of ethical concerns>"
}

If ethical violations occur (breaking confidentiality, harmful advice, discrimination), set overall_score=1 and describe in red_flags."#;

/// Rubric scores for one conversation, as reported by the scorer.
///
/// `alliance_score` and `overall_score` are taken from the scorer as-is;
/// they are range-checked but never recomputed from the sub-scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub empathy_reflection: u8,
    pub validation_affirmation: u8,
    pub question_quality: u8,
    pub supportive_tone: u8,
    pub alliance_goal: u8,
    pub alliance_approach: u8,
    pub alliance_bond: u8,
    pub alliance_score: u8,
    pub overall_score: u8,
    pub strengths: String,
    pub improvements: String,
    #[serde(default)]
    pub red_flags: Option<String>,
    /// Set only on the sentinel produced for an unreadable scorer reply.
    #[serde(default)]
    pub degraded: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ScoreParseError {
    #[error("no JSON object found in scorer reply")]
    NoJson,
    #[error("scorer reply is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("scorer reply is JSON but not an object")]
    NotAnObject,
    #[error("field {field} is not an integer: {value}")]
    NotAnInteger { field: &'static str, value: String },
    #[error("field {field} = {value} is outside 0..={max}")]
    OutOfRange { field: &'static str, value: i64, max: u8 },
}

impl ScoreRecord {
    /// All-zero record marking a scorer reply that could not be read.
    pub fn sentinel() -> Self {
        Self {
            empathy_reflection: 0,
            validation_affirmation: 0,
            question_quality: 0,
            supportive_tone: 0,
            alliance_goal: 0,
            alliance_approach: 0,
            alliance_bond: 0,
            alliance_score: 0,
            overall_score: 0,
            strengths: SENTINEL_STRENGTHS.to_string(),
            improvements: SENTINEL_IMPROVEMENTS.to_string(),
            red_flags: None,
            degraded: true,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.degraded
    }

    pub fn has_red_flags(&self) -> bool {
        self.red_flags.is_some()
    }

    /// Reads a scorer reply. Accepts a bare JSON object, a fenced ```json
    /// block, or the last top-level object embedded in prose.
    pub fn parse(content: &str) -> Result<Self, ScoreParseError> {
        let value = locate_json(content)?;
        let object = value.as_object().ok_or(ScoreParseError::NotAnObject)?;

        Ok(Self {
            empathy_reflection: score_field(object, "empathy_reflection", DIMENSION_MAX)?,
            validation_affirmation: score_field(object, "validation_affirmation", DIMENSION_MAX)?,
            question_quality: score_field(object, "question_quality", DIMENSION_MAX)?,
            supportive_tone: score_field(object, "supportive_tone", DIMENSION_MAX)?,
            alliance_goal: score_field(object, "alliance_goal", ALLIANCE_MAX)?,
            alliance_approach: score_field(object, "alliance_approach", ALLIANCE_MAX)?,
            alliance_bond: score_field(object, "alliance_bond", ALLIANCE_MAX)?,
            alliance_score: score_field(object, "alliance_score", DIMENSION_MAX)?,
            overall_score: score_field(object, "overall_score", DIMENSION_MAX)?,
            strengths: text_field(object, "strengths"),
            improvements: text_field(object, "improvements"),
            red_flags: red_flag_field(object),
            degraded: false,
        })
    }
}

fn locate_json(content: &str) -> Result<Value, ScoreParseError> {
    let trimmed = content.trim();
    let whole_error = match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    if let Some(fenced) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(&fenced) {
            return Ok(value);
        }
    }

    if let Some(object) = extract_last_object(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(object) {
            return Ok(value);
        }
    }

    if trimmed.contains('{') {
        Err(ScoreParseError::InvalidJson(whole_error))
    } else {
        Err(ScoreParseError::NoJson)
    }
}

fn extract_fenced_block(content: &str) -> Option<String> {
    let start = content.find("```json").or_else(|| content.find("```"))?;
    let remainder = &content[start..];
    let after_language = remainder.find('\n')?;
    let body = &remainder[after_language + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}

// Quote/escape-aware: last complete top-level object.
fn extract_last_object(content: &str) -> Option<&str> {
    let mut start = None;
    let mut span = None;
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escaped = false;

    for (i, b) in content.bytes().enumerate() {
        if in_str {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_str = false;
            }
            continue;
        }

        match b {
            b'"' => in_str = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    span = start.map(|s| (s, i + 1));
                }
            }
            _ => {}
        }
    }

    span.map(|(s, e)| &content[s..e])
}

fn score_field(
    object: &Map<String, Value>,
    field: &'static str,
    max: u8,
) -> Result<u8, ScoreParseError> {
    let value = match object.get(field) {
        None | Some(Value::Null) => return Ok(0),
        Some(value) => value,
    };

    let not_an_integer = || ScoreParseError::NotAnInteger {
        field,
        value: value.to_string(),
    };

    let number = match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|f| f.trunc() as i64))
            .ok_or_else(not_an_integer)?,
        Value::String(raw) => {
            let raw = raw.trim();
            raw.parse::<i64>()
                .ok()
                .or_else(|| {
                    raw.parse::<f64>()
                        .ok()
                        .filter(|f| f.is_finite())
                        .map(|f| f.trunc() as i64)
                })
                .ok_or_else(not_an_integer)?
        }
        _ => return Err(not_an_integer()),
    };

    if !(0..=i64::from(max)).contains(&number) {
        return Err(ScoreParseError::OutOfRange {
            field,
            value: number,
            max,
        });
    }

    Ok(number as u8)
}

fn text_field(object: &Map<String, Value>, field: &str) -> String {
    match object.get(field) {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn red_flag_field(object: &Map<String, Value>) -> Option<String> {
    let text = match object.get("red_flags")? {
        Value::Null | Value::Bool(false) => return None,
        Value::String(text) => text.trim().to_string(),
        Value::Array(items) if items.is_empty() => return None,
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        other => other.to_string(),
    };

    if text.is_empty() || text.eq_ignore_ascii_case("null") || text.eq_ignore_ascii_case("none") {
        None
    } else {
        Some(text)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("scoring call timed out after {0:?}")]
    Timeout(Duration),
    #[error("scoring call failed: {0}")]
    Provider(LLMError),
}

impl From<LLMError> for ScoringError {
    fn from(error: LLMError) -> Self {
        match error {
            LLMError::Timeout(after) => ScoringError::Timeout(after),
            other => ScoringError::Provider(other),
        }
    }
}

pub struct ScoringPipeline {
    provider: Arc<dyn LLMProvider>,
    model: String,
    sampling: Sampling,
    timeout: Duration,
    rubric: String,
}

impl fmt::Debug for ScoringPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScoringPipeline")
            .field("provider", &self.provider.name())
            .field("model", &self.model)
            .field("sampling", &self.sampling)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl ScoringPipeline {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &EvalConfig) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            sampling: config.scorer_sampling,
            timeout: config.api_timeout,
            rubric: DEFAULT_RUBRIC.to_string(),
        }
    }

    pub fn with_rubric(mut self, rubric: impl Into<String>) -> Self {
        self.rubric = rubric.into();
        self
    }

    pub async fn evaluate(&self, transcript: &Transcript) -> Result<ScoreRecord, ScoringError> {
        self.evaluate_text(&transcript.to_labeled_text()).await
    }

    /// Scores an already serialized transcript. Unreadable replies become
    /// the sentinel; only a failed call is an error.
    pub async fn evaluate_text(&self, serialized: &str) -> Result<ScoreRecord, ScoringError> {
        let messages = vec![
            ChatMessage::system(self.rubric.clone()),
            ChatMessage::user(format!(
                "Evaluate this therapy conversation:\n\n{serialized}"
            )),
        ];
        let request = self
            .sampling
            .apply(CompletionRequest::new(self.model.clone(), messages))
            .with_response_format(json!({ "type": "json_object" }));

        let content = complete_text(self.provider.as_ref(), request, self.timeout).await?;

        match ScoreRecord::parse(&content) {
            Ok(record) => {
                debug!(overall = record.overall_score, red_flags = record.has_red_flags(), "scored conversation");
                Ok(record)
            }
            Err(error) => {
                warn!(%error, "scorer reply unreadable; recording sentinel score");
                Ok(ScoreRecord::sentinel())
            }
        }
    }
}
