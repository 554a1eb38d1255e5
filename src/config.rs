use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{error::ConfigError, types::Sampling};

pub const DEFAULT_MODEL: &str = "gpt-4.1-mini-2025-04-14";
pub const DEFAULT_TURNS: usize = 5;
pub const DEFAULT_MAX_CONCURRENT_CONVERSATIONS: usize = 10;
pub const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_THERAPIST_MAX_WORDS: usize = 120;
pub const DEFAULT_RESULTS_DIR: &str = "data/results";

/// Run-wide settings. Built once before the batch starts and shared
/// read-only by every conversation task.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalConfig {
    pub model: String,
    pub turns: usize,
    pub max_concurrent_conversations: usize,
    pub api_timeout: Duration,
    pub therapist_max_words: usize,
    pub results_dir: PathBuf,
    pub client_sampling: Sampling,
    pub therapist_sampling: Sampling,
    pub scorer_sampling: Sampling,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            turns: DEFAULT_TURNS,
            max_concurrent_conversations: DEFAULT_MAX_CONCURRENT_CONVERSATIONS,
            api_timeout: DEFAULT_API_TIMEOUT,
            therapist_max_words: DEFAULT_THERAPIST_MAX_WORDS,
            results_dir: PathBuf::from(DEFAULT_RESULTS_DIR),
            client_sampling: Sampling::new(0.8, 150),
            therapist_sampling: Sampling::new(0.7, 200),
            scorer_sampling: Sampling::new(0.3, 500),
        }
    }
}

impl EvalConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `.env` if present, then overlays `THERAPY_EVAL_*` variables on
    /// the defaults. Unparseable values are rejected rather than ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Ok(model) = env::var("THERAPY_EVAL_MODEL") {
            if !model.trim().is_empty() {
                config.model = model;
            }
        }
        if let Some(turns) = parse_var("THERAPY_EVAL_TURNS")? {
            config.turns = turns;
        }
        if let Some(limit) = parse_var("THERAPY_EVAL_MAX_CONCURRENT")? {
            config.max_concurrent_conversations = limit;
        }
        if let Some(secs) = parse_var::<u64>("THERAPY_EVAL_API_TIMEOUT_SECS")? {
            config.api_timeout = Duration::from_secs(secs);
        }
        if let Ok(dir) = env::var("THERAPY_EVAL_RESULTS_DIR") {
            config.results_dir = PathBuf::from(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_turns(mut self, turns: usize) -> Self {
        self.turns = turns;
        self
    }

    pub fn with_max_concurrent_conversations(mut self, limit: usize) -> Self {
        self.max_concurrent_conversations = limit;
        self
    }

    pub fn with_api_timeout(mut self, timeout: Duration) -> Self {
        self.api_timeout = timeout;
        self
    }

    pub fn with_therapist_max_words(mut self, words: usize) -> Self {
        self.therapist_max_words = words;
        self
    }

    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_conversations == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.api_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        Err(_) => Ok(None),
    }
}
