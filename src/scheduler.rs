use std::{sync::Arc, time::Duration};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::{
    config::EvalConfig,
    conversation::{ConversationError, ConversationResult, ConversationRunner},
    error::ConfigError,
    persona::Persona,
    LLMProvider,
};

#[derive(Debug, Clone)]
pub enum BatchEvent {
    /// Emitted once the conversation holds a concurrency slot.
    Started { index: usize, persona: String },
    /// Emitted before the slot is released.
    Finished {
        index: usize,
        persona: String,
        overall_score: u8,
        degraded: bool,
        duration: Duration,
    },
    Failed {
        index: usize,
        persona: String,
        error: String,
    },
}

/// A batch with at least one fatal conversation. Every other conversation
/// was allowed to finish; their results are kept in input order.
#[derive(Debug, thiserror::Error)]
#[error("conversation {index} ({persona}) failed: {source} ({} of {total} completed)", .completed.len())]
pub struct BatchError {
    pub index: usize,
    pub persona: String,
    pub source: ConversationError,
    pub failures: usize,
    pub total: usize,
    pub completed: Vec<ConversationResult>,
}

/// Runs conversations with at most `limit` in flight.
pub struct ConcurrencyScheduler {
    runner: Arc<ConversationRunner>,
    limit: usize,
    event_callback: Option<Arc<dyn Fn(&BatchEvent) + Send + Sync>>,
}

impl ConcurrencyScheduler {
    pub fn new(runner: Arc<ConversationRunner>, limit: usize) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(Self {
            runner,
            limit,
            event_callback: None,
        })
    }

    pub fn from_config(
        provider: Arc<dyn LLMProvider>,
        config: &EvalConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let runner = ConversationRunner::from_config(provider, config);
        Self::new(Arc::new(runner), config.max_concurrent_conversations)
    }

    pub fn with_event_callback(
        mut self,
        callback: impl Fn(&BatchEvent) + Send + Sync + 'static,
    ) -> Self {
        self.event_callback = Some(Arc::new(callback));
        self
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn runner(&self) -> &ConversationRunner {
        &self.runner
    }

    fn emit_event(&self, event: &BatchEvent) {
        if let Some(callback) = &self.event_callback {
            callback(event);
        }
    }

    /// Runs every persona and returns results in input order. A fatal
    /// conversation does not cancel its siblings; the batch fails with the
    /// first error observed once all of them have settled.
    pub async fn run_all(
        &self,
        personas: Vec<Persona>,
    ) -> Result<Vec<ConversationResult>, BatchError> {
        let total = personas.len();
        let semaphore = Semaphore::new(self.limit);
        let mut tasks = FuturesUnordered::new();

        for (index, persona) in personas.into_iter().enumerate() {
            let semaphore = &semaphore;
            tasks.push(async move {
                let name = persona.name.clone();
                let outcome = match semaphore.acquire().await {
                    Ok(_permit) => {
                        debug!(index, persona = %name, "conversation admitted");
                        self.emit_event(&BatchEvent::Started {
                            index,
                            persona: name.clone(),
                        });
                        let outcome = self.runner.run(persona).await;
                        self.emit_event(&match &outcome {
                            Ok(result) => BatchEvent::Finished {
                                index,
                                persona: name.clone(),
                                overall_score: result.evaluation.overall_score,
                                degraded: result.evaluation.is_sentinel(),
                                duration: result.duration,
                            },
                            Err(error) => BatchEvent::Failed {
                                index,
                                persona: name.clone(),
                                error: error.to_string(),
                            },
                        });
                        outcome
                    }
                    Err(_) => Err(ConversationError::SchedulerClosed),
                };
                (index, name, outcome)
            });
        }

        let mut slots: Vec<Option<ConversationResult>> = (0..total).map(|_| None).collect();
        let mut first_failure: Option<(usize, String, ConversationError)> = None;
        let mut failures = 0usize;

        while let Some((index, name, outcome)) = tasks.next().await {
            match outcome {
                Ok(result) => slots[index] = Some(result),
                Err(error) => {
                    failures += 1;
                    warn!(index, persona = %name, %error, "conversation failed");
                    if first_failure.is_none() {
                        first_failure = Some((index, name, error));
                    }
                }
            }
        }

        let completed: Vec<ConversationResult> = slots.into_iter().flatten().collect();
        info!(total, completed = completed.len(), failures, limit = self.limit, "batch finished");

        match first_failure {
            None => Ok(completed),
            Some((index, persona, source)) => Err(BatchError {
                index,
                persona,
                source,
                failures,
                total,
                completed,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::time::sleep;

    use crate::{
        config::EvalConfig,
        error::ConfigError,
        persona::PersonaCatalog,
        providers::LLMProvider,
        types::{CompletionRequest, CompletionResponse},
        LLMError,
    };

    use super::{BatchEvent, ConcurrencyScheduler};

    const SCORE: &str = r#"{"overall_score": 5, "strengths": "ok", "improvements": "more"}"#;

    /// Answers every call after a short delay; scorer calls (the ones that
    /// ask for JSON) get a score, or fail when the transcript mentions
    /// `fail_for`.
    struct SlowProvider {
        delay: Duration,
        fail_for: Option<String>,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowProvider {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                fail_for: None,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn failing_for(mut self, persona: &str) -> Self {
            self.fail_for = Some(persona.to_string());
            self
        }
    }

    #[async_trait]
    impl LLMProvider for SlowProvider {
        async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if request.response_format.is_none() {
                let speaker = request.messages[0].text().unwrap_or_default();
                return Ok(CompletionResponse::from_text(format!("line for {}", &speaker[..speaker.len().min(20)])));
            }

            let transcript = request.messages[1].text().unwrap_or_default();
            if let Some(name) = &self.fail_for {
                if transcript.contains(&format!("line for You are {name}")) {
                    return Err(LLMError::Provider("scorer unavailable".to_string()));
                }
            }
            Ok(CompletionResponse::from_text(SCORE))
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    fn track_active(scheduler: ConcurrencyScheduler) -> (ConcurrencyScheduler, Arc<Mutex<(usize, usize)>>) {
        let counters = Arc::new(Mutex::new((0usize, 0usize)));
        let sink = Arc::clone(&counters);
        let scheduler = scheduler.with_event_callback(move |event| {
            let mut guard = sink.lock().unwrap();
            match event {
                BatchEvent::Started { .. } => {
                    guard.0 += 1;
                    guard.1 = guard.1.max(guard.0);
                }
                BatchEvent::Finished { .. } | BatchEvent::Failed { .. } => guard.0 -= 1,
            }
        });
        (scheduler, counters)
    }

    #[tokio::test]
    async fn never_exceeds_the_ceiling_and_returns_everything() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(5)));
        let config = EvalConfig::new()
            .with_turns(2)
            .with_max_concurrent_conversations(3);
        let scheduler = ConcurrencyScheduler::from_config(provider.clone(), &config).unwrap();
        let (scheduler, counters) = track_active(scheduler);

        let personas = PersonaCatalog::builtin().personas().to_vec();
        let results = scheduler.run_all(personas.clone()).await.unwrap();

        assert_eq!(results.len(), personas.len());
        let (active, peak) = *counters.lock().unwrap();
        assert_eq!(active, 0);
        assert!(peak <= 3, "peak active conversations was {peak}");
        assert!(provider.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn results_follow_input_order() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(2)));
        let config = EvalConfig::new().with_turns(1).with_max_concurrent_conversations(4);
        let scheduler = ConcurrencyScheduler::from_config(provider, &config).unwrap();

        let personas = PersonaCatalog::builtin().personas()[..6].to_vec();
        let results = scheduler.run_all(personas.clone()).await.unwrap();

        let got: Vec<_> = results.iter().map(|r| r.persona.name.clone()).collect();
        let want: Vec<_> = personas.iter().map(|p| p.name.clone()).collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn fatal_task_fails_batch_but_siblings_finish() {
        let provider = Arc::new(SlowProvider::new(Duration::from_millis(2)).failing_for("Maria"));
        let config = EvalConfig::new().with_turns(1).with_max_concurrent_conversations(2);
        let scheduler = ConcurrencyScheduler::from_config(provider, &config).unwrap();

        let personas = PersonaCatalog::builtin().personas()[..4].to_vec();
        let err = scheduler.run_all(personas).await.unwrap_err();

        assert_eq!(err.persona, "Maria");
        assert_eq!(err.index, 1);
        assert_eq!(err.failures, 1);
        assert_eq!(err.total, 4);
        let names: Vec<_> = err.completed.iter().map(|r| r.persona.name.as_str()).collect();
        assert_eq!(names, vec!["Alex", "Jordan", "Priya"]);
    }

    #[tokio::test]
    async fn empty_batch_is_empty() {
        let provider = Arc::new(SlowProvider::new(Duration::ZERO));
        let scheduler = ConcurrencyScheduler::from_config(provider, &EvalConfig::new()).unwrap();
        assert!(scheduler.run_all(Vec::new()).await.unwrap().is_empty());
    }

    #[test]
    fn zero_ceiling_is_a_config_error() {
        let provider = Arc::new(SlowProvider::new(Duration::ZERO));
        let config = EvalConfig::new().with_max_concurrent_conversations(0);
        let err = ConcurrencyScheduler::from_config(provider, &config).err().unwrap();
        assert!(matches!(err, ConfigError::ZeroConcurrency));
    }
}
