use std::{fmt, sync::Arc};

use tracing::debug;

use crate::{
    agents::{RoleAgent, TurnContext},
    persona::Persona,
    transcript::{Message, Transcript, TranscriptError},
};

/// Runs the fixed-length client/therapist exchange for one persona.
///
/// Each turn is strictly sequential: the therapist sees the client line
/// that was just produced, and the next client line sees that reply.
#[derive(Clone)]
pub struct TurnDriver {
    client: Arc<dyn RoleAgent>,
    therapist: Arc<dyn RoleAgent>,
}

impl fmt::Debug for TurnDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnDriver")
            .field("client", &self.client.role())
            .field("therapist", &self.therapist.role())
            .finish()
    }
}

impl TurnDriver {
    pub fn new(client: Arc<dyn RoleAgent>, therapist: Arc<dyn RoleAgent>) -> Self {
        Self { client, therapist }
    }

    /// Produces a transcript of exactly `2 * turns` messages. Role agents
    /// absorb their own failures, so the only error is a role-order
    /// violation from a miswired agent.
    pub async fn run(&self, persona: &Persona, turns: usize) -> Result<Transcript, TranscriptError> {
        let mut transcript = Transcript::with_capacity(turns);

        for turn_index in 0..turns {
            let context = TurnContext::new(persona, &transcript, turn_index);
            let phase = context.phase;
            let client_line = self.client.produce(context).await;
            transcript.push(Message {
                role: self.client.role(),
                content: client_line,
            })?;

            let context = TurnContext::new(persona, &transcript, turn_index);
            let therapist_line = self.therapist.produce(context).await;
            transcript.push(Message {
                role: self.therapist.role(),
                content: therapist_line,
            })?;

            debug!(persona = %persona.name, turn = turn_index, %phase, "turn complete");
        }

        Ok(transcript)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use async_trait::async_trait;

    use crate::{
        agents::{RoleAgent, TurnContext},
        persona::PersonaCatalog,
        phase::TurnPhase,
        transcript::Role,
    };

    use super::TurnDriver;

    /// Echoes how much history it saw and records the phases it was given.
    struct Recorder {
        role: Role,
        phases: Mutex<Vec<TurnPhase>>,
        seen_lengths: Mutex<Vec<usize>>,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn new(role: Role) -> Arc<Self> {
            Arc::new(Self {
                role,
                phases: Mutex::new(Vec::new()),
                seen_lengths: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RoleAgent for Recorder {
        fn role(&self) -> Role {
            self.role
        }

        async fn produce(&self, context: TurnContext<'_>) -> String {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.phases.lock().unwrap().push(context.phase);
            self.seen_lengths.lock().unwrap().push(context.transcript.len());
            format!("{} line {}", self.role, context.turn_index)
        }
    }

    #[tokio::test]
    async fn produces_two_messages_per_turn_alternating() {
        let client = Recorder::new(Role::Client);
        let therapist = Recorder::new(Role::Therapist);
        let driver = TurnDriver::new(client.clone(), therapist.clone());
        let persona = PersonaCatalog::builtin().personas()[0].clone();

        for turns in [1usize, 2, 5, 7] {
            let transcript = driver.run(&persona, turns).await.unwrap();
            assert_eq!(transcript.len(), turns * 2);
            for (index, message) in transcript.iter().enumerate() {
                let expected = if index % 2 == 0 { Role::Client } else { Role::Therapist };
                assert_eq!(message.role, expected);
            }
        }
    }

    #[tokio::test]
    async fn each_call_sees_the_previous_line() {
        let client = Recorder::new(Role::Client);
        let therapist = Recorder::new(Role::Therapist);
        let driver = TurnDriver::new(client.clone(), therapist.clone());
        let persona = PersonaCatalog::builtin().personas()[0].clone();

        driver.run(&persona, 3).await.unwrap();

        assert_eq!(*client.seen_lengths.lock().unwrap(), vec![0, 2, 4]);
        assert_eq!(*therapist.seen_lengths.lock().unwrap(), vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn client_receives_phase_for_each_turn() {
        let client = Recorder::new(Role::Client);
        let therapist = Recorder::new(Role::Therapist);
        let driver = TurnDriver::new(client.clone(), therapist);
        let persona = PersonaCatalog::builtin().personas()[0].clone();

        driver.run(&persona, 6).await.unwrap();

        assert_eq!(
            *client.phases.lock().unwrap(),
            vec![
                TurnPhase::Opening,
                TurnPhase::Testing,
                TurnPhase::Deepening,
                TurnPhase::Reflecting,
                TurnPhase::Closing,
                TurnPhase::Closing,
            ]
        );
    }

    #[tokio::test]
    async fn zero_turns_is_an_empty_transcript() {
        let client = Recorder::new(Role::Client);
        let therapist = Recorder::new(Role::Therapist);
        let driver = TurnDriver::new(client.clone(), therapist.clone());
        let persona = PersonaCatalog::builtin().personas()[0].clone();

        let transcript = driver.run(&persona, 0).await.unwrap();
        assert!(transcript.is_empty());
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(therapist.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn miswired_agents_fail_with_order_error() {
        let first = Recorder::new(Role::Therapist);
        let second = Recorder::new(Role::Client);
        let driver = TurnDriver::new(first, second);
        let persona = PersonaCatalog::builtin().personas()[0].clone();

        let err = driver.run(&persona, 1).await.unwrap_err();
        assert_eq!(err.position, 0);
        assert_eq!(err.expected, Role::Client);
    }
}
