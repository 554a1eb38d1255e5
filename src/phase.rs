use std::fmt;

use serde::{Deserialize, Serialize};

/// Where the simulated client is in the session. Selected purely by turn
/// index; everything past the fourth turn stays in `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Opening,
    Testing,
    Deepening,
    Reflecting,
    Closing,
}

impl TurnPhase {
    pub const ALL: [TurnPhase; 5] = [
        TurnPhase::Opening,
        TurnPhase::Testing,
        TurnPhase::Deepening,
        TurnPhase::Reflecting,
        TurnPhase::Closing,
    ];

    pub fn for_turn(index: usize) -> Self {
        Self::ALL[index.min(Self::ALL.len() - 1)]
    }

    pub fn hint(self) -> &'static str {
        match self {
            TurnPhase::Opening => "opening disclosure",
            TurnPhase::Testing => "testing the waters",
            TurnPhase::Deepening => "deepening trust",
            TurnPhase::Reflecting => "reflecting on therapist input",
            TurnPhase::Closing => "closing statement",
        }
    }

    /// Instruction appended to the client's system prompt.
    pub fn guidance(self) -> &'static str {
        match self {
            TurnPhase::Opening => {
                "This is your first message. Introduce your main concern naturally."
            }
            TurnPhase::Testing => {
                "Share more details about your situation. You're still testing the waters."
            }
            TurnPhase::Deepening => {
                "You're starting to trust more. Share a specific example or deeper feeling."
            }
            TurnPhase::Reflecting => {
                "Reflect on what the therapist has said. Show some insight or resistance."
            }
            TurnPhase::Closing => {
                "This is your final message. Express how you're feeling about the conversation."
            }
        }
    }
}

impl fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hint())
    }
}

#[cfg(test)]
mod tests {
    use super::TurnPhase;

    #[test]
    fn phase_is_keyed_by_turn_index() {
        let cases = [
            (0, TurnPhase::Opening),
            (1, TurnPhase::Testing),
            (2, TurnPhase::Deepening),
            (3, TurnPhase::Reflecting),
            (5, TurnPhase::Closing),
        ];
        for (index, expected) in cases {
            assert_eq!(TurnPhase::for_turn(index), expected, "turn {index}");
        }
    }

    #[test]
    fn closing_repeats_past_the_last_phase() {
        assert_eq!(TurnPhase::for_turn(4), TurnPhase::Closing);
        assert_eq!(TurnPhase::for_turn(usize::MAX), TurnPhase::Closing);
    }

    #[test]
    fn hints_are_distinct() {
        let hints: std::collections::HashSet<_> =
            TurnPhase::ALL.iter().map(|phase| phase.hint()).collect();
        assert_eq!(hints.len(), TurnPhase::ALL.len());
        assert_eq!(TurnPhase::Testing.to_string(), "testing the waters");
    }
}
