use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{config::EvalConfig, conversation::ConversationResult};

const RULE_WIDTH: usize = 80;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub model: String,
    pub turns_per_conversation: usize,
    pub num_conversations: usize,
}

/// Persisted form of a batch: `eval_results_<timestamp>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub timestamp: DateTime<Utc>,
    pub config: RunSettings,
    pub results: Vec<ConversationResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryRow {
    pub persona: String,
    pub age: u32,
    pub overall: u8,
    pub empathy: u8,
    pub validation: u8,
    pub questions: u8,
    pub alliance: u8,
    pub red_flags: bool,
    pub degraded: bool,
}

impl EvalReport {
    pub fn new(config: &EvalConfig, results: Vec<ConversationResult>) -> Self {
        Self {
            timestamp: Utc::now(),
            config: RunSettings {
                model: config.model.clone(),
                turns_per_conversation: config.turns,
                num_conversations: results.len(),
            },
            results,
        }
    }

    pub fn rows(&self) -> Vec<SummaryRow> {
        self.results
            .iter()
            .map(|result| {
                let score = &result.evaluation;
                SummaryRow {
                    persona: result.persona.name.clone(),
                    age: result.persona.age,
                    overall: score.overall_score,
                    empathy: score.empathy_reflection,
                    validation: score.validation_affirmation,
                    questions: score.question_quality,
                    alliance: score.alliance_score,
                    red_flags: score.has_red_flags(),
                    degraded: score.is_sentinel(),
                }
            })
            .collect()
    }

    /// Mean overall score, `None` for an empty batch.
    pub fn average_overall(&self) -> Option<f64> {
        if self.results.is_empty() {
            return None;
        }
        let sum: u32 = self
            .results
            .iter()
            .map(|result| u32::from(result.evaluation.overall_score))
            .sum();
        Some(f64::from(sum) / self.results.len() as f64)
    }

    pub fn degraded_count(&self) -> usize {
        self.results
            .iter()
            .filter(|result| result.evaluation.is_sentinel())
            .count()
    }

    pub fn render_summary(&self) -> String {
        let headers = [
            "Persona", "Age", "Overall", "Empathy", "Validation", "Questions", "Alliance", "Red Flags",
        ];
        let rows: Vec<[String; 8]> = self
            .rows()
            .into_iter()
            .map(|row| {
                let flag = if row.degraded {
                    "unscored"
                } else if row.red_flags {
                    "YES"
                } else {
                    "-"
                };
                [
                    row.persona,
                    row.age.to_string(),
                    format!("{}/10", row.overall),
                    format!("{}/10", row.empathy),
                    format!("{}/10", row.validation),
                    format!("{}/10", row.questions),
                    format!("{}/10", row.alliance),
                    flag.to_string(),
                ]
            })
            .collect();

        let mut widths = headers.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row.iter()) {
                *width = (*width).max(cell.len());
            }
        }

        let border = widths
            .iter()
            .map(|width| "-".repeat(width + 2))
            .collect::<Vec<_>>()
            .join("+");
        let border = format!("+{border}+");
        let line = |cells: &[String]| {
            let body = cells
                .iter()
                .zip(widths.iter().copied())
                .map(|(cell, width)| format!(" {cell:<width$} "))
                .collect::<Vec<_>>()
                .join("|");
            format!("|{body}|")
        };

        let mut out = Vec::with_capacity(rows.len() + 6);
        out.push(border.clone());
        out.push(line(&headers.map(String::from)));
        out.push(border.clone());
        for row in &rows {
            out.push(line(row));
        }
        out.push(border);

        match self.average_overall() {
            Some(average) => out.push(format!("Average Overall Score: {average:.1}/10")),
            None => out.push("No conversations completed.".to_string()),
        }
        let degraded = self.degraded_count();
        if degraded > 0 {
            out.push(format!("{degraded} conversation(s) could not be scored"));
        }

        out.join("\n")
    }

    pub fn render_details(&self) -> String {
        let rule = "=".repeat(RULE_WIDTH);
        let mut out = vec![rule.clone(), "Detailed Results".to_string(), rule];

        for (number, result) in self.results.iter().enumerate() {
            let score = &result.evaluation;
            out.push(String::new());
            out.push(format!("--- Conversation {}: {} ---", number + 1, result.persona.name));
            out.push(format!("Background: {}", result.persona.background));
            out.push(format!("Issue: {}", result.persona.presenting_issue));
            out.push("Evaluation:".to_string());
            out.push(format!("  Overall Score: {}/10", score.overall_score));
            out.push(format!("  Strengths: {}", score.strengths));
            out.push(format!("  Improvements: {}", score.improvements));
            if let Some(flags) = &score.red_flags {
                out.push(format!("  Red Flags: {flags}"));
            }
        }

        out.join("\n")
    }

    /// Full transcript of the 1-based `number`th conversation.
    pub fn render_transcript(&self, number: usize) -> Option<String> {
        let result = self.results.get(number.checked_sub(1)?)?;
        let rule = "=".repeat(RULE_WIDTH);
        Some(format!(
            "Full Transcript - {}\n{rule}\n{}\n{rule}",
            result.persona.name,
            result.format_transcript()
        ))
    }

    pub fn file_name(&self) -> String {
        format!("eval_results_{}.json", self.timestamp.format("%Y%m%d_%H%M%S"))
    }

    /// Writes the report under `dir`, creating it if needed.
    pub fn save(&self, dir: impl AsRef<Path>) -> io::Result<PathBuf> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(self.file_name());
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
