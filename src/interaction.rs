//! Interaction ledger: append-only record of prompt usage outcomes.
//!
//! Every AI-assisted operation reports one [`Interaction`] — the prompt
//! used, its version, the query, the outcome and named metrics. Records
//! are appended to a JSONL ledger and never mutated or deleted; all
//! statistics are folds over the file.

use crate::error::{LoopError, Result};
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Ledger filename inside the state directory.
pub const INTERACTIONS_FILENAME: &str = "interactions.jsonl";

/// A single recorded usage of a prompt and its outcome.
///
/// Immutable once recorded. Content is never validated at record time;
/// the ledger is a faithful journal of what callers report.
///
/// # Example
///
/// ```
/// use learnloop::interaction::Interaction;
///
/// let interaction = Interaction::new("code-review", "review src/main.rs", true)
///     .with_metric("response_time", 1.4)
///     .with_response("LGTM");
/// assert!(interaction.success);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    /// Unique record id.
    pub id: Uuid,
    /// When the interaction happened.
    pub timestamp: DateTime<Utc>,
    /// Identifier of the prompt that was used.
    pub prompt_id: String,
    /// Version tag of the prompt at usage time.
    pub prompt_version: String,
    /// The query the prompt was applied to.
    pub query: String,
    /// Snapshot of the prompt content at usage time.
    pub prompt_content: String,
    /// Variable bindings substituted into the prompt.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    /// The response that was produced.
    pub response: String,
    /// Whether the interaction met its success criteria.
    pub success: bool,
    /// Named metrics. Values may be non-numeric; non-numeric values are
    /// skipped during averaging rather than coerced.
    #[serde(default)]
    pub success_metrics: HashMap<String, serde_json::Value>,
    /// Free-text feedback, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Caller-supplied improvement suggestions, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
}

impl Interaction {
    /// Create a new interaction with the current timestamp.
    #[must_use]
    pub fn new(prompt_id: impl Into<String>, query: impl Into<String>, success: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            prompt_id: prompt_id.into(),
            prompt_version: "1.0".to_string(),
            query: query.into(),
            prompt_content: String::new(),
            variables: HashMap::new(),
            response: String::new(),
            success,
            success_metrics: HashMap::new(),
            feedback: None,
            suggestions: None,
        }
    }

    /// Set the prompt version and content snapshot.
    #[must_use]
    pub fn with_prompt(mut self, version: impl Into<String>, content: impl Into<String>) -> Self {
        self.prompt_version = version.into();
        self.prompt_content = content.into();
        self
    }

    /// Set the response text.
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    /// Add a single numeric metric.
    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.success_metrics
            .insert(name.into(), serde_json::json!(value));
        self
    }

    /// Replace the full metrics map.
    #[must_use]
    pub fn with_metrics(mut self, metrics: HashMap<String, serde_json::Value>) -> Self {
        self.success_metrics = metrics;
        self
    }

    /// Replace the variable bindings.
    #[must_use]
    pub fn with_variables(mut self, variables: HashMap<String, serde_json::Value>) -> Self {
        self.variables = variables;
        self
    }

    /// Attach free-text feedback.
    #[must_use]
    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }

    /// Attach improvement suggestions.
    #[must_use]
    pub fn with_suggestions(mut self, suggestions: Vec<String>) -> Self {
        self.suggestions = Some(suggestions);
        self
    }
}

/// Global counts over the whole ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Total recorded interactions.
    pub total_interactions: u64,
    /// Number of distinct prompt identifiers seen.
    pub total_prompts: u64,
    /// Mean of per-row success flags, in [0, 1]. 0.0 when empty.
    pub avg_success_rate: f64,
}

/// Per-prompt usage grouping, used by the `stats` reporting surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptUsage {
    /// Prompt identifier.
    pub prompt_id: String,
    /// Interaction count for this prompt.
    pub count: u64,
    /// Mean success flag for this prompt, in [0, 1].
    pub success_rate: f64,
}

/// Append-only JSONL ledger of interactions.
#[derive(Debug, Clone)]
pub struct InteractionLedger {
    path: PathBuf,
}

impl InteractionLedger {
    /// Create a ledger handle rooted at a state directory.
    ///
    /// The file is created lazily on first record.
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            path: state_dir.as_ref().join(INTERACTIONS_FILENAME),
        }
    }

    /// The ledger file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one interaction.
    ///
    /// The append takes an exclusive lock and flushes before returning,
    /// so each call either fully succeeds or fully fails.
    ///
    /// # Errors
    ///
    /// Returns `Storage` only on underlying I/O failure. Content is
    /// never validated.
    pub fn record(&self, interaction: &Interaction) -> Result<()> {
        self.ensure_dir()?;

        let line = serde_json::to_string(interaction)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.storage_err("open ledger", &e))?;

        file.lock_exclusive()
            .map_err(|e| self.storage_err("lock ledger", &e))?;

        let mut file = file;
        writeln!(file, "{line}").map_err(|e| self.storage_err("append interaction", &e))?;
        file.flush()
            .map_err(|e| self.storage_err("flush ledger", &e))?;
        // Lock released on drop.

        Ok(())
    }

    /// Read all interactions in append order.
    ///
    /// Lines that fail to parse are skipped with a warning; a corrupt
    /// tail must not make the whole history unreadable.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the file exists but cannot be opened.
    pub fn read_all(&self) -> Result<Vec<Interaction>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path).map_err(|e| self.storage_err("open ledger", &e))?;
        let reader = BufReader::new(file);

        let mut interactions = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| self.storage_err("read ledger", &e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Interaction>(&line) {
                Ok(interaction) => interactions.push(interaction),
                Err(e) => warn!("skipping malformed ledger line: {e}"),
            }
        }

        Ok(interactions)
    }

    /// The most recent `limit` interactions for a prompt, newest first.
    ///
    /// Stateless: repeated calls rescan the ledger, no cursor is held.
    pub fn query(&self, prompt_id: &str, limit: usize) -> Result<Vec<Interaction>> {
        let interactions = self.read_all()?;
        Ok(interactions
            .into_iter()
            .rev()
            .filter(|i| i.prompt_id == prompt_id)
            .take(limit)
            .collect())
    }

    /// Count of interactions recorded for a prompt.
    pub fn count_for_prompt(&self, prompt_id: &str) -> Result<u64> {
        let interactions = self.read_all()?;
        Ok(interactions
            .iter()
            .filter(|i| i.prompt_id == prompt_id)
            .count() as u64)
    }

    /// Global counts: totals, distinct prompts, mean success flag.
    pub fn statistics(&self) -> Result<LedgerStats> {
        let interactions = self.read_all()?;

        let total = interactions.len() as u64;
        let mut prompts = HashSet::new();
        let mut successes = 0u64;
        for interaction in &interactions {
            prompts.insert(interaction.prompt_id.as_str());
            if interaction.success {
                successes += 1;
            }
        }

        Ok(LedgerStats {
            total_interactions: total,
            total_prompts: prompts.len() as u64,
            avg_success_rate: if total == 0 {
                0.0
            } else {
                successes as f64 / total as f64
            },
        })
    }

    /// Interactions with `timestamp >= now - duration`, newest first.
    pub fn recent_since(&self, duration: Duration) -> Result<Vec<Interaction>> {
        let cutoff = Utc::now() - duration;
        let interactions = self.read_all()?;
        Ok(interactions
            .into_iter()
            .rev()
            .filter(|i| i.timestamp >= cutoff)
            .collect())
    }

    /// Prompts by interaction count, most used first.
    pub fn top_prompts(&self, limit: usize) -> Result<Vec<PromptUsage>> {
        let mut usage = self.usage_by_prompt()?;
        usage.sort_by(|a, b| b.count.cmp(&a.count).then(a.prompt_id.cmp(&b.prompt_id)));
        usage.truncate(limit);
        Ok(usage)
    }

    /// Prompts whose success rate is below `threshold`, worst first.
    pub fn low_performing(&self, threshold: f64) -> Result<Vec<PromptUsage>> {
        let mut usage: Vec<PromptUsage> = self
            .usage_by_prompt()?
            .into_iter()
            .filter(|u| u.success_rate < threshold)
            .collect();
        usage.sort_by(|a, b| {
            a.success_rate
                .partial_cmp(&b.success_rate)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.prompt_id.cmp(&b.prompt_id))
        });
        Ok(usage)
    }

    fn usage_by_prompt(&self) -> Result<Vec<PromptUsage>> {
        let interactions = self.read_all()?;

        let mut counts: HashMap<String, (u64, u64)> = HashMap::new();
        for interaction in &interactions {
            let entry = counts.entry(interaction.prompt_id.clone()).or_default();
            entry.0 += 1;
            if interaction.success {
                entry.1 += 1;
            }
        }

        Ok(counts
            .into_iter()
            .map(|(prompt_id, (count, successes))| PromptUsage {
                prompt_id,
                count,
                success_rate: successes as f64 / count as f64,
            })
            .collect())
    }

    fn ensure_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| self.storage_err("create state directory", &e))?;
            }
        }
        Ok(())
    }

    fn storage_err(&self, action: &str, err: &dyn std::fmt::Display) -> LoopError {
        LoopError::storage_with_path(format!("{action}: {err}"), self.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, InteractionLedger) {
        let temp = TempDir::new().unwrap();
        let ledger = InteractionLedger::new(temp.path().join("state"));
        (temp, ledger)
    }

    #[test]
    fn test_record_and_read_roundtrip() {
        let (_temp, ledger) = ledger();

        let interaction = Interaction::new("p1", "what is BPM?", true)
            .with_prompt("abc123", "You are a music assistant.")
            .with_metric("response_time", 2.5)
            .with_feedback("good answer");
        ledger.record(&interaction).unwrap();

        let all = ledger.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].prompt_id, "p1");
        assert_eq!(all[0].prompt_version, "abc123");
        assert_eq!(all[0].feedback.as_deref(), Some("good answer"));
    }

    #[test]
    fn test_read_empty_ledger() {
        let (_temp, ledger) = ledger();
        assert!(ledger.read_all().unwrap().is_empty());
        let stats = ledger.statistics().unwrap();
        assert_eq!(stats.total_interactions, 0);
        assert!((stats.avg_success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_query_newest_first_with_limit() {
        let (_temp, ledger) = ledger();
        for i in 0..5 {
            ledger
                .record(&Interaction::new("p1", format!("query {i}"), true))
                .unwrap();
        }
        ledger.record(&Interaction::new("p2", "other", false)).unwrap();

        let results = ledger.query("p1", 3).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].query, "query 4");
        assert_eq!(results[2].query, "query 2");
    }

    #[test]
    fn test_statistics() {
        let (_temp, ledger) = ledger();
        ledger.record(&Interaction::new("p1", "a", true)).unwrap();
        ledger.record(&Interaction::new("p1", "b", false)).unwrap();
        ledger.record(&Interaction::new("p2", "c", true)).unwrap();
        ledger.record(&Interaction::new("p3", "d", true)).unwrap();

        let stats = ledger.statistics().unwrap();
        assert_eq!(stats.total_interactions, 4);
        assert_eq!(stats.total_prompts, 3);
        assert!((stats.avg_success_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_count_for_prompt() {
        let (_temp, ledger) = ledger();
        for _ in 0..7 {
            ledger.record(&Interaction::new("p1", "q", true)).unwrap();
        }
        ledger.record(&Interaction::new("p2", "q", true)).unwrap();

        assert_eq!(ledger.count_for_prompt("p1").unwrap(), 7);
        assert_eq!(ledger.count_for_prompt("p2").unwrap(), 1);
        assert_eq!(ledger.count_for_prompt("missing").unwrap(), 0);
    }

    #[test]
    fn test_recent_since() {
        let (_temp, ledger) = ledger();

        let mut old = Interaction::new("p1", "old", true);
        old.timestamp = Utc::now() - Duration::hours(48);
        ledger.record(&old).unwrap();
        ledger.record(&Interaction::new("p1", "fresh", true)).unwrap();

        let recent = ledger.recent_since(Duration::hours(24)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].query, "fresh");
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let (_temp, ledger) = ledger();
        ledger.record(&Interaction::new("p1", "q", true)).unwrap();

        use std::io::Write as _;
        let mut file = OpenOptions::new()
            .append(true)
            .open(ledger.path())
            .unwrap();
        writeln!(file, "{{not json").unwrap();

        ledger.record(&Interaction::new("p1", "q2", false)).unwrap();

        let all = ledger.read_all().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_top_and_low_performing_prompts() {
        let (_temp, ledger) = ledger();
        for _ in 0..3 {
            ledger.record(&Interaction::new("busy", "q", false)).unwrap();
        }
        ledger.record(&Interaction::new("good", "q", true)).unwrap();

        let top = ledger.top_prompts(1).unwrap();
        assert_eq!(top[0].prompt_id, "busy");
        assert_eq!(top[0].count, 3);

        let low = ledger.low_performing(0.5).unwrap();
        assert_eq!(low.len(), 1);
        assert_eq!(low[0].prompt_id, "busy");
        assert!((low[0].success_rate - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_metrics_serialization_preserves_non_numeric_values() {
        let (_temp, ledger) = ledger();
        let mut metrics = HashMap::new();
        metrics.insert("response_time".to_string(), serde_json::json!(1.2));
        metrics.insert("build_passed".to_string(), serde_json::json!(true));

        ledger
            .record(&Interaction::new("p1", "q", true).with_metrics(metrics))
            .unwrap();

        let all = ledger.read_all().unwrap();
        assert_eq!(all[0].success_metrics["build_passed"], serde_json::json!(true));
    }
}
