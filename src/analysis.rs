//! Per-prompt performance analysis.
//!
//! The analyzer folds a bounded window of recent interactions into a
//! [`PromptAnalysis`]: success rate, averaged numeric metrics, a sample
//! of failing queries, and threshold-based improvement opportunities.
//! Analyses are derived on demand and never persisted.

use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::interaction::InteractionLedger;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Failed interactions sampled when collecting failure patterns.
const FAILURE_WINDOW: usize = 10;

/// Maximum distinct failing queries reported per analysis.
const FAILURE_SAMPLE: usize = 5;

/// Metric name checked by the slow-response heuristic.
const RESPONSE_TIME_METRIC: &str = "response_time";

/// Derived performance snapshot for one prompt.
///
/// Recomputed from the interaction ledger on demand; has no independent
/// lifecycle and is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptAnalysis {
    /// Prompt identifier the analysis covers.
    pub prompt_id: String,
    /// Interactions in the analysis window.
    pub total_interactions: u64,
    /// Successes / total, in [0, 1]. 0.0 when the window is empty.
    pub success_rate: f64,
    /// Mean value per metric name, over numeric occurrences only.
    pub average_metrics: HashMap<String, f64>,
    /// Distinct queries from recent failed interactions.
    pub failure_patterns: Vec<String>,
    /// Threshold-based improvement hints.
    pub improvement_opportunities: Vec<String>,
    /// Suggested change summary, when any opportunity was flagged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended_changes: Option<String>,
}

impl PromptAnalysis {
    /// Zero-valued analysis for a prompt with no recorded interactions.
    #[must_use]
    pub fn empty(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            total_interactions: 0,
            success_rate: 0.0,
            average_metrics: HashMap::new(),
            failure_patterns: Vec::new(),
            improvement_opportunities: Vec::new(),
            recommended_changes: None,
        }
    }

    /// Whether any improvement opportunity was flagged.
    #[must_use]
    pub fn needs_attention(&self) -> bool {
        !self.improvement_opportunities.is_empty()
    }
}

/// Computes [`PromptAnalysis`] values from the interaction ledger.
///
/// # Example
///
/// ```rust,ignore
/// use learnloop::analysis::PerformanceAnalyzer;
/// use learnloop::config::AnalysisConfig;
/// use learnloop::interaction::InteractionLedger;
///
/// let ledger = InteractionLedger::new(".learnloop");
/// let analyzer = PerformanceAnalyzer::new(&ledger, AnalysisConfig::default());
/// let analysis = analyzer.analyze("code-review")?;
/// println!("success rate: {:.1}%", analysis.success_rate * 100.0);
/// ```
#[derive(Debug)]
pub struct PerformanceAnalyzer<'a> {
    ledger: &'a InteractionLedger,
    config: AnalysisConfig,
}

impl<'a> PerformanceAnalyzer<'a> {
    /// Create an analyzer over a ledger.
    #[must_use]
    pub fn new(ledger: &'a InteractionLedger, config: AnalysisConfig) -> Self {
        Self { ledger, config }
    }

    /// Analyze a prompt's recent performance.
    ///
    /// The window is the most recent `interaction_limit` interactions;
    /// older rows are excluded from the computation, not deleted. An
    /// empty window yields a zero-valued analysis, never an error.
    ///
    /// # Errors
    ///
    /// Returns an error only if the ledger cannot be read.
    pub fn analyze(&self, prompt_id: &str) -> Result<PromptAnalysis> {
        // Newest first.
        let interactions = self.ledger.query(prompt_id, self.config.interaction_limit)?;

        if interactions.is_empty() {
            return Ok(PromptAnalysis::empty(prompt_id));
        }

        let total = interactions.len() as u64;
        let successes = interactions.iter().filter(|i| i.success).count() as u64;
        let failed = total - successes;
        let success_rate = successes as f64 / total as f64;

        // Mean per metric name, skipping non-numeric and absent values.
        let mut sums: HashMap<String, (f64, u64)> = HashMap::new();
        for interaction in &interactions {
            for (name, value) in &interaction.success_metrics {
                if let Some(v) = value.as_f64() {
                    let entry = sums.entry(name.clone()).or_default();
                    entry.0 += v;
                    entry.1 += 1;
                }
            }
        }
        let average_metrics: HashMap<String, f64> = sums
            .into_iter()
            .map(|(name, (sum, count))| (name, sum / count as f64))
            .collect();

        // Distinct queries from the most recent failures, first-seen order.
        let mut failure_patterns: Vec<String> = Vec::new();
        for interaction in interactions
            .iter()
            .filter(|i| !i.success)
            .take(FAILURE_WINDOW)
        {
            if !failure_patterns.contains(&interaction.query) {
                failure_patterns.push(interaction.query.clone());
                if failure_patterns.len() == FAILURE_SAMPLE {
                    break;
                }
            }
        }

        let mut improvements = Vec::new();
        if success_rate < self.config.low_success_threshold {
            improvements.push("Low success rate - consider refining prompt clarity".to_string());
        }
        if average_metrics
            .get(RESPONSE_TIME_METRIC)
            .is_some_and(|t| *t > self.config.slow_response_threshold)
        {
            improvements.push("High response time - simplify prompt complexity".to_string());
        }
        if failed as f64 > self.config.failure_ratio_threshold * total as f64 {
            improvements.push("High failure rate - add more context or examples".to_string());
        }

        let recommended_changes = if improvements.is_empty() {
            None
        } else {
            Some(improvements.join("; "))
        };

        Ok(PromptAnalysis {
            prompt_id: prompt_id.to_string(),
            total_interactions: total,
            success_rate,
            average_metrics,
            failure_patterns,
            improvement_opportunities: improvements,
            recommended_changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::Interaction;
    use tempfile::TempDir;

    fn setup() -> (TempDir, InteractionLedger) {
        let temp = TempDir::new().unwrap();
        let ledger = InteractionLedger::new(temp.path());
        (temp, ledger)
    }

    fn analyzer(ledger: &InteractionLedger) -> PerformanceAnalyzer<'_> {
        PerformanceAnalyzer::new(ledger, AnalysisConfig::default())
    }

    #[test]
    fn test_empty_prompt_yields_zero_analysis() {
        let (_temp, ledger) = setup();
        let analysis = analyzer(&ledger).analyze("nothing").unwrap();

        assert_eq!(analysis.total_interactions, 0);
        assert!((analysis.success_rate - 0.0).abs() < f64::EPSILON);
        assert!(analysis.improvement_opportunities.is_empty());
        assert!(analysis.recommended_changes.is_none());
    }

    #[test]
    fn test_total_matches_ledger_rows() {
        let (_temp, ledger) = setup();
        for i in 0..8 {
            ledger
                .record(&Interaction::new("p1", format!("q{i}"), true))
                .unwrap();
        }
        ledger.record(&Interaction::new("p2", "q", false)).unwrap();

        let analysis = analyzer(&ledger).analyze("p1").unwrap();
        assert_eq!(analysis.total_interactions, 8);
    }

    #[test]
    fn test_alternating_outcomes_give_half_success_rate() {
        let (_temp, ledger) = setup();
        for i in 0..10 {
            ledger
                .record(&Interaction::new("p1", format!("q{i}"), i % 2 == 0))
                .unwrap();
        }

        let analysis = analyzer(&ledger).analyze("p1").unwrap();
        assert!((analysis.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(analysis.success_rate >= 0.0 && analysis.success_rate <= 1.0);
    }

    #[test]
    fn test_average_metrics_skip_non_numeric_values() {
        let (_temp, ledger) = setup();
        ledger
            .record(&Interaction::new("p1", "a", true).with_metric("response_time", 2.0))
            .unwrap();
        ledger
            .record(&Interaction::new("p1", "b", true).with_metric("response_time", 4.0))
            .unwrap();
        // Boolean value for the same metric must be skipped, not zeroed.
        let mut metrics = HashMap::new();
        metrics.insert("response_time".to_string(), serde_json::json!(true));
        metrics.insert("tokens".to_string(), serde_json::json!(120));
        ledger
            .record(&Interaction::new("p1", "c", true).with_metrics(metrics))
            .unwrap();

        let analysis = analyzer(&ledger).analyze("p1").unwrap();
        assert!((analysis.average_metrics["response_time"] - 3.0).abs() < f64::EPSILON);
        assert!((analysis.average_metrics["tokens"] - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_low_success_rate_flagged() {
        let (_temp, ledger) = setup();
        for i in 0..10 {
            ledger
                .record(&Interaction::new("p1", format!("q{i}"), i < 5))
                .unwrap();
        }

        let analysis = analyzer(&ledger).analyze("p1").unwrap();
        assert!(analysis
            .improvement_opportunities
            .iter()
            .any(|o| o.contains("Low success rate")));
        // 5 failures out of 10 also exceeds the 0.3 failure ratio.
        assert!(analysis
            .improvement_opportunities
            .iter()
            .any(|o| o.contains("High failure rate")));
        assert!(analysis.recommended_changes.is_some());
    }

    #[test]
    fn test_high_response_time_flagged() {
        let (_temp, ledger) = setup();
        for i in 0..4 {
            ledger
                .record(
                    &Interaction::new("p1", format!("q{i}"), true).with_metric("response_time", 6.5),
                )
                .unwrap();
        }

        let analysis = analyzer(&ledger).analyze("p1").unwrap();
        assert!(analysis
            .improvement_opportunities
            .iter()
            .any(|o| o.contains("High response time")));
        // All successes: no other flags.
        assert_eq!(analysis.improvement_opportunities.len(), 1);
    }

    #[test]
    fn test_healthy_prompt_has_no_opportunities() {
        let (_temp, ledger) = setup();
        for i in 0..10 {
            ledger
                .record(
                    &Interaction::new("p1", format!("q{i}"), true).with_metric("response_time", 1.0),
                )
                .unwrap();
        }

        let analysis = analyzer(&ledger).analyze("p1").unwrap();
        assert!(!analysis.needs_attention());
        assert!(analysis.failure_patterns.is_empty());
    }

    #[test]
    fn test_failure_patterns_distinct_and_bounded() {
        let (_temp, ledger) = setup();
        // Seven failures, but only three distinct queries among the
        // most recent ten.
        for i in 0..7 {
            ledger
                .record(&Interaction::new("p1", format!("q{}", i % 3), false))
                .unwrap();
        }

        let analysis = analyzer(&ledger).analyze("p1").unwrap();
        assert_eq!(analysis.failure_patterns.len(), 3);
        // Newest failure is q0 (i=6), then q2, then q1.
        assert_eq!(analysis.failure_patterns[0], "q0");
    }

    #[test]
    fn test_failure_sample_capped_at_five() {
        let (_temp, ledger) = setup();
        for i in 0..12 {
            ledger
                .record(&Interaction::new("p1", format!("distinct-{i}"), false))
                .unwrap();
        }

        let analysis = analyzer(&ledger).analyze("p1").unwrap();
        assert_eq!(analysis.failure_patterns.len(), 5);
    }

    #[test]
    fn test_window_excludes_older_interactions() {
        let (_temp, ledger) = setup();
        let config = AnalysisConfig {
            interaction_limit: 10,
            ..AnalysisConfig::default()
        };
        // 15 failures followed by 10 successes: the window of 10 only
        // sees successes.
        for i in 0..15 {
            ledger
                .record(&Interaction::new("p1", format!("old{i}"), false))
                .unwrap();
        }
        for i in 0..10 {
            ledger
                .record(&Interaction::new("p1", format!("new{i}"), true))
                .unwrap();
        }

        let analyzer = PerformanceAnalyzer::new(&ledger, config);
        let analysis = analyzer.analyze("p1").unwrap();
        assert_eq!(analysis.total_interactions, 10);
        assert!((analysis.success_rate - 1.0).abs() < f64::EPSILON);
    }
}
