//! Prompt refinement: analysis + current content → new version.
//!
//! Refinement is a deterministic content transformation, not a
//! fallible operation: given non-empty content it always produces a
//! result. Guidance sections are only ever appended, never removed, so
//! a prompt's accumulated instructions survive every refinement.

use super::{PromptStore, StoredPrompt};
use crate::analysis::PromptAnalysis;
use crate::error::Result;
use chrono::Utc;
use tracing::info;

/// Hex characters kept from the content digest for version tags.
const VERSION_TAG_LEN: usize = 8;

/// Opportunities listed in the performance-context block.
const TOP_OPPORTUNITIES: usize = 3;

/// Generates improved prompt versions from performance analyses.
///
/// # Example
///
/// ```rust,ignore
/// use learnloop::prompt::{PromptStore, RefinementEngine};
///
/// let store = PromptStore::new("prompts", ".learnloop");
/// let engine = RefinementEngine::new(store.clone(), 0.7);
/// let current = store.require("code-review")?;
/// let improved = engine.refine(&analysis, &current)?;
/// println!("new version: {}", improved.version);
/// ```
#[derive(Debug)]
pub struct RefinementEngine {
    store: PromptStore,
    low_success_threshold: f64,
}

impl RefinementEngine {
    /// Create an engine writing into the given store.
    ///
    /// `low_success_threshold` matches the analyzer's low-success
    /// threshold so guidance blocks and analysis flags stay in step.
    #[must_use]
    pub fn new(store: PromptStore, low_success_threshold: f64) -> Self {
        Self {
            store,
            low_success_threshold,
        }
    }

    /// Produce, persist, and return a refined version of a prompt.
    ///
    /// The new version tag is the md5 digest of the refined content,
    /// truncated to eight hex characters — it changes exactly when the
    /// content changes. The result is appended to the version ledger
    /// and becomes the current document for the prompt id.
    ///
    /// # Errors
    ///
    /// Returns an error only if persisting the new version fails.
    pub fn refine(
        &self,
        analysis: &PromptAnalysis,
        current: &StoredPrompt,
    ) -> Result<StoredPrompt> {
        let content = self.improved_content(analysis, &current.content);
        let version = Self::version_tag(&content);

        let mut improved = current.clone();
        improved.content = content;
        improved.version = version;
        improved.updated_at = Utc::now();
        improved.metadata.insert(
            "refinement".to_string(),
            serde_json::json!({
                "previous_version": current.version,
                "previous_success_rate": analysis.success_rate,
                "total_interactions": analysis.total_interactions,
                "improvements_applied": analysis.improvement_opportunities,
                "refined_at": improved.updated_at,
            }),
        );

        self.store
            .record_version(&improved, Some(analysis.success_rate))?;

        info!(
            prompt_id = %improved.id,
            version = %improved.version,
            success_rate = analysis.success_rate,
            "refined prompt"
        );
        Ok(improved)
    }

    /// Build the refined content without persisting it.
    #[must_use]
    pub fn improved_content(&self, analysis: &PromptAnalysis, content: &str) -> String {
        let mut improved = content.to_string();
        let mut appended = false;

        if analysis.success_rate < self.low_success_threshold {
            improved.push_str(&self.performance_context(analysis));
            appended = true;
        }

        if !analysis.failure_patterns.is_empty() {
            improved.push_str(&Self::observed_scenarios(analysis));
            appended = true;
        }

        // An invoked refinement must always change the content; when
        // neither block fired but opportunities exist, surface them.
        if !appended && !analysis.improvement_opportunities.is_empty() {
            improved.push_str(&Self::tuning_notes(analysis));
        }

        improved
    }

    /// Content-derived version tag.
    #[must_use]
    pub fn version_tag(content: &str) -> String {
        let digest = md5::compute(content.as_bytes());
        let hex = format!("{digest:x}");
        hex[..VERSION_TAG_LEN].to_string()
    }

    fn performance_context(&self, analysis: &PromptAnalysis) -> String {
        let mut block = String::from("\n\n## Performance Context\n");
        block.push_str(&format!(
            "Refined after {} interactions with a {:.1}% success rate.\n",
            analysis.total_interactions,
            analysis.success_rate * 100.0
        ));
        if !analysis.improvement_opportunities.is_empty() {
            block.push_str("Focus areas:\n");
            for opportunity in analysis
                .improvement_opportunities
                .iter()
                .take(TOP_OPPORTUNITIES)
            {
                block.push_str(&format!("- {opportunity}\n"));
            }
        }
        block
    }

    fn observed_scenarios(analysis: &PromptAnalysis) -> String {
        let mut block = String::from("\n\n## Observed Scenarios\n");
        block.push_str("Queries that previously failed and deserve explicit handling:\n");
        for query in &analysis.failure_patterns {
            block.push_str(&format!("- {query}\n"));
        }
        block
    }

    fn tuning_notes(analysis: &PromptAnalysis) -> String {
        let mut block = String::from("\n\n## Tuning Notes\n");
        for opportunity in &analysis.improvement_opportunities {
            block.push_str(&format!("- {opportunity}\n"));
        }
        block
    }
}
