//! The learning loop orchestrator.
//!
//! [`LearningLoop`] owns no state of its own — it is a stateless
//! coordinator over the interaction ledger, the prompt store, and the
//! fix engine. Recording an interaction periodically triggers analysis
//! and, when a prompt underperforms, refinement; applied fixes feed
//! their outcomes back into the interaction ledger so both halves of
//! the loop share one efficacy report.

use crate::analysis::{PerformanceAnalyzer, PromptAnalysis};
use crate::config::LoopConfig;
use crate::error::Result;
use crate::fix::{FixEfficacy, FixEngine, FixResult, ReviewReport, Severity};
use crate::interaction::{Interaction, InteractionLedger, LedgerStats};
use crate::prompt::{PromptStore, RefinementEngine, StoredPrompt, INITIAL_VERSION};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Reserved prompt id under which fix outcomes are recorded.
pub const FIX_FEEDBACK_PROMPT_ID: &str = "code-fix-engine";

/// Characters of diff preview kept on feedback interactions.
const FEEDBACK_DIFF_LIMIT: usize = 500;

/// Parameters for recording one interaction.
///
/// Prompt version and content are resolved from the store when not
/// supplied explicitly.
#[derive(Debug, Clone)]
pub struct RecordRequest {
    /// Prompt identifier.
    pub prompt_id: String,
    /// The query the prompt was applied to.
    pub query: String,
    /// Outcome flag.
    pub success: bool,
    /// Named metrics.
    pub metrics: HashMap<String, serde_json::Value>,
    /// Variable bindings.
    pub variables: HashMap<String, serde_json::Value>,
    /// Response text.
    pub response: String,
    /// Optional free-text feedback.
    pub feedback: Option<String>,
    /// Optional improvement suggestions.
    pub suggestions: Option<Vec<String>>,
    /// Explicit prompt version (skips store resolution).
    pub prompt_version: Option<String>,
    /// Explicit prompt content snapshot (skips store resolution).
    pub prompt_content: Option<String>,
}

impl RecordRequest {
    /// Create a request with the required fields.
    #[must_use]
    pub fn new(prompt_id: impl Into<String>, query: impl Into<String>, success: bool) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            query: query.into(),
            success,
            metrics: HashMap::new(),
            variables: HashMap::new(),
            response: String::new(),
            feedback: None,
            suggestions: None,
            prompt_version: None,
            prompt_content: None,
        }
    }

    /// Set the metrics map.
    #[must_use]
    pub fn with_metrics(mut self, metrics: HashMap<String, serde_json::Value>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Set the response text.
    #[must_use]
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }

    /// Set free-text feedback.
    #[must_use]
    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }
}

/// What recording an interaction produced.
#[derive(Debug)]
pub struct RecordOutcome {
    /// Per-prompt interaction count after the append.
    pub interaction_count: u64,
    /// New prompt version, when recording triggered a refinement.
    pub refined: Option<StoredPrompt>,
}

/// Result of an `improve-all` sweep.
#[derive(Debug, Default)]
pub struct ImproveAllSummary {
    /// Prompts examined.
    pub examined: usize,
    /// Prompts that produced a new version.
    pub refined: usize,
    /// Per-prompt failures, degraded to warnings.
    pub errors: Vec<(String, String)>,
}

/// Combined efficacy over both ledgers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EfficacyReport {
    /// Global interaction statistics.
    pub prompts: LedgerStats,
    /// Fix ledger efficacy.
    pub fixes: FixEfficacy,
    /// Mean of the two success rates; the prompt rate alone when no
    /// fixes have been applied yet.
    pub overall_efficacy: f64,
    /// Recorded interactions plus applied fixes.
    pub total_improvements: u64,
}

impl EfficacyReport {
    /// Render the report for terminal display.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("\n{}\n", "=".repeat(60)));
        out.push_str(&format!(
            "{}\n",
            "       LEARNING LOOP EFFICACY REPORT".bold()
        ));
        out.push_str(&format!("{}\n", "=".repeat(60)));

        out.push_str(&format!("\n{}\n", "Prompt Performance:".cyan().bold()));
        out.push_str(&format!(
            "   Total interactions: {}\n",
            self.prompts.total_interactions
        ));
        out.push_str(&format!(
            "   Unique prompts: {}\n",
            self.prompts.total_prompts
        ));
        out.push_str(&format!(
            "   Success rate: {:.1}%\n",
            self.prompts.avg_success_rate * 100.0
        ));

        out.push_str(&format!("\n{}\n", "Code Fix Performance:".cyan().bold()));
        out.push_str(&format!("   Total fixes recorded: {}\n", self.fixes.total));
        out.push_str(&format!("   Applied fixes: {}\n", self.fixes.applied));
        out.push_str(&format!(
            "   Successful fixes: {}\n",
            self.fixes.successful
        ));
        out.push_str(&format!(
            "   Success rate: {:.1}%\n",
            self.fixes.success_rate * 100.0
        ));
        out.push_str(&format!(
            "   Rollback rate: {:.1}%\n",
            self.fixes.rollback_rate * 100.0
        ));

        if !self.fixes.by_issue_type.is_empty() {
            out.push_str("\n   By Issue Type:\n");
            let mut types: Vec<_> = self.fixes.by_issue_type.iter().collect();
            types.sort_by(|a, b| a.0.cmp(b.0));
            for (issue_type, stats) in types {
                out.push_str(&format!(
                    "     {}: {}/{} ({:.1}%)\n",
                    issue_type,
                    stats.success,
                    stats.total,
                    stats.rate * 100.0
                ));
            }
        }

        out.push_str(&format!("\n{}\n", "Combined Metrics:".cyan().bold()));
        out.push_str(&format!(
            "   Total improvements applied: {}\n",
            self.total_improvements
        ));
        out.push_str(&format!(
            "   Overall efficacy: {:.1}%\n",
            self.overall_efficacy * 100.0
        ));
        out.push_str(&format!("{}\n", "=".repeat(60)));
        out
    }
}

/// Stateless coordinator over the ledgers, store, and fix engine.
///
/// # Example
///
/// ```rust,ignore
/// use learnloop::config::LoopConfig;
/// use learnloop::learning::{LearningLoop, RecordRequest};
///
/// let config = LoopConfig::load(".")?;
/// let learning = LearningLoop::new(".", config)?;
///
/// let outcome = learning.record_interaction(
///     RecordRequest::new("code-review", "review src/main.rs", true),
/// )?;
/// if let Some(refined) = outcome.refined {
///     println!("prompt refined to version {}", refined.version);
/// }
/// ```
pub struct LearningLoop {
    project_dir: PathBuf,
    config: LoopConfig,
    ledger: InteractionLedger,
    store: PromptStore,
    engine: FixEngine,
}

impl LearningLoop {
    /// Create a loop for a project directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the fix
    /// engine's verifiers cannot be constructed.
    pub fn new(project_dir: impl AsRef<Path>, config: LoopConfig) -> Result<Self> {
        config.validate()?;

        let project_dir = project_dir.as_ref().to_path_buf();
        let state_dir = config.state_dir_in(&project_dir);
        let prompts_dir = config.prompts_dir_in(&project_dir);

        let ledger = InteractionLedger::new(&state_dir);
        let store = PromptStore::new(&prompts_dir, &state_dir);
        let engine = FixEngine::new(&project_dir, &state_dir, &config.verification)?;

        Ok(Self {
            project_dir,
            config,
            ledger,
            store,
            engine,
        })
    }

    /// Replace the fix engine (used to inject mock verifiers in tests).
    #[must_use]
    pub fn with_fix_engine(mut self, engine: FixEngine) -> Self {
        self.engine = engine;
        self
    }

    /// The project directory this loop operates on.
    #[must_use]
    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// The interaction ledger.
    #[must_use]
    pub fn ledger(&self) -> &InteractionLedger {
        &self.ledger
    }

    /// The prompt store.
    #[must_use]
    pub fn store(&self) -> &PromptStore {
        &self.store
    }

    /// The fix engine.
    #[must_use]
    pub fn fix_engine(&self) -> &FixEngine {
        &self.engine
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    /// Record an interaction; analyze and conditionally refine when the
    /// per-prompt count reaches a multiple of the configured cadence.
    ///
    /// Analysis runs inline on the calling thread; callers needing
    /// non-blocking recording must offload this themselves.
    pub fn record_interaction(&self, request: RecordRequest) -> Result<RecordOutcome> {
        let (version, content) = self.resolve_prompt(&request)?;

        let mut interaction = Interaction::new(&request.prompt_id, &request.query, request.success)
            .with_prompt(version, content)
            .with_response(request.response.clone())
            .with_metrics(request.metrics.clone())
            .with_variables(request.variables.clone());
        interaction.feedback = request.feedback.clone();
        interaction.suggestions = request.suggestions.clone();

        self.ledger.record(&interaction)?;

        let count = self.ledger.count_for_prompt(&request.prompt_id)?;
        let refined = if count % self.config.refinement.analyze_every == 0 {
            self.analyze_and_improve(&request.prompt_id)?
        } else {
            None
        };

        Ok(RecordOutcome {
            interaction_count: count,
            refined,
        })
    }

    fn resolve_prompt(&self, request: &RecordRequest) -> Result<(String, String)> {
        if let (Some(version), Some(content)) = (&request.prompt_version, &request.prompt_content) {
            return Ok((version.clone(), content.clone()));
        }

        // Unknown prompts are recorded with placeholder provenance; the
        // ledger never rejects an outcome report.
        match self.store.load(&request.prompt_id)? {
            Some(prompt) => Ok((prompt.version, prompt.content)),
            None => Ok((INITIAL_VERSION.to_string(), String::new())),
        }
    }

    // ------------------------------------------------------------------------
    // Analysis & refinement
    // ------------------------------------------------------------------------

    /// Analyze a prompt's recent performance.
    pub fn analyze(&self, prompt_id: &str) -> Result<PromptAnalysis> {
        PerformanceAnalyzer::new(&self.ledger, self.config.analysis.clone()).analyze(prompt_id)
    }

    /// Analyze a prompt and refine it when it underperforms.
    ///
    /// Refinement is skipped when fewer than the configured minimum
    /// interactions exist (the analysis is too thin to act on), when
    /// the prompt document is missing, or when the prompt is performing
    /// well with nothing flagged.
    pub fn analyze_and_improve(&self, prompt_id: &str) -> Result<Option<StoredPrompt>> {
        let analysis = self.analyze(prompt_id)?;

        if analysis.total_interactions < self.config.refinement.min_interactions {
            debug!(
                prompt_id,
                total = analysis.total_interactions,
                "not enough data for improvement yet"
            );
            return Ok(None);
        }

        let Some(current) = self.store.load(prompt_id)? else {
            warn!(prompt_id, "prompt document not found, skipping refinement");
            return Ok(None);
        };

        if analysis.success_rate < self.config.refinement.refine_below
            || analysis.needs_attention()
        {
            let engine = RefinementEngine::new(
                self.store.clone(),
                self.config.analysis.low_success_threshold,
            );
            let improved = engine.refine(&analysis, &current)?;
            Ok(Some(improved))
        } else {
            debug!(
                prompt_id,
                success_rate = analysis.success_rate,
                "prompt performing well"
            );
            Ok(None)
        }
    }

    /// Identifiers of all prompts in the store.
    pub fn prompt_ids(&self) -> Result<Vec<String>> {
        self.store.list_ids()
    }

    /// Run analysis and conditional refinement over every prompt.
    ///
    /// Per-prompt failures degrade to entries in the summary; a broken
    /// document must not abort the sweep.
    pub fn improve_all(&self) -> Result<ImproveAllSummary> {
        let mut summary = ImproveAllSummary::default();
        for prompt_id in self.prompt_ids()? {
            summary.examined += 1;
            match self.analyze_and_improve(&prompt_id) {
                Ok(Some(_)) => summary.refined += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(prompt_id = %prompt_id, "improvement failed: {e}");
                    summary.errors.push((prompt_id, e.to_string()));
                }
            }
        }
        info!(
            examined = summary.examined,
            refined = summary.refined,
            "improvement cycle complete"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------------
    // Fix application
    // ------------------------------------------------------------------------

    /// Apply fixes from review findings and feed outcomes back into the
    /// interaction ledger under [`FIX_FEEDBACK_PROMPT_ID`].
    pub async fn apply_fixes(
        &self,
        report: &ReviewReport,
        severity_filter: Option<&[Severity]>,
        dry_run: bool,
    ) -> Result<Vec<FixResult>> {
        let results = self
            .engine
            .apply_findings(report, severity_filter, dry_run, !dry_run)
            .await?;

        for result in &results {
            let preview: String = result
                .diff_preview
                .chars()
                .take(FEEDBACK_DIFF_LIMIT)
                .collect();

            let mut metrics = HashMap::new();
            metrics.insert(
                "build_passed".to_string(),
                serde_json::json!(result.build_passed.unwrap_or(false)),
            );
            metrics.insert(
                "tests_passed".to_string(),
                serde_json::json!(result.tests_passed.unwrap_or(false)),
            );
            metrics.insert(
                "rollback_needed".to_string(),
                serde_json::json!(result.rollback_needed),
            );

            let mut variables = HashMap::new();
            variables.insert("dry_run".to_string(), serde_json::json!(dry_run));

            let mut request = RecordRequest::new(
                FIX_FEEDBACK_PROMPT_ID,
                format!("Apply fix {}", result.fix_id),
                result.verified_success(),
            )
            .with_metrics(metrics)
            .with_response(preview);
            request.variables = variables;

            self.record_interaction(request)?;
        }

        Ok(results)
    }

    // ------------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------------

    /// Combined efficacy over both ledgers.
    pub fn efficacy_report(&self) -> Result<EfficacyReport> {
        let prompts = self.ledger.statistics()?;
        let fixes = self.engine.efficacy_stats()?;

        let overall_efficacy = if fixes.applied == 0 {
            prompts.avg_success_rate
        } else {
            (prompts.avg_success_rate + fixes.success_rate) / 2.0
        };

        Ok(EfficacyReport {
            total_improvements: prompts.total_interactions + fixes.applied,
            prompts,
            fixes,
            overall_efficacy,
        })
    }
}
