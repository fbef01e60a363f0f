//! Fix application engine: apply, verify, rollback.
//!
//! Applies candidate fixes as literal first-occurrence text
//! replacements, invokes the external build/test verifiers, and rolls
//! the file back when verification fails. Every outcome is recorded in
//! the fix ledger; pattern aggregates learn which issue types fix
//! cleanly.
//!
//! Concurrency note: applies against *different* files are safe to run
//! concurrently. Applies against the same file are not coordinated
//! here; callers needing that must serialize externally.

use super::ledger::FixLedger;
use super::{CodeFix, FixResult, ReviewReport, Severity};
use crate::config::VerificationConfig;
use crate::error::Result;
use crate::verify::{CommandVerifier, NoopVerifier, Verifier};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Engine for applying, verifying, and rolling back code fixes.
///
/// # Example
///
/// ```rust,ignore
/// use learnloop::config::VerificationConfig;
/// use learnloop::fix::{FixEngine, ReviewReport};
///
/// let engine = FixEngine::new(".", ".learnloop", &VerificationConfig::default())?;
/// let report: ReviewReport = serde_json::from_str(&findings_json)?;
/// let results = engine.apply_findings(&report, None, false, true).await?;
/// for result in &results {
///     println!("{}: {}", result.fix_id, result.success);
/// }
/// ```
pub struct FixEngine {
    project_root: PathBuf,
    ledger: FixLedger,
    build_verifier: Box<dyn Verifier>,
    test_verifier: Box<dyn Verifier>,
    build_timeout: Duration,
    test_timeout: Duration,
}

impl FixEngine {
    /// Create an engine with process-spawning verifiers from config.
    ///
    /// A stage with an empty command list is disabled (always passes).
    ///
    /// # Errors
    ///
    /// Returns an error if the state directory handle cannot be set up.
    pub fn new(
        project_root: impl AsRef<Path>,
        state_dir: impl AsRef<Path>,
        verification: &VerificationConfig,
    ) -> Result<Self> {
        let project_root = project_root.as_ref().to_path_buf();

        let build_verifier: Box<dyn Verifier> = if verification.build_command.is_empty() {
            Box::new(NoopVerifier)
        } else {
            Box::new(CommandVerifier::new(
                "build",
                &verification.build_command,
                &project_root,
            )?)
        };
        let test_verifier: Box<dyn Verifier> = if verification.test_command.is_empty() {
            Box::new(NoopVerifier)
        } else {
            Box::new(CommandVerifier::new(
                "tests",
                &verification.test_command,
                &project_root,
            )?)
        };

        Ok(Self {
            project_root,
            ledger: FixLedger::new(state_dir),
            build_verifier,
            test_verifier,
            build_timeout: Duration::from_secs(verification.build_timeout_secs),
            test_timeout: Duration::from_secs(verification.test_timeout_secs),
        })
    }

    /// Create an engine with caller-supplied verifiers.
    #[must_use]
    pub fn with_verifiers(
        project_root: impl AsRef<Path>,
        state_dir: impl AsRef<Path>,
        build_verifier: Box<dyn Verifier>,
        test_verifier: Box<dyn Verifier>,
    ) -> Self {
        Self {
            project_root: project_root.as_ref().to_path_buf(),
            ledger: FixLedger::new(state_dir),
            build_verifier,
            test_verifier,
            build_timeout: Duration::from_secs(300),
            test_timeout: Duration::from_secs(600),
        }
    }

    /// Override the verification timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, build: Duration, tests: Duration) -> Self {
        self.build_timeout = build;
        self.test_timeout = tests;
        self
    }

    /// The underlying fix ledger.
    #[must_use]
    pub fn ledger(&self) -> &FixLedger {
        &self.ledger
    }

    // ------------------------------------------------------------------------
    // Propose
    // ------------------------------------------------------------------------

    /// Map actionable findings into fixes and persist each proposal.
    ///
    /// Findings without `fix_available` or with missing file/old/new
    /// text are silently skipped — incomplete findings are expected
    /// input, not an error.
    pub fn propose(&self, report: &ReviewReport) -> Result<Vec<CodeFix>> {
        let mut fixes = Vec::new();
        for finding in &report.findings {
            if let Some(fix) = CodeFix::from_finding(finding) {
                self.ledger.record_fix(&fix)?;
                fixes.push(fix);
            }
        }
        debug!(
            proposed = fixes.len(),
            skipped = report.findings.len() - fixes.len(),
            "proposed fixes from findings"
        );
        Ok(fixes)
    }

    // ------------------------------------------------------------------------
    // Apply
    // ------------------------------------------------------------------------

    /// Apply a fix to its target file.
    ///
    /// Replaces the *first* literal occurrence of the old span. A dry
    /// run reports what would happen without mutating the file or
    /// recording anything. A diff preview is produced regardless of
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only if recording the outcome fails; apply-time
    /// problems (missing file, diverged content) are reported on the
    /// returned [`FixResult`].
    pub fn apply(&self, fix: &CodeFix, dry_run: bool) -> Result<FixResult> {
        let file_path = self.project_root.join(&fix.file_path);
        let diff_preview = fix.diff_preview();

        if !file_path.exists() {
            let result = FixResult::failure(
                &fix.id,
                diff_preview,
                format!("File not found: {}", file_path.display()),
            );
            if !dry_run {
                self.record_apply_failure(fix, &result)?;
            }
            return Ok(result);
        }

        let content = match std::fs::read_to_string(&file_path) {
            Ok(content) => content,
            Err(e) => {
                let result = FixResult::failure(
                    &fix.id,
                    diff_preview,
                    format!("Failed to read {}: {e}", file_path.display()),
                );
                if !dry_run {
                    self.record_apply_failure(fix, &result)?;
                }
                return Ok(result);
            }
        };

        if !content.contains(&fix.old_code) {
            // The file diverged since the fix was proposed.
            let result = FixResult::failure(
                &fix.id,
                diff_preview,
                "Old code not found in file - may have been modified",
            );
            if !dry_run {
                self.record_apply_failure(fix, &result)?;
            }
            return Ok(result);
        }

        if dry_run {
            return Ok(FixResult::dry_run(&fix.id, diff_preview));
        }

        let new_content = content.replacen(&fix.old_code, &fix.new_code, 1);
        if let Err(e) = std::fs::write(&file_path, new_content) {
            let result = FixResult::failure(
                &fix.id,
                diff_preview,
                format!("Failed to write {}: {e}", file_path.display()),
            );
            self.record_apply_failure(fix, &result)?;
            return Ok(result);
        }

        info!(fix_id = %fix.id, file = %fix.file_path, "applied fix");
        let result = FixResult::applied(&fix.id, diff_preview);
        self.ledger.record_result(&result)?;
        Ok(result)
    }

    fn record_apply_failure(&self, fix: &CodeFix, result: &FixResult) -> Result<()> {
        self.ledger.record_result(result)?;
        self.ledger.update_pattern(fix, false)
    }

    // ------------------------------------------------------------------------
    // Verify
    // ------------------------------------------------------------------------

    /// Verify an applied fix with the build and test verifiers.
    ///
    /// A failed (or never-applied) result is returned unchanged. On a
    /// failed build or test check the fix is rolled back and the
    /// outcome is recorded with `rollback_needed`. Timeouts count as
    /// failures.
    pub async fn verify(&self, fix: &CodeFix, mut result: FixResult) -> Result<FixResult> {
        if !result.success || !result.applied {
            return Ok(result);
        }

        let build = self.build_verifier.run(self.build_timeout).await?;
        if build.passed {
            result.build_passed = Some(true);

            let tests = self.test_verifier.run(self.test_timeout).await?;
            if tests.passed {
                result.tests_passed = Some(true);
            } else {
                warn!(fix_id = %fix.id, "tests failed after fix, rolling back");
                result.tests_passed = Some(false);
                result.rollback_needed = true;
                self.rollback(fix)?;
            }
        } else {
            warn!(fix_id = %fix.id, "build failed after fix, rolling back");
            result.build_passed = Some(false);
            result.rollback_needed = true;
            self.rollback(fix)?;
        }

        self.ledger.record_result(&result)?;
        self.ledger
            .update_pattern(fix, result.verified_success())?;
        Ok(result)
    }

    // ------------------------------------------------------------------------
    // Rollback
    // ------------------------------------------------------------------------

    /// Restore the original text of an applied fix.
    ///
    /// Replaces the first literal occurrence of the new span with the
    /// old span and returns whether the new span was found. When it is
    /// missing (further edits, or a duplicated span where an unrelated
    /// occurrence was replaced) the file is left as-is and `false` is
    /// returned — logged, never escalated. This leniency is a known
    /// gap: rollback can silently no-op or restore the wrong
    /// occurrence if the span is not unique.
    pub fn rollback(&self, fix: &CodeFix) -> Result<bool> {
        let file_path = self.project_root.join(&fix.file_path);

        let content = match std::fs::read_to_string(&file_path) {
            Ok(content) => content,
            Err(e) => {
                warn!(fix_id = %fix.id, "rollback could not read {}: {e}", file_path.display());
                return Ok(false);
            }
        };

        if !content.contains(&fix.new_code) {
            warn!(
                fix_id = %fix.id,
                file = %fix.file_path,
                "rollback target text not found; file left in post-apply state"
            );
            return Ok(false);
        }

        let restored = content.replacen(&fix.new_code, &fix.old_code, 1);
        match std::fs::write(&file_path, restored) {
            Ok(()) => {
                info!(fix_id = %fix.id, file = %fix.file_path, "rolled back fix");
                Ok(true)
            }
            Err(e) => {
                warn!(fix_id = %fix.id, "rollback could not write {}: {e}", file_path.display());
                Ok(false)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Batch application
    // ------------------------------------------------------------------------

    /// Propose, filter, apply, and (optionally) verify a findings batch.
    ///
    /// Fixes are filtered to the requested severities (default:
    /// critical and high) and applied in proposal order; unless
    /// `dry_run` is set or `auto_verify` cleared, each successful apply
    /// is verified before the next fix is attempted. Returns one result
    /// per filtered fix.
    pub async fn apply_findings(
        &self,
        report: &ReviewReport,
        severity_filter: Option<&[Severity]>,
        dry_run: bool,
        auto_verify: bool,
    ) -> Result<Vec<FixResult>> {
        let default_filter = Severity::default_filter();
        let filter = severity_filter.unwrap_or(&default_filter);

        let fixes = self.propose(report)?;
        let filtered: Vec<&CodeFix> = fixes
            .iter()
            .filter(|f| filter.contains(&f.severity))
            .collect();

        let mut results = Vec::with_capacity(filtered.len());
        for fix in filtered {
            let mut result = self.apply(fix, dry_run)?;
            if auto_verify && !dry_run && result.success {
                result = self.verify(fix, result).await?;
            }
            results.push(result);
        }
        Ok(results)
    }

    /// Efficacy statistics over the fix ledger.
    pub fn efficacy_stats(&self) -> Result<super::FixEfficacy> {
        self.ledger.efficacy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::{FixState, ReviewFinding};
    use crate::testing::MockVerifier;
    use tempfile::TempDir;

    fn engine_with(build_passes: bool, tests_pass: bool) -> (TempDir, FixEngine) {
        let temp = TempDir::new().unwrap();
        let engine = FixEngine::with_verifiers(
            temp.path(),
            temp.path().join(".learnloop"),
            Box::new(MockVerifier::new("build").with_passed(build_passes)),
            Box::new(MockVerifier::new("tests").with_passed(tests_pass)),
        );
        (temp, engine)
    }

    fn write_source(temp: &TempDir, name: &str, content: &str) {
        std::fs::write(temp.path().join(name), content).unwrap();
    }

    fn fix_for(file: &str, old: &str, new: &str) -> CodeFix {
        CodeFix::from_finding(&ReviewFinding {
            file: file.to_string(),
            issue_type: "null-check".to_string(),
            severity: Severity::Critical,
            description: "test fix".to_string(),
            old_code: old.to_string(),
            new_code: new.to_string(),
            line_start: 1,
            line_end: 1,
            confidence: 0.9,
            fix_available: true,
        })
        .unwrap()
    }

    #[test]
    fn test_apply_replaces_first_occurrence_only() {
        let (temp, engine) = engine_with(true, true);
        write_source(&temp, "a.c", "foo();\nfoo();\n");
        let fix = fix_for("a.c", "foo();", "bar();");

        let result = engine.apply(&fix, false).unwrap();
        assert!(result.success && result.applied);

        let content = std::fs::read_to_string(temp.path().join("a.c")).unwrap();
        assert_eq!(content, "bar();\nfoo();\n");
    }

    #[test]
    fn test_apply_missing_file() {
        let (_temp, engine) = engine_with(true, true);
        let fix = fix_for("missing.c", "foo()", "bar()");

        let result = engine.apply(&fix, false).unwrap();
        assert!(!result.success);
        assert!(result.error_message.as_deref().unwrap().contains("File not found"));
        assert_eq!(
            engine.ledger().state_of(&fix.id).unwrap(),
            Some(FixState::ApplyFailed)
        );
    }

    #[test]
    fn test_apply_stale_old_code() {
        let (temp, engine) = engine_with(true, true);
        write_source(&temp, "a.c", "bar();\n");
        let fix = fix_for("a.c", "foo()", "baz()");

        let result = engine.apply(&fix, false).unwrap();
        assert!(!result.success);
        assert!(result
            .error_message
            .as_deref()
            .unwrap()
            .contains("Old code not found"));

        // File untouched, ledger shows the apply never happened.
        let content = std::fs::read_to_string(temp.path().join("a.c")).unwrap();
        assert_eq!(content, "bar();\n");
        let stats = engine.efficacy_stats().unwrap();
        assert_eq!(stats.applied, 0);
    }

    #[test]
    fn test_dry_run_is_idempotent() {
        let (temp, engine) = engine_with(true, true);
        write_source(&temp, "a.c", "foo();\n");
        let fix = fix_for("a.c", "foo();", "bar();");
        engine.ledger().record_fix(&fix).unwrap();

        for _ in 0..3 {
            let result = engine.apply(&fix, true).unwrap();
            assert!(result.success);
            assert!(!result.applied);
        }

        let content = std::fs::read_to_string(temp.path().join("a.c")).unwrap();
        assert_eq!(content, "foo();\n");
        assert_eq!(
            engine.ledger().state_of(&fix.id).unwrap(),
            Some(FixState::Proposed)
        );
    }

    #[test]
    fn test_diff_preview_present_on_failure() {
        let (_temp, engine) = engine_with(true, true);
        let fix = fix_for("missing.c", "foo()", "bar()");
        let result = engine.apply(&fix, false).unwrap();
        assert!(result.diff_preview.contains("--- a/missing.c"));
    }

    #[tokio::test]
    async fn test_verify_success_records_both_passes() {
        let (temp, engine) = engine_with(true, true);
        write_source(&temp, "a.c", "foo();\n");
        let fix = fix_for("a.c", "foo();", "bar();");

        let result = engine.apply(&fix, false).unwrap();
        let result = engine.verify(&fix, result).await.unwrap();

        assert_eq!(result.build_passed, Some(true));
        assert_eq!(result.tests_passed, Some(true));
        assert!(!result.rollback_needed);
        assert!(result.verified_success());
        assert_eq!(
            engine.ledger().state_of(&fix.id).unwrap(),
            Some(FixState::VerifiedSuccess)
        );
    }

    #[tokio::test]
    async fn test_verify_build_failure_rolls_back_and_restores_file() {
        let (temp, engine) = engine_with(false, true);
        let original = "int main() { foo(); }\n";
        write_source(&temp, "a.c", original);
        let fix = fix_for("a.c", "foo();", "bar();");

        let result = engine.apply(&fix, false).unwrap();
        let result = engine.verify(&fix, result).await.unwrap();

        assert_eq!(result.build_passed, Some(false));
        assert!(result.tests_passed.is_none());
        assert!(result.rollback_needed);

        // Round-trip law: file content equals the pre-apply content.
        let content = std::fs::read_to_string(temp.path().join("a.c")).unwrap();
        assert_eq!(content, original);
    }

    #[tokio::test]
    async fn test_verify_test_failure_rolls_back() {
        let (temp, engine) = engine_with(true, false);
        write_source(&temp, "a.c", "foo();\n");
        let fix = fix_for("a.c", "foo();", "bar();");

        let result = engine.apply(&fix, false).unwrap();
        let result = engine.verify(&fix, result).await.unwrap();

        assert_eq!(result.build_passed, Some(true));
        assert_eq!(result.tests_passed, Some(false));
        assert!(result.rollback_needed);
        assert_eq!(
            engine.ledger().state_of(&fix.id).unwrap(),
            Some(FixState::RolledBack)
        );
    }

    #[tokio::test]
    async fn test_verify_failure_increments_pattern_failure_count() {
        let (temp, engine) = engine_with(false, true);
        write_source(&temp, "a.c", "foo();\n");
        let fix = fix_for("a.c", "foo();", "bar();");

        let result = engine.apply(&fix, false).unwrap();
        engine.verify(&fix, result).await.unwrap();

        let patterns = engine.ledger().load_patterns().unwrap();
        let pattern = patterns.values().next().unwrap();
        assert_eq!(pattern.issue_type, "null-check");
        assert_eq!(pattern.failure_count, 1);
        assert_eq!(pattern.success_count, 0);
    }

    #[tokio::test]
    async fn test_verify_skips_failed_apply() {
        let (_temp, engine) = engine_with(true, true);
        let fix = fix_for("missing.c", "foo()", "bar()");

        let result = engine.apply(&fix, false).unwrap();
        let verified = engine.verify(&fix, result.clone()).await.unwrap();

        assert!(!verified.success);
        assert!(verified.build_passed.is_none());
    }

    #[test]
    fn test_rollback_returns_false_when_text_missing() {
        let (temp, engine) = engine_with(true, true);
        write_source(&temp, "a.c", "something else entirely\n");
        let fix = fix_for("a.c", "foo();", "bar();");

        assert!(!engine.rollback(&fix).unwrap());
        // File untouched.
        let content = std::fs::read_to_string(temp.path().join("a.c")).unwrap();
        assert_eq!(content, "something else entirely\n");
    }

    #[tokio::test]
    async fn test_apply_findings_severity_filter() {
        let (temp, engine) = engine_with(true, true);
        write_source(&temp, "a.c", "foo();\nbaz();\n");

        let report = ReviewReport {
            findings: vec![
                ReviewFinding {
                    file: "a.c".to_string(),
                    issue_type: "overflow".to_string(),
                    severity: Severity::Critical,
                    description: "critical".to_string(),
                    old_code: "foo();".to_string(),
                    new_code: "foo_checked();".to_string(),
                    line_start: 1,
                    line_end: 1,
                    confidence: 0.9,
                    fix_available: true,
                },
                ReviewFinding {
                    file: "a.c".to_string(),
                    issue_type: "style".to_string(),
                    severity: Severity::Medium,
                    description: "medium".to_string(),
                    old_code: "baz();".to_string(),
                    new_code: "baz_2();".to_string(),
                    line_start: 2,
                    line_end: 2,
                    confidence: 0.9,
                    fix_available: true,
                },
            ],
        };

        let results = engine
            .apply_findings(&report, Some(&[Severity::Critical]), false, true)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].verified_success());

        // The medium fix was proposed but never applied.
        let stats = engine.efficacy_stats().unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.applied, 1);
    }

    #[tokio::test]
    async fn test_apply_findings_skips_unavailable_fixes() {
        let (temp, engine) = engine_with(true, true);
        write_source(&temp, "a.c", "foo();\n");

        let report = ReviewReport {
            findings: vec![ReviewFinding {
                file: "a.c".to_string(),
                issue_type: "overflow".to_string(),
                severity: Severity::Critical,
                description: "no fix offered".to_string(),
                old_code: "foo();".to_string(),
                new_code: String::new(),
                line_start: 1,
                line_end: 1,
                confidence: 0.5,
                fix_available: false,
            }],
        };

        let results = engine
            .apply_findings(&report, None, false, true)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_apply_findings_dry_run_touches_nothing() {
        let (temp, engine) = engine_with(false, false);
        write_source(&temp, "a.c", "foo();\n");

        let report = ReviewReport {
            findings: vec![ReviewFinding {
                file: "a.c".to_string(),
                issue_type: "overflow".to_string(),
                severity: Severity::High,
                description: "d".to_string(),
                old_code: "foo();".to_string(),
                new_code: "bar();".to_string(),
                line_start: 1,
                line_end: 1,
                confidence: 0.9,
                fix_available: true,
            }],
        };

        let results = engine
            .apply_findings(&report, None, true, true)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].success);
        assert!(!results[0].applied);
        // Failing verifiers were never consulted on a dry run.
        assert!(results[0].build_passed.is_none());

        let content = std::fs::read_to_string(temp.path().join("a.c")).unwrap();
        assert_eq!(content, "foo();\n");
    }
}
