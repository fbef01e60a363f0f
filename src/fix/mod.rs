//! Code fix types: candidate edits, apply results, and the findings
//! input contract.
//!
//! A [`CodeFix`] is a proposed textual edit (old span → new span) to a
//! specific file, derived from review findings. Each fix moves through
//! `proposed → applied → {verified_success | rolled_back}`, with
//! `apply_failed` as a terminal state reachable directly from
//! `proposed`. No transition leaves a terminal state.

pub mod engine;
pub mod ledger;

pub use engine::FixEngine;
pub use ledger::{FixEfficacy, FixLedger, FixPattern, IssueTypeStats};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Hex characters kept from the digest for fix ids.
const FIX_ID_LEN: usize = 12;

/// Severity of the issue a fix addresses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Must be fixed immediately.
    Critical,
    /// Should be fixed before release.
    High,
    /// Worth fixing when touching the area.
    #[default]
    Medium,
    /// Cosmetic or stylistic.
    Low,
}

impl Severity {
    /// String form matching the wire format.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    /// Default filter applied when the caller does not choose: only the
    /// severities worth auto-fixing unattended.
    #[must_use]
    pub fn default_filter() -> Vec<Self> {
        vec![Self::Critical, Self::High]
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One candidate fix from the external review-findings provider.
///
/// Unknown fields are ignored; absent severity defaults to medium and
/// absent confidence to 0.8.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFinding {
    /// Target file path, relative to the project root.
    #[serde(default)]
    pub file: String,
    /// Issue category (e.g. `null-check`, `buffer-overflow`).
    #[serde(rename = "type", default = "default_issue_type")]
    pub issue_type: String,
    /// Issue severity.
    #[serde(default)]
    pub severity: Severity,
    /// Human description of the issue.
    #[serde(default)]
    pub description: String,
    /// Exact text to replace.
    #[serde(default)]
    pub old_code: String,
    /// Replacement text.
    #[serde(default)]
    pub new_code: String,
    /// First affected line.
    #[serde(default)]
    pub line_start: u32,
    /// Last affected line.
    #[serde(default)]
    pub line_end: u32,
    /// Provider confidence in the fix, [0, 1].
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Whether the provider supplied an actionable fix.
    #[serde(default)]
    pub fix_available: bool,
}

fn default_issue_type() -> String {
    "unknown".to_string()
}

fn default_confidence() -> f64 {
    0.8
}

/// A findings document as emitted by the review provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewReport {
    /// Candidate fixes, in provider order.
    #[serde(default)]
    pub findings: Vec<ReviewFinding>,
}

/// A proposed code edit, immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeFix {
    /// Content-addressed identifier (`fix-` + truncated sha256).
    pub id: String,
    /// Target file path, relative to the project root.
    pub file_path: String,
    /// Issue category.
    pub issue_type: String,
    /// Issue severity.
    pub severity: Severity,
    /// Human description.
    pub description: String,
    /// Exact text span to replace.
    pub old_code: String,
    /// Replacement text span.
    pub new_code: String,
    /// First affected line.
    pub line_start: u32,
    /// Last affected line.
    pub line_end: u32,
    /// Provider confidence, [0, 1].
    pub confidence: f64,
}

impl CodeFix {
    /// Build a fix from a finding.
    ///
    /// Returns `None` for findings that are not actionable: missing
    /// `fix_available`, or an empty file path / old span / new span.
    #[must_use]
    pub fn from_finding(finding: &ReviewFinding) -> Option<Self> {
        if !finding.fix_available
            || finding.file.is_empty()
            || finding.old_code.is_empty()
            || finding.new_code.is_empty()
        {
            return None;
        }

        Some(Self {
            id: Self::content_id(
                &finding.file,
                &finding.old_code,
                &finding.new_code,
                finding.line_start,
            ),
            file_path: finding.file.clone(),
            issue_type: finding.issue_type.clone(),
            severity: finding.severity,
            description: finding.description.clone(),
            old_code: finding.old_code.clone(),
            new_code: finding.new_code.clone(),
            line_start: finding.line_start,
            line_end: finding.line_end,
            confidence: finding.confidence,
        })
    }

    /// Content-addressed id over the normalized identity tuple.
    #[must_use]
    pub fn content_id(file: &str, old_code: &str, new_code: &str, line_start: u32) -> String {
        let mut hasher = Sha256::new();
        hasher.update(file.as_bytes());
        hasher.update([0]);
        hasher.update(old_code.as_bytes());
        hasher.update([0]);
        hasher.update(new_code.as_bytes());
        hasher.update([0]);
        hasher.update(line_start.to_le_bytes());
        let digest = hasher.finalize();
        format!("fix-{}", &hex::encode(digest)[..FIX_ID_LEN])
    }

    /// Unified-style diff preview: file header plus old/new line blocks.
    #[must_use]
    pub fn diff_preview(&self) -> String {
        let old_lines: Vec<&str> = self.old_code.split('\n').collect();
        let new_lines: Vec<&str> = self.new_code.split('\n').collect();

        let mut diff = Vec::with_capacity(3 + old_lines.len() + new_lines.len());
        diff.push(format!("--- a/{}", self.file_path));
        diff.push(format!("+++ b/{}", self.file_path));
        diff.push(format!(
            "@@ -{},{} +{},{} @@",
            self.line_start,
            old_lines.len(),
            self.line_start,
            new_lines.len()
        ));
        for line in old_lines {
            diff.push(format!("-{line}"));
        }
        for line in new_lines {
            diff.push(format!("+{line}"));
        }
        diff.join("\n")
    }
}

/// Outcome of one apply attempt against a single fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixResult {
    /// The fix this result belongs to.
    pub fix_id: String,
    /// Whether the apply step itself succeeded.
    pub success: bool,
    /// Whether the file was actually mutated (false for dry runs and
    /// failed applies).
    pub applied: bool,
    /// When the attempt was made.
    pub applied_at: DateTime<Utc>,
    /// Diff preview, produced regardless of outcome.
    pub diff_preview: String,
    /// Error text for failed applies or dry-run annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Build verifier outcome, once verification ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_passed: Option<bool>,
    /// Test verifier outcome, once verification ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests_passed: Option<bool>,
    /// Whether verification failed and the fix was rolled back.
    #[serde(default)]
    pub rollback_needed: bool,
}

impl FixResult {
    /// A successful apply (file mutated, not yet verified).
    #[must_use]
    pub fn applied(fix_id: impl Into<String>, diff_preview: String) -> Self {
        Self {
            fix_id: fix_id.into(),
            success: true,
            applied: true,
            applied_at: Utc::now(),
            diff_preview,
            error_message: None,
            build_passed: None,
            tests_passed: None,
            rollback_needed: false,
        }
    }

    /// A successful dry run (nothing mutated).
    #[must_use]
    pub fn dry_run(fix_id: impl Into<String>, diff_preview: String) -> Self {
        Self {
            fix_id: fix_id.into(),
            success: true,
            applied: false,
            applied_at: Utc::now(),
            diff_preview,
            error_message: Some("Dry run - not applied".to_string()),
            build_passed: None,
            tests_passed: None,
            rollback_needed: false,
        }
    }

    /// A failed apply.
    #[must_use]
    pub fn failure(
        fix_id: impl Into<String>,
        diff_preview: String,
        error: impl Into<String>,
    ) -> Self {
        Self {
            fix_id: fix_id.into(),
            success: false,
            applied: false,
            applied_at: Utc::now(),
            diff_preview,
            error_message: Some(error.into()),
            build_passed: None,
            tests_passed: None,
            rollback_needed: false,
        }
    }

    /// Whether the fix survived apply *and* verification.
    #[must_use]
    pub fn verified_success(&self) -> bool {
        self.success && !self.rollback_needed
    }
}

/// Lifecycle state of a fix, derived from its ledger records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixState {
    /// Recorded, not yet attempted.
    Proposed,
    /// File mutated, verification pending or skipped.
    Applied,
    /// Applied and verification passed. Terminal.
    VerifiedSuccess,
    /// Applied, verification failed, restore attempted. Terminal.
    RolledBack,
    /// The edit could not be applied at all. Terminal.
    ApplyFailed,
}

impl FixState {
    /// Whether no further transitions can leave this state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::VerifiedSuccess | Self::RolledBack | Self::ApplyFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding() -> ReviewFinding {
        ReviewFinding {
            file: "src/audio.cpp".to_string(),
            issue_type: "null-check".to_string(),
            severity: Severity::High,
            description: "missing null check".to_string(),
            old_code: "ptr->process();".to_string(),
            new_code: "if (ptr) { ptr->process(); }".to_string(),
            line_start: 42,
            line_end: 42,
            confidence: 0.9,
            fix_available: true,
        }
    }

    #[test]
    fn test_from_finding_builds_fix() {
        let fix = CodeFix::from_finding(&finding()).unwrap();
        assert_eq!(fix.file_path, "src/audio.cpp");
        assert_eq!(fix.severity, Severity::High);
        assert!(fix.id.starts_with("fix-"));
        assert_eq!(fix.id.len(), 4 + 12);
    }

    #[test]
    fn test_from_finding_skips_unavailable() {
        let mut f = finding();
        f.fix_available = false;
        assert!(CodeFix::from_finding(&f).is_none());
    }

    #[test]
    fn test_from_finding_skips_missing_spans() {
        let mut f = finding();
        f.old_code = String::new();
        assert!(CodeFix::from_finding(&f).is_none());

        let mut f = finding();
        f.new_code = String::new();
        assert!(CodeFix::from_finding(&f).is_none());

        let mut f = finding();
        f.file = String::new();
        assert!(CodeFix::from_finding(&f).is_none());
    }

    #[test]
    fn test_content_id_is_stable_and_collision_sensitive() {
        let a = CodeFix::content_id("f.rs", "old", "new", 1);
        let b = CodeFix::content_id("f.rs", "old", "new", 1);
        let c = CodeFix::content_id("f.rs", "old", "new", 2);
        let d = CodeFix::content_id("f.rs", "oldn", "ew", 1);

        assert_eq!(a, b);
        assert_ne!(a, c);
        // The separator keeps concatenation ambiguity from colliding.
        assert_ne!(a, d);
    }

    #[test]
    fn test_finding_deserialization_defaults() {
        let json = r#"{"file": "a.c", "old_code": "x", "new_code": "y", "fix_available": true}"#;
        let f: ReviewFinding = serde_json::from_str(json).unwrap();
        assert_eq!(f.severity, Severity::Medium);
        assert!((f.confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(f.issue_type, "unknown");
    }

    #[test]
    fn test_severity_wire_format() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
        let s: Severity = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(s, Severity::Low);
    }

    #[test]
    fn test_diff_preview_shape() {
        let fix = CodeFix::from_finding(&finding()).unwrap();
        let diff = fix.diff_preview();

        assert!(diff.contains("--- a/src/audio.cpp"));
        assert!(diff.contains("+++ b/src/audio.cpp"));
        assert!(diff.contains("@@ -42,1 +42,1 @@"));
        assert!(diff.contains("-ptr->process();"));
        assert!(diff.contains("+if (ptr) { ptr->process(); }"));
    }

    #[test]
    fn test_fix_result_constructors() {
        let applied = FixResult::applied("fix-1", String::new());
        assert!(applied.success && applied.applied);
        assert!(applied.verified_success());

        let dry = FixResult::dry_run("fix-1", String::new());
        assert!(dry.success && !dry.applied);

        let failed = FixResult::failure("fix-1", String::new(), "File not found");
        assert!(!failed.success && !failed.applied);
        assert!(!failed.verified_success());
    }

    #[test]
    fn test_rollback_invariant() {
        let mut result = FixResult::applied("fix-1", String::new());
        result.build_passed = Some(false);
        result.rollback_needed = true;
        // rollback_needed implies the fix is not a verified success.
        assert!(!result.verified_success());
    }

    #[test]
    fn test_fix_state_terminality() {
        assert!(FixState::VerifiedSuccess.is_terminal());
        assert!(FixState::RolledBack.is_terminal());
        assert!(FixState::ApplyFailed.is_terminal());
        assert!(!FixState::Proposed.is_terminal());
        assert!(!FixState::Applied.is_terminal());
    }
}
