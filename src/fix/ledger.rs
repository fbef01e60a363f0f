//! Fix ledger: append-only fix/result records plus pattern aggregates.
//!
//! Proposed fixes and apply/verify results land in two JSONL ledgers;
//! the latest result per fix id is authoritative for state queries.
//! Per-issue-type pattern statistics live in a small JSON aggregate
//! that is updated incrementally and never reset by the core.

use super::{CodeFix, FixResult, FixState};
use crate::error::{LoopError, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

/// Proposed-fix ledger filename inside the state directory.
pub const FIXES_FILENAME: &str = "fixes.jsonl";

/// Result ledger filename inside the state directory.
pub const RESULTS_FILENAME: &str = "fix_results.jsonl";

/// Pattern aggregate filename inside the state directory.
pub const PATTERNS_FILENAME: &str = "fix_patterns.json";

/// Characters kept from normalized code spans used as pattern keys.
const PATTERN_KEY_LEN: usize = 120;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// A proposed fix as recorded in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRecord {
    /// When the fix was proposed.
    pub recorded_at: DateTime<Utc>,
    /// The proposed edit.
    #[serde(flatten)]
    pub fix: CodeFix,
}

/// Aggregate statistics for one (issue type, normalized pattern) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixPattern {
    /// Issue category.
    pub issue_type: String,
    /// Whitespace-normalized old-code span.
    pub pattern: String,
    /// Whitespace-normalized replacement span.
    pub fix_template: String,
    /// Fixes of this shape that verified successfully.
    pub success_count: u64,
    /// Fixes of this shape that failed to apply or verify.
    pub failure_count: u64,
    /// Running mean of provider confidence.
    pub avg_confidence: f64,
}

impl FixPattern {
    /// Observations folded into this pattern so far.
    #[must_use]
    pub fn observations(&self) -> u64 {
        self.success_count + self.failure_count
    }
}

/// Per-issue-type slice of the efficacy statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueTypeStats {
    /// Applied fixes of this issue type.
    pub total: u64,
    /// Of those, verified successes.
    pub success: u64,
    /// success / total, in [0, 1].
    pub rate: f64,
}

/// Efficacy statistics over the whole fix ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixEfficacy {
    /// Distinct proposed fixes.
    pub total: u64,
    /// Fixes whose latest attempt mutated the file.
    pub applied: u64,
    /// Applied fixes that also passed verification.
    pub successful: u64,
    /// Applied fixes whose build check passed.
    pub build_passed: u64,
    /// Applied fixes whose test check passed.
    pub tests_passed: u64,
    /// Fixes rolled back after failed verification.
    pub rollbacks: u64,
    /// successful / applied, in [0, 1]. 0.0 when nothing applied.
    pub success_rate: f64,
    /// rollbacks / applied, in [0, 1]. 0.0 when nothing applied.
    pub rollback_rate: f64,
    /// Breakdown over applied fixes only.
    pub by_issue_type: HashMap<String, IssueTypeStats>,
}

/// Disk-backed fix ledger.
#[derive(Debug, Clone)]
pub struct FixLedger {
    fixes_path: PathBuf,
    results_path: PathBuf,
    patterns_path: PathBuf,
}

impl FixLedger {
    /// Create a ledger rooted at a state directory.
    #[must_use]
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let state_dir = state_dir.as_ref();
        Self {
            fixes_path: state_dir.join(FIXES_FILENAME),
            results_path: state_dir.join(RESULTS_FILENAME),
            patterns_path: state_dir.join(PATTERNS_FILENAME),
        }
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    /// Record a proposed fix.
    ///
    /// # Errors
    ///
    /// Returns `Storage` on underlying I/O failure.
    pub fn record_fix(&self, fix: &CodeFix) -> Result<()> {
        let record = FixRecord {
            recorded_at: Utc::now(),
            fix: fix.clone(),
        };
        let line = serde_json::to_string(&record)?;
        self.append_line(&self.fixes_path, &line)
    }

    /// Record an apply or verify outcome.
    ///
    /// Dry-run results are the caller's to keep out of the ledger; this
    /// method appends whatever it is given.
    pub fn record_result(&self, result: &FixResult) -> Result<()> {
        let line = serde_json::to_string(result)?;
        self.append_line(&self.results_path, &line)
    }

    /// Fold a result into the pattern aggregate for its fix.
    ///
    /// `success` means the fix verified successfully; anything else
    /// (failed apply, failed verification, rollback) counts as failure.
    pub fn update_pattern(&self, fix: &CodeFix, success: bool) -> Result<()> {
        let pattern = normalize_span(&fix.old_code);
        let key = pattern_key(&fix.issue_type, &pattern);

        let mut patterns = self.load_patterns()?;
        let entry = patterns.entry(key).or_insert_with(|| FixPattern {
            issue_type: fix.issue_type.clone(),
            pattern,
            fix_template: normalize_span(&fix.new_code),
            success_count: 0,
            failure_count: 0,
            avg_confidence: 0.0,
        });

        let n = entry.observations() as f64;
        entry.avg_confidence = (entry.avg_confidence * n + fix.confidence) / (n + 1.0);
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }

        self.save_patterns(&patterns)
    }

    // ------------------------------------------------------------------------
    // Reading
    // ------------------------------------------------------------------------

    /// All proposed fixes in proposal order, deduplicated by id.
    pub fn read_fixes(&self) -> Result<Vec<FixRecord>> {
        let records: Vec<FixRecord> = self.read_jsonl(&self.fixes_path)?;
        let mut seen = std::collections::HashSet::new();
        Ok(records
            .into_iter()
            .filter(|r| seen.insert(r.fix.id.clone()))
            .collect())
    }

    /// All recorded results in append order.
    pub fn read_results(&self) -> Result<Vec<FixResult>> {
        self.read_jsonl(&self.results_path)
    }

    /// The pattern aggregate map.
    pub fn load_patterns(&self) -> Result<HashMap<String, FixPattern>> {
        if !self.patterns_path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&self.patterns_path).map_err(|e| {
            LoopError::storage_with_path(
                format!("read pattern aggregates: {e}"),
                self.patterns_path.clone(),
            )
        })?;
        serde_json::from_str(&content).map_err(|e| {
            LoopError::storage_with_path(
                format!("parse pattern aggregates: {e}"),
                self.patterns_path.clone(),
            )
        })
    }

    /// Derive the lifecycle state of a fix from its records.
    pub fn state_of(&self, fix_id: &str) -> Result<Option<FixState>> {
        let proposed = self.read_fixes()?.iter().any(|r| r.fix.id == fix_id);
        let latest = self
            .read_results()?
            .into_iter()
            .filter(|r| r.fix_id == fix_id)
            .next_back();

        Ok(match (proposed, latest) {
            (false, None) => None,
            (true, None) => Some(FixState::Proposed),
            (_, Some(result)) => Some(if !result.success {
                FixState::ApplyFailed
            } else if result.rollback_needed {
                FixState::RolledBack
            } else if result.build_passed == Some(true) && result.tests_passed == Some(true) {
                FixState::VerifiedSuccess
            } else {
                FixState::Applied
            }),
        })
    }

    /// Compute efficacy statistics over the ledger.
    ///
    /// `by_issue_type` groups only fixes whose latest attempt applied.
    pub fn efficacy(&self) -> Result<FixEfficacy> {
        let fixes = self.read_fixes()?;
        let results = self.read_results()?;

        // Latest result per fix id wins.
        let mut latest: HashMap<&str, &FixResult> = HashMap::new();
        for result in &results {
            latest.insert(result.fix_id.as_str(), result);
        }

        let issue_types: HashMap<&str, &str> = fixes
            .iter()
            .map(|r| (r.fix.id.as_str(), r.fix.issue_type.as_str()))
            .collect();

        let mut stats = FixEfficacy {
            total: fixes.len() as u64,
            ..FixEfficacy::default()
        };

        for (fix_id, result) in &latest {
            if !result.applied {
                continue;
            }
            stats.applied += 1;
            if result.verified_success() {
                stats.successful += 1;
            }
            if result.build_passed == Some(true) {
                stats.build_passed += 1;
            }
            if result.tests_passed == Some(true) {
                stats.tests_passed += 1;
            }
            if result.rollback_needed {
                stats.rollbacks += 1;
            }

            let issue_type = issue_types.get(fix_id).copied().unwrap_or("unknown");
            let entry = stats.by_issue_type.entry(issue_type.to_string()).or_default();
            entry.total += 1;
            if result.verified_success() {
                entry.success += 1;
            }
        }

        if stats.applied > 0 {
            stats.success_rate = stats.successful as f64 / stats.applied as f64;
            stats.rollback_rate = stats.rollbacks as f64 / stats.applied as f64;
        }
        for entry in stats.by_issue_type.values_mut() {
            entry.rate = entry.success as f64 / entry.total as f64;
        }

        Ok(stats)
    }

    // ------------------------------------------------------------------------
    // File plumbing
    // ------------------------------------------------------------------------

    fn append_line(&self, path: &Path, line: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LoopError::storage_with_path(
                        format!("create state directory: {e}"),
                        parent.to_path_buf(),
                    )
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                LoopError::storage_with_path(format!("open ledger: {e}"), path.to_path_buf())
            })?;
        file.lock_exclusive().map_err(|e| {
            LoopError::storage_with_path(format!("lock ledger: {e}"), path.to_path_buf())
        })?;
        let mut file = file;
        writeln!(file, "{line}").map_err(|e| {
            LoopError::storage_with_path(format!("append record: {e}"), path.to_path_buf())
        })?;
        file.flush().map_err(|e| {
            LoopError::storage_with_path(format!("flush ledger: {e}"), path.to_path_buf())
        })?;
        Ok(())
    }

    fn read_jsonl<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(path).map_err(|e| {
            LoopError::storage_with_path(format!("open ledger: {e}"), path.to_path_buf())
        })?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| {
                LoopError::storage_with_path(format!("read ledger: {e}"), path.to_path_buf())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!("skipping malformed ledger line in {}: {e}", path.display()),
            }
        }
        Ok(records)
    }

    fn save_patterns(&self, patterns: &HashMap<String, FixPattern>) -> Result<()> {
        if let Some(parent) = self.patterns_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LoopError::storage_with_path(
                        format!("create state directory: {e}"),
                        parent.to_path_buf(),
                    )
                })?;
            }
        }
        let json = serde_json::to_string_pretty(patterns)?;
        std::fs::write(&self.patterns_path, json).map_err(|e| {
            LoopError::storage_with_path(
                format!("write pattern aggregates: {e}"),
                self.patterns_path.clone(),
            )
        })
    }
}

/// Collapse whitespace runs so formatting differences share a pattern.
fn normalize_span(code: &str) -> String {
    let collapsed = whitespace_re().replace_all(code.trim(), " ");
    collapsed.chars().take(PATTERN_KEY_LEN).collect()
}

fn pattern_key(issue_type: &str, pattern: &str) -> String {
    format!("{issue_type}::{pattern}")
}
