//! Versioned prompt storage.
//!
//! Prompts live as JSON documents (`<prompts_dir>/<id>.json`) holding
//! the *current* content per prompt id. Every produced version is also
//! appended to an immutable version ledger, so history is never
//! replaced — new versions accumulate and old tags stay retrievable.

pub mod refinement;

pub use refinement::RefinementEngine;

use crate::error::{LoopError, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Version ledger filename inside the state directory.
pub const VERSIONS_FILENAME: &str = "prompt_versions.jsonl";

/// Version tag assumed for prompts that predate version tracking.
pub const INITIAL_VERSION: &str = "1.0";

/// A prompt document: the current content for one prompt id.
///
/// # Example
///
/// ```
/// use learnloop::prompt::StoredPrompt;
///
/// let prompt = StoredPrompt::new("code-review", "Review the following diff.");
/// assert_eq!(prompt.id, "code-review");
/// assert_eq!(prompt.version, learnloop::prompt::INITIAL_VERSION);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPrompt {
    /// Prompt identifier (also the document filename stem).
    pub id: String,
    /// Version tag of this content.
    #[serde(default = "default_version")]
    pub version: String,
    /// The prompt body.
    #[serde(default)]
    pub content: String,
    /// Last update time.
    #[serde(rename = "updatedAt", default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    /// Free-form metadata (refinement provenance lives here).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

fn default_version() -> String {
    INITIAL_VERSION.to_string()
}

impl StoredPrompt {
    /// Create a new prompt document at the initial version.
    #[must_use]
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            content: content.into(),
            updated_at: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// One entry in the append-only version ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    /// Prompt identifier.
    pub prompt_id: String,
    /// Content-derived version tag.
    pub version: String,
    /// Content body at this version.
    pub content: String,
    /// When the version was produced.
    pub created_at: DateTime<Utc>,
    /// Success rate observed before this version was produced, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance_score: Option<f64>,
}

/// Disk-backed store of prompt documents plus the version ledger.
#[derive(Debug, Clone)]
pub struct PromptStore {
    prompts_dir: PathBuf,
    versions_path: PathBuf,
}

impl PromptStore {
    /// Create a store over a prompts directory and a state directory.
    #[must_use]
    pub fn new(prompts_dir: impl AsRef<Path>, state_dir: impl AsRef<Path>) -> Self {
        Self {
            prompts_dir: prompts_dir.as_ref().to_path_buf(),
            versions_path: state_dir.as_ref().join(VERSIONS_FILENAME),
        }
    }

    /// Path of a prompt document.
    #[must_use]
    pub fn document_path(&self, prompt_id: &str) -> PathBuf {
        self.prompts_dir.join(format!("{prompt_id}.json"))
    }

    /// Load the current document for a prompt, if it exists.
    ///
    /// # Errors
    ///
    /// Returns `Storage` if the file exists but cannot be read or parsed.
    pub fn load(&self, prompt_id: &str) -> Result<Option<StoredPrompt>> {
        let path = self.document_path(prompt_id);
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| {
            LoopError::storage_with_path(format!("read prompt document: {e}"), path.clone())
        })?;
        let mut prompt: StoredPrompt = serde_json::from_str(&content).map_err(|e| {
            LoopError::storage_with_path(format!("parse prompt document: {e}"), path)
        })?;
        if prompt.id.is_empty() {
            prompt.id = prompt_id.to_string();
        }
        Ok(Some(prompt))
    }

    /// Load a prompt document, failing if it does not exist.
    pub fn require(&self, prompt_id: &str) -> Result<StoredPrompt> {
        self.load(prompt_id)?.ok_or_else(|| LoopError::PromptNotFound {
            prompt_id: prompt_id.to_string(),
            path: self.document_path(prompt_id),
        })
    }

    /// Write a document as the current content for its prompt id.
    pub fn save_current(&self, prompt: &StoredPrompt) -> Result<()> {
        if !self.prompts_dir.exists() {
            std::fs::create_dir_all(&self.prompts_dir).map_err(|e| {
                LoopError::storage_with_path(
                    format!("create prompts directory: {e}"),
                    self.prompts_dir.clone(),
                )
            })?;
        }

        let path = self.document_path(&prompt.id);
        let json = serde_json::to_string_pretty(prompt)?;
        std::fs::write(&path, json)
            .map_err(|e| LoopError::storage_with_path(format!("write prompt document: {e}"), path))
    }

    /// Append a version to the immutable version ledger.
    pub fn append_version(&self, version: &PromptVersion) -> Result<()> {
        if let Some(parent) = self.versions_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    LoopError::storage_with_path(
                        format!("create state directory: {e}"),
                        parent.to_path_buf(),
                    )
                })?;
            }
        }

        let line = serde_json::to_string(version)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.versions_path)
            .map_err(|e| {
                LoopError::storage_with_path(
                    format!("open version ledger: {e}"),
                    self.versions_path.clone(),
                )
            })?;
        file.lock_exclusive().map_err(|e| {
            LoopError::storage_with_path(
                format!("lock version ledger: {e}"),
                self.versions_path.clone(),
            )
        })?;
        let mut file = file;
        writeln!(file, "{line}").map_err(|e| {
            LoopError::storage_with_path(
                format!("append version: {e}"),
                self.versions_path.clone(),
            )
        })?;
        file.flush().map_err(|e| {
            LoopError::storage_with_path(
                format!("flush version ledger: {e}"),
                self.versions_path.clone(),
            )
        })?;
        Ok(())
    }

    /// Persist a refined document: append it to the version ledger and
    /// mark it current for its prompt id.
    pub fn record_version(
        &self,
        prompt: &StoredPrompt,
        performance_score: Option<f64>,
    ) -> Result<()> {
        self.append_version(&PromptVersion {
            prompt_id: prompt.id.clone(),
            version: prompt.version.clone(),
            content: prompt.content.clone(),
            created_at: prompt.updated_at,
            performance_score,
        })?;
        self.save_current(prompt)
    }

    /// All recorded versions for a prompt, oldest first.
    pub fn versions(&self, prompt_id: &str) -> Result<Vec<PromptVersion>> {
        if !self.versions_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.versions_path).map_err(|e| {
            LoopError::storage_with_path(
                format!("open version ledger: {e}"),
                self.versions_path.clone(),
            )
        })?;
        let reader = BufReader::new(file);

        let mut versions = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| {
                LoopError::storage_with_path(
                    format!("read version ledger: {e}"),
                    self.versions_path.clone(),
                )
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PromptVersion>(&line) {
                Ok(version) if version.prompt_id == prompt_id => versions.push(version),
                Ok(_) => {}
                Err(e) => warn!("skipping malformed version line: {e}"),
            }
        }
        Ok(versions)
    }

    /// Identifiers of all prompt documents in the store.
    ///
    /// The reserved `index` document is skipped.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        if !self.prompts_dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.prompts_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(std::result::Result::ok)
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    if stem != "index" {
                        ids.push(stem.to_string());
                    }
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
