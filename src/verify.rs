//! Build/test verification seam.
//!
//! Verification is the only suspension point in the loop: a verifier
//! runs an external command and reports an opaque pass/fail signal.
//! Every run is bounded by a caller-supplied timeout; a timeout is a
//! verification failure, never a hang. Failures to spawn are also
//! reported as failed outcomes so that a broken toolchain cannot leave
//! a half-applied fix looking verified.

use crate::error::{LoopError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of one verifier run.
#[derive(Debug, Clone)]
pub struct VerifierOutcome {
    /// Whether the check passed.
    pub passed: bool,
    /// Captured output (or failure explanation).
    pub output: String,
}

impl VerifierOutcome {
    /// A passing outcome with no output.
    #[must_use]
    pub fn pass() -> Self {
        Self {
            passed: true,
            output: String::new(),
        }
    }

    /// A failing outcome with an explanation.
    #[must_use]
    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

/// An external pass/fail check (build, tests).
///
/// Implemented by [`CommandVerifier`] in production and by
/// `testing::MockVerifier` in tests.
#[async_trait]
pub trait Verifier: Send + Sync {
    /// Run the check, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Implementations should prefer returning a failed
    /// [`VerifierOutcome`] over erroring; errors are reserved for
    /// misuse (e.g. an empty command line).
    async fn run(&self, timeout: Duration) -> Result<VerifierOutcome>;

    /// Short human-readable name for logs.
    fn name(&self) -> &str;
}

/// Verifier that always passes.
///
/// Used when a stage has no configured command — a project without a
/// test runner should not have every fix rolled back.
#[derive(Debug, Clone, Default)]
pub struct NoopVerifier;

#[async_trait]
impl Verifier for NoopVerifier {
    async fn run(&self, _timeout: Duration) -> Result<VerifierOutcome> {
        Ok(VerifierOutcome::pass())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Process-spawning verifier adapter.
///
/// # Example
///
/// ```rust,ignore
/// use learnloop::verify::{CommandVerifier, Verifier};
/// use std::time::Duration;
///
/// let verifier = CommandVerifier::new("build", &["cargo".into(), "build".into()], ".")?;
/// let outcome = verifier.run(Duration::from_secs(300)).await?;
/// if !outcome.passed {
///     eprintln!("build failed:\n{}", outcome.output);
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    stage: String,
    program: String,
    args: Vec<String>,
    cwd: PathBuf,
}

impl CommandVerifier {
    /// Create a verifier from an argv-style command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command is empty.
    pub fn new(stage: impl Into<String>, command: &[String], cwd: impl AsRef<Path>) -> Result<Self> {
        let stage = stage.into();
        let (program, args) = command
            .split_first()
            .ok_or_else(|| LoopError::verifier(&stage, "empty command"))?;

        Ok(Self {
            stage,
            program: program.clone(),
            args: args.to_vec(),
            cwd: cwd.as_ref().to_path_buf(),
        })
    }

    /// Check whether the command's program exists on PATH.
    #[must_use]
    pub fn is_available(&self) -> bool {
        Path::new(&self.program).is_absolute() || which::which(&self.program).is_ok()
    }
}

#[async_trait]
impl Verifier for CommandVerifier {
    async fn run(&self, timeout: Duration) -> Result<VerifierOutcome> {
        debug!(
            stage = %self.stage,
            program = %self.program,
            "running verifier"
        );

        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(stage = %self.stage, "verifier failed to spawn: {e}");
                return Ok(VerifierOutcome::fail(format!(
                    "failed to spawn {}: {e}",
                    self.program
                )));
            }
        };

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                Ok(VerifierOutcome {
                    passed: output.status.success(),
                    output: text,
                })
            }
            Ok(Err(e)) => {
                warn!(stage = %self.stage, "verifier wait failed: {e}");
                Ok(VerifierOutcome::fail(format!("verifier wait failed: {e}")))
            }
            Err(_) => {
                // kill_on_drop reaps the child; a timeout is a failure,
                // never a hang.
                warn!(
                    stage = %self.stage,
                    "verifier timed out after {}s",
                    timeout.as_secs()
                );
                Ok(VerifierOutcome::fail(format!(
                    "timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    fn name(&self) -> &str {
        &self.stage
    }
}
