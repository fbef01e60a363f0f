//! Mock implementations of testing traits.

use crate::error::Result;
use crate::verify::{Verifier, VerifierOutcome};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Mock verifier with a fixed outcome.
///
/// # Example
///
/// ```rust,ignore
/// let verifier = MockVerifier::new("build")
///     .with_passed(false)
///     .with_output("error[E0308]: mismatched types");
///
/// let outcome = verifier.run(Duration::from_secs(1)).await?;
/// assert!(!outcome.passed);
/// assert_eq!(verifier.call_count(), 1);
/// ```
#[derive(Debug)]
pub struct MockVerifier {
    name: String,
    passed: bool,
    output: String,
    call_count: AtomicU32,
}

impl MockVerifier {
    /// Create a passing mock.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            output: String::new(),
            call_count: AtomicU32::new(0),
        }
    }

    /// Set whether runs pass.
    #[must_use]
    pub fn with_passed(mut self, passed: bool) -> Self {
        self.passed = passed;
        self
    }

    /// Set the output returned by runs.
    #[must_use]
    pub fn with_output(mut self, output: &str) -> Self {
        self.output = output.to_string();
        self
    }

    /// Number of times `run` was invoked.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Verifier for MockVerifier {
    async fn run(&self, _timeout: Duration) -> Result<VerifierOutcome> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        Ok(VerifierOutcome {
            passed: self.passed,
            output: self.output.clone(),
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_verifier_defaults_to_passing() {
        let verifier = MockVerifier::new("build");
        let outcome = verifier.run(Duration::from_secs(1)).await.unwrap();
        assert!(outcome.passed);
    }

    #[tokio::test]
    async fn test_mock_verifier_failure_with_output() {
        let verifier = MockVerifier::new("tests")
            .with_passed(false)
            .with_output("2 tests failed");

        let outcome = verifier.run(Duration::from_secs(1)).await.unwrap();
        assert!(!outcome.passed);
        assert_eq!(outcome.output, "2 tests failed");
    }

    #[tokio::test]
    async fn test_mock_verifier_counts_calls() {
        let verifier = MockVerifier::new("build");
        assert_eq!(verifier.call_count(), 0);

        verifier.run(Duration::from_secs(1)).await.unwrap();
        verifier.run(Duration::from_secs(1)).await.unwrap();
        assert_eq!(verifier.call_count(), 2);
    }
}
