//! Testing infrastructure: controllable doubles for external
//! dependencies, so verify paths are testable without subprocesses.

pub mod mocks;

pub use mocks::MockVerifier;
