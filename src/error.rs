//! Error types for loading, validating and serving mocks.
//!
//! Configuration-time failures are aggregated so a caller sees every
//! offending mock at once. Per-request failures never surface here; they
//! are turned into status codes by the registry.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error returned while setting up or extending a mock server.
#[derive(Debug, Error)]
pub enum Error {
    /// One or more mock definitions could not be read or decoded.
    #[error("failed to load mocks:\n{}", join_lines(.0))]
    Load(Vec<LoadError>),

    /// One or more mock definitions are invalid.
    #[error("{header} invalid mocks:\n{}", join_lines(.errors))]
    Validation {
        header: String,
        errors: Vec<ValidationError>,
    },

    /// The registry holds no mocks at all.
    #[error("{0} no mocks registered")]
    NoMocks(String),

    #[error("cannot bind to socket addr {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),

    #[error("cannot obtain local address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

/// A single mock definition failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("mock {mock:?}: {reason}")]
pub struct ValidationError {
    pub mock: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(mock: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            mock: mock.into(),
            reason: reason.into(),
        }
    }
}

/// Failure to read or decode a mock source.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: empty mock data", .path.display())]
    Empty { path: PathBuf },

    #[error("{}: invalid JSON: {source}", .path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{}: invalid YAML: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid glob pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// A mock was hit a different number of times than expected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{mock}: expected {expected} hits, got {actual} (test {test_id:?})")]
pub struct HitMismatch {
    pub mock: String,
    pub test_id: String,
    pub expected: u64,
    pub actual: u64,
}

impl HitMismatch {
    /// Absolute difference between expected and actual hits.
    pub fn discrepancy(&self) -> u64 {
        self.expected.abs_diff(self.actual)
    }
}

/// Every hit mismatch found while verifying a registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hit assertions failed:\n{}", join_lines(.0))]
pub struct AssertionError(pub Vec<HitMismatch>);

fn join_lines<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| format!("  - {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}
