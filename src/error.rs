//! Error kinds for the huella core.
//!
//! Plan errors (cycles, conflicting outputs) are fatal and map to exit
//! code 3; everything else maps to the generic exit code 1. Evaluation
//! errors never reach this type - the freshness checker folds them into
//! its `Error` classification instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HuellaError {
    /// Malformed artifact record. The offending file never enters a plan.
    #[error("malformed record {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    /// Dependency cycle among computation units.
    #[error("dependency cycle: {}", cycle.join(" -> "))]
    GraphCycle { cycle: Vec<String> },

    /// Two records declare the same output path.
    #[error("conflicting records for output '{path}': {first} and {second}")]
    OutputConflict {
        path: String,
        first: String,
        second: String,
    },

    /// A unit's command failed or left an expected output missing.
    #[error("unit '{unit}' failed: {reason}")]
    Execution { unit: String, reason: String },

    /// A referenced cache object is absent from the local store.
    #[error("cache object {md5} is missing locally; run pull to fetch it")]
    CacheMissing { md5: String },

    /// The source-control adapter could not answer a query.
    #[error("source control: {0}")]
    Scm(String),

    /// Execution stopped by an external cancellation signal.
    #[error("cancelled")]
    Cancelled,

    /// Path does not exist.
    #[error("not found: {path}")]
    NotFound { path: PathBuf },

    #[error("io error at {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl HuellaError {
    /// CLI exit code for this error: 3 for plan errors, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            HuellaError::GraphCycle { .. } | HuellaError::OutputConflict { .. } => 3,
            _ => 1,
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HuellaError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_errors_exit_3() {
        let cycle = HuellaError::GraphCycle {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(cycle.exit_code(), 3);

        let conflict = HuellaError::OutputConflict {
            path: "out.bin".into(),
            first: "x.hua".into(),
            second: "y.hua".into(),
        };
        assert_eq!(conflict.exit_code(), 3);
    }

    #[test]
    fn other_errors_exit_1() {
        let missing = HuellaError::CacheMissing {
            md5: "d41d8cd98f00b204e9800998ecf8427e".into(),
        };
        assert_eq!(missing.exit_code(), 1);
        assert_eq!(HuellaError::Cancelled.exit_code(), 1);
    }

    #[test]
    fn cycle_message_names_every_node() {
        let err = HuellaError::GraphCycle {
            cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("a -> b -> c -> a"));
    }
}
