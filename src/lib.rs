// Library exports for the huella data-version-control core
pub mod cache;
pub mod config;
pub mod dag;
pub mod diff;
pub mod error;
pub mod executor;
pub mod freshness;
pub mod hash;
pub mod hash_cache;
pub mod record;
pub mod repo;
pub mod scm;
pub mod status;

// Re-export key types for convenience
pub use cache::CacheStore;
pub use config::HuellaConfig;
pub use dag::{ArtifactSet, PipelineGraph, Unit};
pub use diff::{DiffEngine, DiffOptions};
pub use error::HuellaError;
pub use executor::{ExecOptions, ExecutionReport, Executor, ProgressEvent, UnitStatus};
pub use freshness::{Freshness, FreshnessChecker};
pub use hash::Hasher;
pub use hash_cache::HashCache;
pub use record::{ArtifactRecord, Computation, OutputEntry};
pub use repo::Repo;
pub use scm::{GitScm, SourceControl};
pub use status::StatusReport;
