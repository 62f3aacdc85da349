//! Level-by-level parallel executor.
//!
//! Units execute one level at a time on a bounded rayon pool: every
//! record update in level k is on disk before anything in level k+1
//! starts, and within a level order is unspecified. Freshness is decided
//! at dispatch time, after upstream levels have rewritten their records,
//! so a dep change made two levels up cascades naturally.
//!
//! A failed unit never cancels its siblings; only its descendants are
//! skipped. Cancellation is cooperative: the flag is polled between
//! units and while waiting on subprocesses, which get SIGTERM, a grace
//! period, then SIGKILL. No record is written past the cancellation
//! boundary.

use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use globset::GlobSet;
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::dag::{ArtifactSet, PipelineGraph};
use crate::error::HuellaError;
use crate::freshness::FreshnessChecker;
use crate::hash::Hasher;
use crate::record::ArtifactRecord;
use crate::scm::SourceControl;

/// Knobs for one `run` invocation.
pub struct ExecOptions {
    pub workers: usize,
    /// Treat every unit as stale.
    pub force_all: bool,
    /// Force units whose output paths match.
    pub force_upstream: Option<GlobSet>,
    /// Treat matching units as fresh even when stale.
    pub cached: Option<GlobSet>,
    /// Plan only; execute nothing.
    pub dry_run: bool,
    /// SIGTERM-to-SIGKILL grace period on cancellation.
    pub term_grace: Duration,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            force_all: false,
            force_upstream: None,
            cached: None,
            dry_run: false,
            term_grace: Duration::from_secs(10),
        }
    }
}

/// Final disposition of one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Executed,
    Fresh,
    Cached,
    WouldRun,
    Failed,
    SkippedAncestor,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct UnitResult {
    pub unit: usize,
    pub label: String,
    pub status: UnitStatus,
    pub reason: String,
}

/// One event per unit transition.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Queued { unit: String },
    Running { unit: String },
    Succeeded { unit: String },
    Failed { unit: String, reason: String },
    Skipped { unit: String, reason: String },
}

pub type ProgressFn = dyn Fn(&ProgressEvent) + Send + Sync;

pub struct ExecutionReport {
    pub results: Vec<UnitResult>,
    pub levels: Vec<Vec<usize>>,
}

impl ExecutionReport {
    fn count(&self, status: UnitStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn executed(&self) -> usize {
        self.count(UnitStatus::Executed)
    }

    pub fn fresh(&self) -> usize {
        self.count(UnitStatus::Fresh)
    }

    pub fn failed(&self) -> usize {
        self.count(UnitStatus::Failed)
    }

    pub fn skipped(&self) -> usize {
        self.count(UnitStatus::SkippedAncestor)
            + self.count(UnitStatus::Cached)
            + self.count(UnitStatus::Cancelled)
    }

    /// Stale units found by a dry run.
    pub fn would_run(&self) -> usize {
        self.count(UnitStatus::WouldRun)
    }

    pub fn ok(&self) -> bool {
        self.failed() == 0 && self.count(UnitStatus::Cancelled) == 0
    }
}

pub struct Executor<'a> {
    set: ArtifactSet,
    graph: PipelineGraph,
    hasher: &'a Hasher,
    cache: &'a CacheStore,
    scm: &'a dyn SourceControl,
    opts: ExecOptions,
    cancel: Arc<AtomicBool>,
    progress: Box<ProgressFn>,
}

impl<'a> Executor<'a> {
    pub fn new(
        set: ArtifactSet,
        graph: PipelineGraph,
        hasher: &'a Hasher,
        cache: &'a CacheStore,
        scm: &'a dyn SourceControl,
        opts: ExecOptions,
    ) -> Self {
        Self {
            set,
            graph,
            hasher,
            cache,
            scm,
            opts,
            cancel: Arc::new(AtomicBool::new(false)),
            progress: Box::new(|event| debug!("{:?}", event)),
        }
    }

    /// Shared flag an external signal handler can set to stop the run.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn on_progress(mut self, progress: impl Fn(&ProgressEvent) + Send + Sync + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    fn emit(&self, event: ProgressEvent) {
        (self.progress)(&event);
    }

    /// Execute the plan. Returns a report covering every unit; fatal
    /// errors are reserved for setup problems (the pool, the plan).
    pub fn run(mut self) -> anyhow::Result<ExecutionReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.opts.workers)
            .build()
            .context("building worker pool")?;

        // One revision for the whole run, captured before anything starts.
        let code_ref = self.scm.current_revision();

        let unit_count = self.graph.units.len();
        let mut results: Vec<Option<UnitResult>> = (0..unit_count).map(|_| None).collect();
        let mut blocked: BTreeSet<usize> = BTreeSet::new();

        info!(
            "plan: {} unit(s) in {} level(s)",
            unit_count,
            self.graph.levels.len()
        );

        let levels = self.graph.levels.clone();
        for level in &levels {
            let mut to_run: Vec<(usize, String)> = Vec::new();

            for &unit_id in level {
                let label = self.graph.units[unit_id].label();
                if self.cancel.load(Ordering::SeqCst) {
                    self.emit(ProgressEvent::Skipped {
                        unit: label.clone(),
                        reason: "cancelled".into(),
                    });
                    results[unit_id] = Some(UnitResult {
                        unit: unit_id,
                        label,
                        status: UnitStatus::Cancelled,
                        reason: "cancelled".into(),
                    });
                    continue;
                }
                if blocked.contains(&unit_id) {
                    self.emit(ProgressEvent::Skipped {
                        unit: label.clone(),
                        reason: "upstream failed".into(),
                    });
                    results[unit_id] = Some(UnitResult {
                        unit: unit_id,
                        label,
                        status: UnitStatus::SkippedAncestor,
                        reason: "upstream failed".into(),
                    });
                    continue;
                }
                match self.dispatch_state(unit_id) {
                    Dispatch::Run(reason) => {
                        self.emit(ProgressEvent::Queued { unit: label });
                        to_run.push((unit_id, reason));
                    }
                    Dispatch::Fresh => {
                        self.emit(ProgressEvent::Skipped {
                            unit: label.clone(),
                            reason: "up-to-date".into(),
                        });
                        results[unit_id] = Some(UnitResult {
                            unit: unit_id,
                            label,
                            status: UnitStatus::Fresh,
                            reason: "up-to-date".into(),
                        });
                    }
                    Dispatch::Cached => {
                        self.emit(ProgressEvent::Skipped {
                            unit: label.clone(),
                            reason: "cached by pattern".into(),
                        });
                        results[unit_id] = Some(UnitResult {
                            unit: unit_id,
                            label,
                            status: UnitStatus::Cached,
                            reason: "cached by pattern".into(),
                        });
                    }
                    Dispatch::Broken(reason) => {
                        self.emit(ProgressEvent::Failed {
                            unit: label.clone(),
                            reason: reason.clone(),
                        });
                        results[unit_id] = Some(UnitResult {
                            unit: unit_id,
                            label,
                            status: UnitStatus::Failed,
                            reason,
                        });
                        blocked.extend(self.graph.descendants(unit_id));
                    }
                }
            }

            if self.opts.dry_run {
                for (unit_id, reason) in to_run {
                    results[unit_id] = Some(UnitResult {
                        unit: unit_id,
                        label: self.graph.units[unit_id].label(),
                        status: UnitStatus::WouldRun,
                        reason,
                    });
                }
                continue;
            }

            if to_run.is_empty() {
                continue;
            }

            // The parallel wave: every unit in this level is independent.
            let this = &self;
            let outcomes: Vec<(usize, Result<Vec<(usize, ArtifactRecord)>, HuellaError>)> =
                pool.install(|| {
                    use rayon::prelude::*;
                    to_run
                        .par_iter()
                        .map(|(unit_id, _)| (*unit_id, this.execute_unit(*unit_id, code_ref.as_deref())))
                        .collect()
                });

            for (unit_id, outcome) in outcomes {
                let label = self.graph.units[unit_id].label();
                match outcome {
                    Ok(updates) => {
                        for (artifact_index, record) in updates {
                            self.set.artifacts[artifact_index].record = record;
                        }
                        self.emit(ProgressEvent::Succeeded { unit: label.clone() });
                        results[unit_id] = Some(UnitResult {
                            unit: unit_id,
                            label,
                            status: UnitStatus::Executed,
                            reason: "executed".into(),
                        });
                    }
                    Err(HuellaError::Cancelled) => {
                        self.emit(ProgressEvent::Skipped {
                            unit: label.clone(),
                            reason: "cancelled".into(),
                        });
                        results[unit_id] = Some(UnitResult {
                            unit: unit_id,
                            label,
                            status: UnitStatus::Cancelled,
                            reason: "cancelled".into(),
                        });
                    }
                    Err(e) => {
                        let reason = e.to_string();
                        self.emit(ProgressEvent::Failed {
                            unit: label.clone(),
                            reason: reason.clone(),
                        });
                        results[unit_id] = Some(UnitResult {
                            unit: unit_id,
                            label,
                            status: UnitStatus::Failed,
                            reason,
                        });
                        blocked.extend(self.graph.descendants(unit_id));
                    }
                }
            }
        }

        let results = results
            .into_iter()
            .enumerate()
            .map(|(unit_id, result)| {
                result.unwrap_or(UnitResult {
                    unit: unit_id,
                    label: self.graph.units[unit_id].label(),
                    status: UnitStatus::Fresh,
                    reason: "up-to-date".into(),
                })
            })
            .collect();

        Ok(ExecutionReport {
            results,
            levels: self.graph.levels.clone(),
        })
    }

    fn dispatch_state(&self, unit_id: usize) -> Dispatch {
        let unit = &self.graph.units[unit_id];

        if let Some(cached) = &self.opts.cached {
            if unit.out_paths.iter().any(|p| cached.is_match(p)) {
                return Dispatch::Cached;
            }
        }
        if self.opts.force_all {
            return Dispatch::Run("forced".into());
        }
        if let Some(patterns) = &self.opts.force_upstream {
            if unit.out_paths.iter().any(|p| patterns.is_match(p)) {
                return Dispatch::Run("forced by pattern".into());
            }
        }

        let checker = FreshnessChecker::new(&self.set, self.hasher, self.cache, self.scm);
        let mut error: Option<String> = None;
        for &member in &unit.members {
            let freshness = checker.classify(&self.set.artifacts[member]);
            if freshness.is_stale() {
                return Dispatch::Run(freshness.reason().unwrap_or_default());
            }
            if let crate::freshness::Freshness::Error { reason } = freshness {
                error.get_or_insert(reason);
            }
        }
        match error {
            Some(reason) => Dispatch::Broken(reason),
            None => Dispatch::Fresh,
        }
    }

    /// Run one unit's command and, on success, rewrite its members'
    /// records. Returns the updated records for the in-memory set.
    fn execute_unit(
        &self,
        unit_id: usize,
        code_ref: Option<&str>,
    ) -> Result<Vec<(usize, ArtifactRecord)>, HuellaError> {
        let unit = &self.graph.units[unit_id];
        let label = unit.label();
        let Some(cmd) = &unit.cmd else {
            return Err(HuellaError::Execution {
                unit: label,
                reason: "stale but no command recorded".into(),
            });
        };

        // Dep hashes captured before the subprocess starts: these are the
        // values this run consumed.
        let checker = FreshnessChecker::new(&self.set, self.hasher, self.cache, self.scm);
        let mut dep_hashes: IndexMap<String, String> = IndexMap::new();
        for &member in &unit.members {
            if let Some(comp) = self.set.artifacts[member].record.computation() {
                for dep in comp.deps.keys() {
                    if dep_hashes.contains_key(dep) {
                        continue;
                    }
                    match checker.dep_md5(dep)? {
                        Some(md5) => {
                            dep_hashes.insert(dep.clone(), md5);
                        }
                        None => {
                            return Err(HuellaError::Execution {
                                unit: label,
                                reason: format!("dep missing: {dep}"),
                            });
                        }
                    }
                }
            }
        }

        self.emit(ProgressEvent::Running {
            unit: label.clone(),
        });
        info!("running: {cmd}");

        let mut stdout_file = tempfile::tempfile().map_err(|e| HuellaError::io("stdout", e))?;
        let mut stderr_file = tempfile::tempfile().map_err(|e| HuellaError::io("stderr", e))?;
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(&self.set.root)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file.try_clone().map_err(|e| HuellaError::io("stdout", e))?))
            .stderr(Stdio::from(stderr_file.try_clone().map_err(|e| HuellaError::io("stderr", e))?))
            .spawn()
            .map_err(|e| HuellaError::Execution {
                unit: label.clone(),
                reason: format!("failed to spawn: {e}"),
            })?;

        let status = loop {
            if let Some(status) = child.try_wait().map_err(|e| HuellaError::Execution {
                unit: label.clone(),
                reason: format!("wait failed: {e}"),
            })? {
                break status;
            }
            if self.cancel.load(Ordering::SeqCst) {
                terminate(&mut child, self.opts.term_grace);
                return Err(HuellaError::Cancelled);
            }
            std::thread::sleep(Duration::from_millis(25));
        };

        if !status.success() {
            let mut stderr = String::new();
            let _ = stderr_file.seek(SeekFrom::Start(0));
            let _ = stderr_file.read_to_string(&mut stderr);
            let tail: String = stderr.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("; ");
            return Err(HuellaError::Execution {
                unit: label,
                reason: format!("exit status {}: {}", status.code().unwrap_or(-1), tail.trim()),
            });
        }
        // Drain stdout so the temp file can be dropped without surprises.
        let _ = stdout_file.seek(SeekFrom::Start(0));

        // Verify outputs, refresh hashes, populate the cache, and rewrite
        // each member's record atomically.
        let mut updates = Vec::with_capacity(unit.members.len());
        for &member in &unit.members {
            let artifact = &self.set.artifacts[member];
            let mut record = artifact.record.clone();

            for (i, out) in record.outs.iter_mut().enumerate() {
                let abs = artifact.abs_out(&self.set.root, i);
                if !abs.exists() {
                    return Err(HuellaError::Execution {
                        unit: label.clone(),
                        reason: format!("expected output missing: {}", artifact.rel_outs[i]),
                    });
                }
                let hashed = self.hasher.hash_path(&abs)?;
                if let Some(manifest) = &hashed.manifest {
                    for entry in manifest {
                        let file = abs.join(&entry.relpath);
                        self.cache.put_file(&file)?;
                    }
                    self.cache
                        .put_bytes(&crate::hash::manifest_bytes(manifest))?;
                } else {
                    self.cache.put_file(&abs)?;
                }
                out.md5 = Some(hashed.md5);
                out.size = Some(hashed.size);
                out.is_dir = hashed.is_dir;
            }

            if let Some(comp) = record.computation_mut() {
                for (dep, recorded) in comp.deps.iter_mut() {
                    if let Some(current) = dep_hashes.get(dep) {
                        *recorded = current.clone();
                    }
                }
                comp.code_ref = code_ref.map(String::from);
            }

            record.write_atomic(&artifact.record_path)?;
            updates.push((member, record));
        }

        Ok(updates)
    }
}

enum Dispatch {
    Run(String),
    Fresh,
    Cached,
    Broken(String),
}

/// SIGTERM, bounded grace, then SIGKILL.
fn terminate(child: &mut std::process::Child, grace: Duration) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        warn!("grace period elapsed, killing subprocess");
    }
    #[cfg(not(unix))]
    {
        let _ = grace;
    }
    let _ = child.kill();
    let _ = child.wait();
}
