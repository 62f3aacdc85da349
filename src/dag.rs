//! Artifact graph construction and level scheduling.
//!
//! The pipeline has no central plan file: its structure is the union of
//! the computation blocks found in artifact records. Loading starts from
//! the requested records and follows `deps` transitively. Records whose
//! `cmd` strings are byte-identical are co-outputs of one computation and
//! collapse into a single schedulable unit; a record without a command is
//! its own singleton unit.
//!
//! Cycles and duplicate output declarations are plan errors, detected
//! here before anything executes.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::debug;

use crate::error::HuellaError;
use crate::record::{find_tracked_ancestor, output_path_for, record_path_for, ArtifactRecord};

/// One loaded record plus its location.
#[derive(Debug, Clone)]
pub struct Artifact {
    /// Absolute path of the `.hua` file.
    pub record_path: PathBuf,
    /// Root-relative paths of this record's outputs (forward slashes).
    pub rel_outs: Vec<String>,
    pub record: ArtifactRecord,
}

impl Artifact {
    /// Display name: the first output path.
    pub fn name(&self) -> &str {
        &self.rel_outs[0]
    }

    /// Absolute path of the i-th output.
    pub fn abs_out(&self, root: &Path, i: usize) -> PathBuf {
        root.join(&self.rel_outs[i])
    }
}

/// The set of artifacts participating in a plan, keyed by output path.
#[derive(Debug)]
pub struct ArtifactSet {
    pub root: PathBuf,
    pub artifacts: Vec<Artifact>,
    by_out: IndexMap<String, usize>,
}

impl ArtifactSet {
    /// Load records (and, transitively, the records of their deps),
    /// rejecting duplicate output declarations.
    pub fn load(root: &Path, record_paths: &[PathBuf]) -> Result<Self, HuellaError> {
        let mut set = ArtifactSet {
            root: root.to_path_buf(),
            artifacts: Vec::new(),
            by_out: IndexMap::new(),
        };
        let mut queue: VecDeque<PathBuf> = record_paths.iter().cloned().collect();
        let mut seen: BTreeSet<PathBuf> = BTreeSet::new();

        while let Some(record_path) = queue.pop_front() {
            let record_path = if record_path.is_absolute() {
                record_path
            } else {
                root.join(record_path)
            };
            if !seen.insert(record_path.clone()) {
                continue;
            }
            let record = ArtifactRecord::load(&record_path)?;
            let index = set.artifacts.len();

            let record_dir = record_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            let mut rel_outs = Vec::with_capacity(record.outs.len());
            for out in &record.outs {
                let rel = rel_path(root, &record_dir.join(&out.path)).ok_or_else(|| {
                    HuellaError::Parse {
                        path: record_path.clone(),
                        reason: format!("output '{}' escapes the repository", out.path),
                    }
                })?;
                if let Some(&other) = set.by_out.get(&rel) {
                    return Err(HuellaError::OutputConflict {
                        path: rel,
                        first: set.artifacts[other].record_path.display().to_string(),
                        second: record_path.display().to_string(),
                    });
                }
                set.by_out.insert(rel.clone(), index);
                rel_outs.push(rel);
            }

            if let Some(comp) = record.computation() {
                for dep in comp.deps.keys() {
                    let dep_abs = root.join(dep);
                    let dep_record = record_path_for(&dep_abs);
                    if dep_record.is_file() {
                        queue.push_back(dep_record);
                    } else if let Some((ancestor, _)) = find_tracked_ancestor(&dep_abs, root) {
                        queue.push_back(ancestor);
                    }
                }
            }

            set.artifacts.push(Artifact {
                record_path,
                rel_outs,
                record,
            });
        }
        debug!("loaded {} artifact(s)", set.artifacts.len());
        Ok(set)
    }

    pub fn get(&self, rel_out: &str) -> Option<&Artifact> {
        self.by_out.get(rel_out).map(|&i| &self.artifacts[i])
    }

    pub fn index_of(&self, rel_out: &str) -> Option<usize> {
        self.by_out.get(rel_out).copied()
    }

    /// Find the tracked directory artifact that contains `rel_path`, with
    /// the remainder relpath inside it.
    pub fn dir_containing(&self, rel_path: &str) -> Option<(&Artifact, String)> {
        for (out, &i) in &self.by_out {
            let prefix = format!("{out}/");
            if let Some(rest) = rel_path.strip_prefix(&prefix) {
                return Some((&self.artifacts[i], rest.to_string()));
            }
        }
        None
    }

    /// Resolve the artifact index that produces `rel_path`, directly or
    /// as an entry of a tracked directory.
    pub fn producer_of(&self, rel_path: &str) -> Option<usize> {
        self.index_of(rel_path)
            .or_else(|| self.dir_containing(rel_path).map(|(a, _)| {
                self.index_of(a.name()).expect("artifact indexed by its own output")
            }))
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }
}

/// A schedulable computation unit: the co-output group for one command.
#[derive(Debug, Clone)]
pub struct Unit {
    pub id: usize,
    pub cmd: Option<String>,
    /// Indices into `ArtifactSet::artifacts`.
    pub members: Vec<usize>,
    /// Union of the members' output paths.
    pub out_paths: Vec<String>,
}

impl Unit {
    pub fn label(&self) -> String {
        self.out_paths.join(", ")
    }
}

/// Quotient graph of units with its level schedule.
#[derive(Debug)]
pub struct PipelineGraph {
    pub units: Vec<Unit>,
    pub predecessors: Vec<BTreeSet<usize>>,
    pub successors: Vec<BTreeSet<usize>>,
    /// Units grouped into executable levels: every predecessor of a unit
    /// in level k lives in some level < k.
    pub levels: Vec<Vec<usize>>,
    pub unit_of_artifact: Vec<usize>,
}

impl PipelineGraph {
    pub fn build(set: &ArtifactSet) -> Result<Self, HuellaError> {
        // Co-output grouping by byte-identical command.
        let mut units: Vec<Unit> = Vec::new();
        let mut unit_by_cmd: HashMap<&str, usize> = HashMap::new();
        let mut unit_of_artifact = vec![usize::MAX; set.artifacts.len()];

        for (i, artifact) in set.artifacts.iter().enumerate() {
            let unit_id = match artifact.record.cmd() {
                Some(cmd) => match unit_by_cmd.get(cmd) {
                    Some(&id) => id,
                    None => {
                        let id = units.len();
                        unit_by_cmd.insert(cmd, id);
                        units.push(Unit {
                            id,
                            cmd: Some(cmd.to_string()),
                            members: Vec::new(),
                            out_paths: Vec::new(),
                        });
                        id
                    }
                },
                None => {
                    let id = units.len();
                    units.push(Unit {
                        id,
                        cmd: None,
                        members: Vec::new(),
                        out_paths: Vec::new(),
                    });
                    id
                }
            };
            units[unit_id].members.push(i);
            units[unit_id].out_paths.extend(artifact.rel_outs.iter().cloned());
            unit_of_artifact[i] = unit_id;
        }

        // Unit-level edges from the union of member deps.
        let n = units.len();
        let mut predecessors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        let mut self_loops: BTreeSet<usize> = BTreeSet::new();

        for (i, artifact) in set.artifacts.iter().enumerate() {
            let consumer = unit_of_artifact[i];
            let Some(comp) = artifact.record.computation() else {
                continue;
            };
            for dep in comp.deps.keys() {
                let Some(producer_artifact) = set.producer_of(dep) else {
                    continue;
                };
                let producer = unit_of_artifact[producer_artifact];
                if producer == consumer {
                    // Members of one unit may feed each other; a record
                    // depending on its own output is a true cycle.
                    if producer_artifact == i {
                        self_loops.insert(consumer);
                    }
                    continue;
                }
                predecessors[consumer].insert(producer);
                successors[producer].insert(consumer);
            }
        }

        // Cycle detection on the quotient graph.
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let nodes: Vec<NodeIndex> = (0..n).map(|id| graph.add_node(id)).collect();
        for (consumer, preds) in predecessors.iter().enumerate() {
            for &producer in preds {
                graph.add_edge(nodes[producer], nodes[consumer], ());
            }
        }
        for scc in tarjan_scc(&graph) {
            let cyclic = scc.len() > 1 || scc.iter().any(|&node| self_loops.contains(&graph[node]));
            if cyclic {
                let mut cycle: Vec<String> = scc
                    .iter()
                    .map(|&node| units[graph[node]].label())
                    .collect();
                cycle.push(cycle[0].clone());
                return Err(HuellaError::GraphCycle { cycle });
            }
        }

        // Kahn's algorithm, one level per wave of in-degree-zero units.
        let mut in_degree: Vec<usize> = predecessors.iter().map(BTreeSet::len).collect();
        let mut levels: Vec<Vec<usize>> = Vec::new();
        let mut ready: Vec<usize> = (0..n).filter(|&u| in_degree[u] == 0).collect();
        let mut placed = 0;
        while !ready.is_empty() {
            let level = std::mem::take(&mut ready);
            for &unit in &level {
                placed += 1;
                for &next in &successors[unit] {
                    in_degree[next] -= 1;
                    if in_degree[next] == 0 {
                        ready.push(next);
                    }
                }
            }
            levels.push(level);
        }
        debug_assert_eq!(placed, n, "cycle detection left unplaced units");

        Ok(PipelineGraph {
            units,
            predecessors,
            successors,
            levels,
            unit_of_artifact,
        })
    }

    /// All transitive successors of a unit (used to skip descendants of a
    /// failed unit).
    pub fn descendants(&self, unit: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        let mut stack = vec![unit];
        while let Some(u) = stack.pop() {
            for &next in &self.successors[u] {
                if out.insert(next) {
                    stack.push(next);
                }
            }
        }
        out
    }
}

/// Lexically normalize a path: resolve `.` and `..` without touching the
/// filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Root-relative forward-slash form of a path.
pub fn rel_path(root: &Path, path: &Path) -> Option<String> {
    let rel = normalize(path);
    let rel = rel.strip_prefix(&normalize(root)).ok()?;
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

/// Expand a target argument into record file paths: an explicit `.hua`
/// file, an output path, a tracked directory, or a directory to scan
/// recursively.
pub fn expand_target(root: &Path, target: &Path) -> Vec<PathBuf> {
    let abs = if target.is_absolute() {
        target.to_path_buf()
    } else {
        root.join(target)
    };
    if output_path_for(&abs).is_some() {
        return vec![abs];
    }
    let sidecar = record_path_for(&abs);
    if sidecar.is_file() {
        return vec![sidecar];
    }
    if abs.is_dir() {
        return find_records_under(&abs);
    }
    // Neither exists: report the sidecar so the error names the record.
    vec![sidecar]
}

/// All `.hua` files under a directory, sorted, skipping the state dir.
pub fn find_records_under(dir: &Path) -> Vec<PathBuf> {
    let mut records: Vec<PathBuf> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            name != crate::repo::STATE_DIR && name != ".git"
        })
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.file_type().is_file()
                && e.file_name()
                    .to_string_lossy()
                    .ends_with(crate::record::RECORD_SUFFIX)
        })
        .map(|e| e.into_path())
        .collect();
    records.sort();
    records
}
