use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use huella::dag::{ArtifactSet, PipelineGraph};
use huella::diff::{DiffEngine, DiffOptions};
use huella::executor::{ExecOptions, ExecutionReport, Executor, ProgressEvent, UnitStatus};
use huella::record::output_path_for;
use huella::repo::Repo;
use huella::scm::{parent_range, SourceControl};
use huella::status;
use huella::HuellaError;

#[derive(Parser)]
#[command(name = "huella")]
#[command(version, about = "Minimal data version control built on self-describing artifact records", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a huella repository
    Init {
        /// Recreate the state directory if it exists
        #[arg(short, long)]
        force: bool,
    },

    /// Track file(s) or directory(ies)
    Add {
        /// Paths to track
        #[arg(required = true)]
        targets: Vec<PathBuf>,

        /// Dependency path (repeatable); recorded with its current hash
        #[arg(long = "dep", value_name = "PATH")]
        deps: Vec<String>,

        /// Command that produces the target (enables placeholder records)
        #[arg(long, value_name = "CMD")]
        cmd: Option<String>,

        /// Refresh stale tracked deps first, depth-first
        #[arg(short, long)]
        recursive: bool,
    },

    /// Check freshness of artifacts
    Status {
        /// Targets: outputs, record files, directories, or globs
        targets: Vec<String>,

        /// Number of parallel workers
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Show fresh artifacts too
        #[arg(short, long)]
        all: bool,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Execute stale computations from artifact records
    Run {
        /// Targets: outputs, record files, directories, or globs
        targets: Vec<String>,

        /// Number of parallel workers
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Force re-run of every unit
        #[arg(short, long)]
        force: bool,

        /// Force units whose output matches the glob (repeatable)
        #[arg(long = "force-upstream", value_name = "GLOB")]
        force_upstream: Vec<String>,

        /// Treat units whose output matches the glob as fresh (repeatable)
        #[arg(long, value_name = "GLOB")]
        cached: Vec<String>,

        /// Show the execution plan without running anything
        #[arg(short = 'n', long)]
        dry_run: bool,
    },

    /// Diff tracked content between revisions
    Diff {
        /// Path to diff (omit with --summary to cover all records)
        target: Option<String>,

        /// <rev> or <rev1>..<rev2> (default: HEAD vs working tree)
        #[arg(short = 'r', long)]
        refspec: Option<String>,

        /// Shorthand for <rev>^..<rev>
        #[arg(short = 'R', long = "ref", value_name = "REV")]
        rev: Option<String>,

        /// Preprocess each side with CMD; `{}` is the file path
        #[arg(short = 'x', long = "exec-cmd", value_name = "CMD")]
        preprocess: Option<String>,

        /// Lines of unified context
        #[arg(short = 'U', long)]
        unified: Option<u32>,

        /// Ignore whitespace differences
        #[arg(short = 'w', long)]
        ignore_whitespace: bool,

        /// Show changed hashes instead of content
        #[arg(short, long)]
        summary: bool,
    },

    /// Print a cached object to stdout
    Cat {
        /// Tracked path, file inside a tracked directory, or literal md5
        target: String,

        /// Read the record at this revision
        #[arg(short, long)]
        rev: Option<String>,
    },

    /// Inspect the content cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Maintain the mtime hash cache
    #[command(name = "hash-cache")]
    HashCache {
        #[command(subcommand)]
        command: HashCacheCommands,
    },

    /// Delete cache objects referenced by no record
    Gc {
        /// Keep only objects referenced from the workspace (required)
        #[arg(short, long)]
        workspace: bool,

        /// Show what would be removed without deleting
        #[arg(short = 'n', long)]
        dry: bool,
    },

    /// Stop tracking targets
    Remove {
        #[arg(required = true)]
        targets: Vec<String>,

        /// Also delete the output files
        #[arg(long)]
        outs: bool,
    },

    /// Print the repository root
    Root,
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Print the cache path for a tracked target
    Path {
        target: String,
        #[arg(short, long)]
        rev: Option<String>,
    },
    /// Print the md5 for a tracked target
    Md5 {
        target: String,
        #[arg(short, long)]
        rev: Option<String>,
    },
}

#[derive(Subcommand)]
enum HashCacheCommands {
    /// Purge every memoized hash
    Clear,
    /// Recompute cached hashes and report mismatches
    Verify,
}

fn main() {
    let cli = Cli::parse();

    let filter_layer = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else if cli.verbose {
        tracing_subscriber::EnvFilter::new("info")
    } else {
        tracing_subscriber::EnvFilter::new("warn")
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if cli.no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    match dispatch(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            let code = e
                .downcast_ref::<HuellaError>()
                .map(HuellaError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init { force } => {
            let cwd = std::env::current_dir()?;
            Repo::init(&cwd, force)?;
            println!("Initialized huella repository.");
            Ok(0)
        }
        Commands::Add {
            targets,
            deps,
            cmd,
            recursive,
        } => cmd_add(&targets, &deps, cmd.as_deref(), recursive),
        Commands::Status {
            targets,
            jobs,
            all,
            json,
        } => cmd_status(&targets, jobs, all, json),
        Commands::Run {
            targets,
            jobs,
            force,
            force_upstream,
            cached,
            dry_run,
        } => cmd_run(&targets, jobs, force, &force_upstream, &cached, dry_run),
        Commands::Diff {
            target,
            refspec,
            rev,
            preprocess,
            unified,
            ignore_whitespace,
            summary,
        } => cmd_diff(
            target, refspec, rev, preprocess, unified, ignore_whitespace, summary,
            cli.no_color,
        ),
        Commands::Cat { target, rev } => {
            let repo = Repo::discover()?;
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            repo.cat(&target, rev.as_deref(), &mut lock)?;
            Ok(0)
        }
        Commands::Cache { command } => {
            let repo = Repo::discover()?;
            match command {
                CacheCommands::Path { target, rev } => {
                    println!("{}", repo.cache_path_of(&target, rev.as_deref())?.display());
                }
                CacheCommands::Md5 { target, rev } => {
                    println!("{}", repo.resolve_md5(&target, rev.as_deref())?);
                }
            }
            Ok(0)
        }
        Commands::HashCache { command } => {
            let repo = Repo::discover()?;
            match command {
                HashCacheCommands::Clear => {
                    let purged = repo.hash_cache.clear()?;
                    println!("Cleared {purged} cached hash(es).");
                }
                HashCacheCommands::Verify => {
                    let mismatches = repo.hash_cache.verify()?;
                    if mismatches.is_empty() {
                        println!("All cached hashes verified.");
                    } else {
                        for m in &mismatches {
                            match &m.actual {
                                Some(actual) => println!(
                                    "{} {}: cached {} actual {}",
                                    "mismatch".red(),
                                    m.path.display(),
                                    &m.stored[..8.min(m.stored.len())],
                                    &actual[..8.min(actual.len())]
                                ),
                                None => println!(
                                    "{} {}: file unreadable",
                                    "mismatch".red(),
                                    m.path.display()
                                ),
                            }
                        }
                        return Ok(1);
                    }
                }
            }
            Ok(0)
        }
        Commands::Gc { workspace, dry } => {
            if !workspace {
                bail!("-w/--workspace is required");
            }
            let repo = Repo::discover()?;
            let report = repo.gc(dry)?;
            if dry {
                for md5 in &report.candidates {
                    println!("would remove {md5}");
                }
                println!("Would free {} byte(s).", report.freed);
            } else {
                println!("Removed {} object(s), freed {} byte(s).", report.removed, report.freed);
            }
            Ok(0)
        }
        Commands::Remove { targets, outs } => {
            let repo = Repo::discover()?;
            let removed = repo.remove(&targets, outs)?;
            println!("Removed {removed} target(s).");
            Ok(0)
        }
        Commands::Root => {
            let repo = Repo::discover()?;
            let cwd = std::env::current_dir()?;
            let rel = pathdiff(&repo.root, &cwd);
            println!("{}", rel.display());
            Ok(0)
        }
    }
}

fn cmd_add(targets: &[PathBuf], deps: &[String], cmd: Option<&str>, recursive: bool) -> Result<i32> {
    let repo = Repo::discover()?;
    for target in targets {
        let outcome = repo
            .add(target, deps, cmd, recursive)
            .with_context(|| format!("failed to add {}", target.display()))?;
        match &outcome.md5 {
            Some(md5) => println!("Added {} ({}...)", outcome.rel, &md5[..8]),
            None => println!("Added {} (placeholder)", outcome.rel),
        }
    }
    Ok(0)
}

fn cmd_status(targets: &[String], jobs: Option<usize>, all: bool, json: bool) -> Result<i32> {
    let repo = Repo::discover()?;
    let records = status::expand_targets(&repo.root, targets)?;
    if records.is_empty() {
        println!("No artifact records found.");
        return Ok(0);
    }
    let set = ArtifactSet::load(&repo.root, &records)?;
    let workers = repo.config.effective_workers(jobs);
    let report = status::collect(&set, &repo.hasher, &repo.cache, &repo.scm, workers)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        println!("{}", report.render_human(all));
    }
    Ok(if report.has_stale() { 2 } else { 0 })
}

fn cmd_run(
    targets: &[String],
    jobs: Option<usize>,
    force: bool,
    force_upstream: &[String],
    cached: &[String],
    dry_run: bool,
) -> Result<i32> {
    let repo = Repo::discover()?;
    let records = status::expand_targets(&repo.root, targets)?;
    if records.is_empty() {
        bail!("no artifact records found; specify targets or add some first");
    }
    let set = ArtifactSet::load(&repo.root, &records)?;
    let graph = PipelineGraph::build(&set)?;

    eprintln!(
        "Execution plan ({} level(s), {} unit(s)):",
        graph.levels.len(),
        graph.units.len()
    );
    for (i, level) in graph.levels.iter().enumerate() {
        let labels: Vec<String> = level.iter().map(|&u| graph.units[u].label()).collect();
        eprintln!("  Level {}: {}", i + 1, labels.join(", "));
    }

    let opts = ExecOptions {
        workers: repo.config.effective_workers(jobs),
        force_all: force,
        force_upstream: build_globset(force_upstream)?,
        cached: build_globset(cached)?,
        dry_run,
        term_grace: Duration::from_secs(repo.config.term_grace_secs),
    };
    let executor = Executor::new(set, graph, &repo.hasher, &repo.cache, &repo.scm, opts)
        .on_progress(print_progress);
    let report = executor.run()?;

    print_run_summary(&report, dry_run);
    if dry_run {
        return Ok(if report.would_run() > 0 { 2 } else { 0 });
    }
    Ok(if report.ok() { 0 } else { 1 })
}

fn print_progress(event: &ProgressEvent) {
    match event {
        ProgressEvent::Queued { .. } => {}
        ProgressEvent::Running { unit } => eprintln!("  {} {unit}: running...", ">".cyan()),
        ProgressEvent::Succeeded { unit } => eprintln!("  {} {unit}: done", "ok".green()),
        ProgressEvent::Failed { unit, reason } => {
            eprintln!("  {} {unit}: {reason}", "FAIL".red().bold())
        }
        ProgressEvent::Skipped { unit, reason } => eprintln!("  {} {unit} ({reason})", "-".dimmed()),
    }
}

fn print_run_summary(report: &ExecutionReport, dry_run: bool) {
    if dry_run {
        println!("\nPlan:");
        for result in &report.results {
            let verdict = match result.status {
                UnitStatus::WouldRun => format!("would run ({})", result.reason).yellow(),
                UnitStatus::Fresh => "up-to-date".green().dimmed(),
                UnitStatus::Cached => "cached by pattern".dimmed(),
                _ => result.reason.as_str().red(),
            };
            println!("  {}: {}", result.label, verdict);
        }
        println!("\n{} stale, {} fresh", report.would_run(), report.fresh());
        return;
    }
    println!("\nSummary:");
    println!("  Total: {}", report.results.len());
    println!("  Executed: {}", report.executed());
    println!("  Fresh: {}", report.fresh());
    if report.skipped() > 0 {
        println!("  Skipped: {}", report.skipped());
    }
    if report.failed() > 0 {
        println!("  {}", format!("Failed: {}", report.failed()).red());
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_diff(
    target: Option<String>,
    refspec: Option<String>,
    rev: Option<String>,
    preprocess: Option<String>,
    unified: Option<u32>,
    ignore_whitespace: bool,
    summary: bool,
    no_color: bool,
) -> Result<i32> {
    let repo = Repo::discover()?;
    if refspec.is_some() && rev.is_some() {
        bail!("specify -r/--refspec or -R/--ref, not both");
    }
    let spec = match (refspec, rev) {
        (Some(spec), None) => spec,
        (None, Some(rev)) => parent_range(&rev),
        (None, None) => "HEAD".to_string(),
        (Some(_), Some(_)) => unreachable!("checked above"),
    };
    let range = repo.scm.resolve_range(&spec)?;

    let engine = DiffEngine {
        root: &repo.root,
        cache: &repo.cache,
        scm: &repo.scm,
        hasher: &repo.hasher,
    };
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();

    if summary {
        let records = match &target {
            Some(target) => status::expand_targets(&repo.root, std::slice::from_ref(target))?,
            None => status::expand_targets(&repo.root, &[])?,
        };
        return engine.summary(&records, &range, &mut lock);
    }

    let Some(target) = target else {
        bail!("a path is required (or use -s/--summary)");
    };
    // Diffing a record file means diffing its output.
    let data = output_path_for(Path::new(&target)).unwrap_or_else(|| PathBuf::from(&target));
    info!("diffing {} over {spec}", data.display());

    let color = if no_color || !std::io::stdout().is_terminal() {
        Some(false)
    } else {
        None
    };
    let opts = DiffOptions {
        unified,
        ignore_whitespace,
        color,
        preprocess,
    };
    engine.diff_path(&data, &range, &opts, &mut lock)
}

fn build_globset(patterns: &[String]) -> Result<Option<globset::GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = globset::GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            globset::Glob::new(pattern).with_context(|| format!("invalid glob '{pattern}'"))?,
        );
    }
    Ok(Some(builder.build()?))
}

/// Relative path from `base` to `target` (both absolute), `.`-style.
fn pathdiff(target: &Path, base: &Path) -> PathBuf {
    let target: Vec<_> = target.components().collect();
    let base: Vec<_> = base.components().collect();
    let common = target
        .iter()
        .zip(base.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..base.len() {
        out.push("..");
    }
    for component in &target[common..] {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}
