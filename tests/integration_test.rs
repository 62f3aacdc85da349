//! End-to-end CLI tests: init, add, status, run, diff, cat, gc.

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn huella(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("huella").unwrap();
    cmd.current_dir(dir);
    cmd
}

fn init_repo() -> TempDir {
    let dir = TempDir::new().unwrap();
    huella(dir.path()).arg("init").assert().success();
    dir
}

fn git(dir: &Path, args: &[&str]) {
    let status = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

fn init_git(dir: &Path) -> bool {
    if std::process::Command::new("git")
        .arg("--version")
        .output()
        .is_err()
    {
        return false;
    }
    git(dir, &["init", "-q"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "user.name", "Test"]);
    true
}

#[test]
fn init_is_idempotent_and_root_prints() {
    let dir = init_repo();
    huella(dir.path()).arg("init").assert().success();

    let nested = dir.path().join("sub/dir");
    std::fs::create_dir_all(&nested).unwrap();
    huella(&nested)
        .arg("root")
        .assert()
        .success()
        .stdout(predicate::str::contains("../.."));
}

#[test]
fn add_then_status_is_fresh() {
    let dir = init_repo();
    std::fs::write(dir.path().join("data.csv"), "1,2,3\n").unwrap();

    huella(dir.path())
        .args(["add", "data.csv"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Added data.csv"));

    huella(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Fresh: 1, Stale: 0"));
}

#[test]
fn modified_output_goes_stale_with_exit_2() {
    let dir = init_repo();
    std::fs::write(dir.path().join("data.csv"), "v1\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();

    std::fs::write(dir.path().join("data.csv"), "v2\n").unwrap();
    huella(dir.path())
        .arg("status")
        .assert()
        .code(2)
        .stdout(predicate::str::contains("data.csv"))
        .stdout(predicate::str::contains("Fresh: 0, Stale: 1"));
}

#[test]
fn status_json_has_state_and_reason() {
    let dir = init_repo();
    std::fs::write(dir.path().join("data.csv"), "v1\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();
    std::fs::write(dir.path().join("data.csv"), "v2\n").unwrap();

    let output = huella(dir.path())
        .args(["status", "--json"])
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(value["data.csv"]["state"], "data-stale");
    assert!(value["data.csv"]["reason"].as_str().unwrap().contains("hash mismatch"));
}

#[test]
fn fresh_pipeline_run_is_a_no_op() {
    // S1: two records, everything up to date, zero subprocesses.
    let dir = init_repo();
    std::fs::write(dir.path().join("a.txt"), "alpha\n").unwrap();
    huella(dir.path()).args(["add", "a.txt"]).assert().success();
    std::fs::write(dir.path().join("b.txt"), "beta\n").unwrap();
    huella(dir.path())
        .args([
            "add", "b.txt", "--dep", "a.txt", "--cmd",
            "cp a.txt b.txt && echo ran >> run.log",
        ])
        .assert()
        .success();
    // b's content does not match its command's effect, but its record was
    // added from the file as-is, so everything is fresh.
    huella(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Executed: 0"))
        .stdout(predicate::str::contains("Fresh: 2"));
    assert!(!dir.path().join("run.log").exists());
}

#[test]
fn dep_change_cascades_through_run() {
    // S2: a changes, its record is refreshed, b reruns and records the
    // new dep hash.
    let dir = init_repo();
    std::fs::write(dir.path().join("a.txt"), "v1\n").unwrap();
    huella(dir.path()).args(["add", "a.txt"]).assert().success();
    std::fs::write(dir.path().join("b.txt"), "v1\n").unwrap();
    huella(dir.path())
        .args(["add", "b.txt", "--dep", "a.txt", "--cmd", "cp a.txt b.txt"])
        .assert()
        .success();

    std::fs::write(dir.path().join("a.txt"), "v2 changed\n").unwrap();
    huella(dir.path()).args(["add", "a.txt"]).assert().success();

    huella(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Executed: 1"));

    assert_eq!(
        std::fs::read_to_string(dir.path().join("b.txt")).unwrap(),
        "v2 changed\n"
    );
    let b_record = std::fs::read_to_string(dir.path().join("b.txt.hua")).unwrap();
    let a_record = std::fs::read_to_string(dir.path().join("a.txt.hua")).unwrap();
    // b's recorded dep hash equals a's current output hash.
    let a_md5 = a_record
        .lines()
        .find_map(|l| l.trim().trim_start_matches("- ").strip_prefix("md5: "))
        .unwrap();
    assert!(b_record.contains(a_md5));
}

#[test]
fn co_outputs_run_one_subprocess() {
    // S3: byte-identical commands collapse into one unit.
    let dir = init_repo();
    let cmd = "echo ran >> gen.log && printf x > x.txt && printf y > y.txt";
    huella(dir.path())
        .args(["add", "x.txt", "--cmd", cmd])
        .assert()
        .success()
        .stdout(predicate::str::contains("placeholder"));
    huella(dir.path())
        .args(["add", "y.txt", "--cmd", cmd])
        .assert()
        .success();

    huella(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Executed: 1"));

    let log = std::fs::read_to_string(dir.path().join("gen.log")).unwrap();
    assert_eq!(log.lines().count(), 1, "gen ran exactly once");
    for out in ["x.txt", "y.txt"] {
        let record = std::fs::read_to_string(dir.path().join(format!("{out}.hua"))).unwrap();
        assert!(record.contains("md5:"), "{out} record filled in");
    }
}

#[test]
fn dry_run_reports_plan_with_exit_2() {
    let dir = init_repo();
    huella(dir.path())
        .args(["add", "out.txt", "--cmd", "printf x > out.txt"])
        .assert()
        .success();

    huella(dir.path())
        .args(["run", "--dry-run"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("would run"));
    assert!(!dir.path().join("out.txt").exists(), "nothing executed");
}

#[test]
fn cycle_is_a_plan_error_with_exit_3() {
    let dir = init_repo();
    std::fs::write(dir.path().join("a.txt"), "a\n").unwrap();
    std::fs::write(dir.path().join("b.txt"), "b\n").unwrap();
    huella(dir.path())
        .args(["add", "a.txt", "--dep", "b.txt", "--cmd", "make a"])
        .assert()
        .success();
    huella(dir.path())
        .args(["add", "b.txt", "--dep", "a.txt", "--cmd", "make b"])
        .assert()
        .success();

    huella(dir.path())
        .arg("run")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn force_upstream_pattern_forces_matching_units() {
    // S4: a fresh unit under raw/ reruns when forced by pattern.
    let dir = init_repo();
    std::fs::create_dir_all(dir.path().join("raw")).unwrap();
    huella(dir.path())
        .args([
            "add", "raw/r.txt", "--cmd",
            "echo ran >> raw.log && printf data > raw/r.txt",
        ])
        .assert()
        .success();
    huella(dir.path()).arg("run").assert().success();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("raw.log")).unwrap().lines().count(),
        1
    );

    // Fresh now; a plain run does nothing.
    huella(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("Executed: 0"));

    huella(dir.path())
        .args(["run", "--force-upstream", "raw/*"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Executed: 1"));
    assert_eq!(
        std::fs::read_to_string(dir.path().join("raw.log")).unwrap().lines().count(),
        2
    );
}

#[test]
fn cached_pattern_holds_stale_units_back() {
    let dir = init_repo();
    huella(dir.path())
        .args(["add", "out.txt", "--cmd", "printf x > out.txt"])
        .assert()
        .success();

    huella(dir.path())
        .args(["run", "--cached", "out.*"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Executed: 0"));
    assert!(!dir.path().join("out.txt").exists());
}

#[test]
fn failed_unit_reports_and_exits_nonzero() {
    let dir = init_repo();
    huella(dir.path())
        .args(["add", "out.txt", "--cmd", "echo boom >&2; exit 9"])
        .assert()
        .success();

    huella(dir.path())
        .arg("run")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Failed: 1"))
        .stderr(predicate::str::contains("exit status 9"));
}

#[test]
fn cat_streams_cached_content() {
    let dir = init_repo();
    std::fs::write(dir.path().join("data.csv"), "cached content\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();

    // Even after the working file changes, cat serves the cached bytes.
    std::fs::write(dir.path().join("data.csv"), "drifted\n").unwrap();
    huella(dir.path())
        .args(["cat", "data.csv"])
        .assert()
        .success()
        .stdout(predicate::eq("cached content\n"));
}

#[test]
fn cache_path_and_md5_expose_layout() {
    let dir = init_repo();
    std::fs::write(dir.path().join("data.csv"), "abc\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();

    let md5_out = huella(dir.path())
        .args(["cache", "md5", "data.csv"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let md5 = String::from_utf8(md5_out).unwrap().trim().to_string();
    assert_eq!(md5.len(), 32);

    huella(dir.path())
        .args(["cache", "path", "data.csv"])
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{}/{}", &md5[..2], &md5[2..])));
}

#[test]
fn remove_and_gc_reclaim_space() {
    let dir = init_repo();
    std::fs::write(dir.path().join("data.csv"), "some bytes here\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();

    huella(dir.path())
        .args(["remove", "data.csv"])
        .assert()
        .success();
    assert!(!dir.path().join("data.csv.hua").exists());

    huella(dir.path())
        .args(["gc", "--workspace", "--dry"])
        .assert()
        .success()
        .stdout(predicate::str::contains("would remove"));

    huella(dir.path())
        .args(["gc", "--workspace"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 object(s)"));
}

#[test]
fn hash_cache_clear_and_verify() {
    let dir = init_repo();
    std::fs::write(dir.path().join("data.csv"), "payload\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();

    huella(dir.path())
        .args(["hash-cache", "verify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("verified"));

    huella(dir.path())
        .args(["hash-cache", "clear"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared"));
}

#[test]
fn directory_diff_between_commits() {
    // S5: manifest diff shows added, removed, and modified entries in
    // alphabetical order.
    let dir = init_repo();
    if !init_git(dir.path()) {
        return;
    }
    let d = dir.path().join("d");
    std::fs::create_dir_all(&d).unwrap();
    std::fs::write(d.join("a"), "a-old\n").unwrap();
    std::fs::write(d.join("b"), "b-old\n").unwrap();
    huella(dir.path()).args(["add", "d"]).assert().success();
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-q", "-m", "one"]);

    std::fs::write(d.join("a"), "a-new\n").unwrap();
    std::fs::remove_file(d.join("b")).unwrap();
    std::fs::write(d.join("c"), "c-new\n").unwrap();
    huella(dir.path()).args(["add", "d"]).assert().success();
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-q", "-m", "two"]);

    let output = huella(dir.path())
        .args(["diff", "-r", "HEAD^..HEAD", "d"])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 4, "{text}");
    assert!(lines[0].starts_with("- d/a"), "{text}");
    assert!(lines[1].starts_with("+ d/a"), "{text}");
    assert!(lines[2].starts_with("- d/b"), "{text}");
    assert!(lines[3].starts_with("+ d/c"), "{text}");
}

#[test]
fn preprocessed_diff_compares_transformed_sides() {
    // S6: the preprocessing command shapes what gets compared.
    let dir = init_repo();
    if !init_git(dir.path()) {
        return;
    }
    std::fs::write(dir.path().join("data.csv"), "header\nold-body\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-q", "-m", "one"]);

    std::fs::write(dir.path().join("data.csv"), "header\nnew-body\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-q", "-m", "two"]);

    // First lines are identical after preprocessing.
    huella(dir.path())
        .args(["diff", "-r", "HEAD^..HEAD", "-x", "head -n 1 {}", "data.csv"])
        .assert()
        .code(0);

    // Last lines differ.
    huella(dir.path())
        .args(["diff", "-r", "HEAD^..HEAD", "-x", "tail -n 1 {}", "data.csv"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("-old-body"))
        .stdout(predicate::str::contains("+new-body"));
}

#[test]
fn diff_summary_lists_hash_transitions() {
    let dir = init_repo();
    if !init_git(dir.path()) {
        return;
    }
    std::fs::write(dir.path().join("data.csv"), "v1\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-q", "-m", "one"]);

    std::fs::write(dir.path().join("data.csv"), "v2\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();

    huella(dir.path())
        .args(["diff", "--summary", "-r", "HEAD"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_match(r"data\.csv: [0-9a-f]{8} -> [0-9a-f]{8}").unwrap());
}

#[test]
fn diff_same_revision_is_empty() {
    let dir = init_repo();
    if !init_git(dir.path()) {
        return;
    }
    std::fs::write(dir.path().join("data.csv"), "stable\n").unwrap();
    huella(dir.path()).args(["add", "data.csv"]).assert().success();
    git(dir.path(), &["add", "-A"]);
    git(dir.path(), &["commit", "-q", "-m", "one"]);

    huella(dir.path())
        .args(["diff", "-r", "HEAD..HEAD", "data.csv"])
        .assert()
        .code(0)
        .stdout(predicate::str::is_empty());
}

#[test]
fn run_outside_repo_fails_cleanly() {
    let dir = TempDir::new().unwrap();
    huella(dir.path())
        .arg("status")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("huella init"));
}
