// Integration tests for the peekaboo binary

#![allow(deprecated)] // Command::cargo_bin is deprecated but still functional

use assert_cmd::Command;
use peekaboo::reader::TraceReader;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn peekaboo() -> Command {
    Command::cargo_bin("peekaboo").unwrap()
}

/// The single trace root created under `out`
fn trace_root(out: &Path) -> PathBuf {
    let roots: Vec<_> = fs::read_dir(out)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_dir())
        .collect();
    assert_eq!(roots.len(), 1, "expected one trace root in {:?}", out);
    roots.into_iter().next().unwrap()
}

fn synth(out: &TempDir, args: &[&str]) -> assert_cmd::assert::Assert {
    peekaboo()
        .arg("synth")
        .arg("--output-dir")
        .arg(out.path())
        .args(args)
        .assert()
}

// ============================================================================
// synth
// ============================================================================

#[test]
fn test_synth_records_requested_instructions() {
    let out = TempDir::new().unwrap();
    synth(&out, &["-n", "500", "--mem-ops", "2"])
        .success()
        .stdout(predicate::str::contains("Trace written to"))
        .stdout(predicate::str::contains("Total instructions: 500"));

    let root = trace_root(out.path());
    assert!(root
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("synthetic-"));
    assert!(root.join("insn.bytemap").exists());
    assert!(root.join("process_tree.txt").exists());
}

#[test]
fn test_synth_multiple_threads() {
    let out = TempDir::new().unwrap();
    synth(&out, &["-n", "300", "--threads", "3", "--capacity", "64"])
        .success()
        .stdout(predicate::str::contains("Total instructions: 900"));

    let reader = TraceReader::open(trace_root(out.path())).unwrap();
    let pid = reader.processes().unwrap()[0];
    assert_eq!(reader.threads(pid).unwrap().len(), 3);
}

#[test]
fn test_synth_fork_creates_child_directory() {
    let out = TempDir::new().unwrap();
    synth(&out, &["-n", "200", "--fork-at", "80", "--capacity", "32"]).success();

    let root = trace_root(out.path());
    let reader = TraceReader::open(&root).unwrap();
    let processes = reader.processes().unwrap();
    assert_eq!(processes.len(), 2);
    assert_eq!(reader.process_tree().unwrap().len(), 2);

    let mut counts = Vec::new();
    for pid in processes {
        let tid = reader.threads(pid).unwrap()[0];
        counts.push(reader.thread(pid, tid).unwrap().instructions.len());
    }
    counts.sort_unstable();
    // the child only records what it executes after the fork
    assert_eq!(counts, vec![120, 200]);

    peekaboo().arg("verify").arg(&root).assert().success();
}

#[test]
fn test_synth_crash_flushes_pending_records() {
    let out = TempDir::new().unwrap();
    synth(&out, &["-n", "1000", "--crash-after", "150", "--capacity", "100"])
        .code(139)
        .stderr(predicate::str::contains("Emergency flush: flushed"));

    let reader = TraceReader::open(trace_root(out.path())).unwrap();
    let pid = reader.processes().unwrap()[0];
    let tid = reader.threads(pid).unwrap()[0];
    assert_eq!(reader.thread(pid, tid).unwrap().instructions.len(), 150);
}

#[test]
fn test_synth_rejects_zero_capacity() {
    let out = TempDir::new().unwrap();
    synth(&out, &["--capacity", "0"])
        .failure()
        .stderr(predicate::str::contains("capacity must be > 0"));
}

#[test]
fn test_synth_reads_config_file() {
    let out = TempDir::new().unwrap();
    let config = out.path().join("peekaboo.toml");
    fs::write(&config, "store_simd = true\n\n[capacities]\ninstruction = 16\n").unwrap();
    let traces = out.path().join("traces");

    peekaboo()
        .args(["synth", "-n", "40", "--config"])
        .arg(&config)
        .arg("--output-dir")
        .arg(&traces)
        .assert()
        .success();

    let reader = TraceReader::open(trace_root(&traces)).unwrap();
    let pid = reader.processes().unwrap()[0];
    let tid = reader.threads(pid).unwrap()[0];
    assert_eq!(reader.thread(pid, tid).unwrap().instructions.len(), 40);
}

// ============================================================================
// inspect / verify
// ============================================================================

#[test]
fn test_inspect_json_summary() {
    let out = TempDir::new().unwrap();
    synth(&out, &["-n", "250"]).success();
    let root = trace_root(out.path());

    let output = peekaboo()
        .arg("inspect")
        .arg(&root)
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());
    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["processes"][0]["threads"][0]["instructions"], 250);
    assert_eq!(summary["process_tree"].as_array().unwrap().len(), 1);
}

#[test]
fn test_inspect_text_summary() {
    let out = TempDir::new().unwrap();
    synth(&out, &["-n", "42"]).success();

    peekaboo()
        .arg("inspect")
        .arg(trace_root(out.path()))
        .assert()
        .success()
        .stdout(predicate::str::contains("Total instructions: 42"));
}

#[test]
fn test_inspect_lists_byte_map_in_hex() {
    let out = TempDir::new().unwrap();
    synth(&out, &["-n", "16"]).success();

    // first synthetic instruction at 0x400000 encodes as 48 89 00 c3
    peekaboo()
        .arg("inspect")
        .arg(trace_root(out.path()))
        .arg("--byte-map")
        .assert()
        .success()
        .stdout(predicate::str::contains("Raw-byte map:"))
        .stdout(predicate::str::contains("0x0000000000400000   4  488900c3"));
}

#[test]
fn test_verify_reports_partial_record() {
    let out = TempDir::new().unwrap();
    synth(&out, &["-n", "64"]).success();
    let root = trace_root(out.path());

    peekaboo()
        .arg("verify")
        .arg(&root)
        .assert()
        .success()
        .stdout(predicate::str::contains("OK"));

    let reader = TraceReader::open(&root).unwrap();
    let pid = reader.processes().unwrap()[0];
    let tid = reader.threads(pid).unwrap()[0];
    let insn = root.join(pid.to_string()).join(format!("insn.trace.{}", tid));
    let mut bytes = fs::read(&insn).unwrap();
    bytes.pop();
    fs::write(&insn, bytes).unwrap();

    peekaboo()
        .arg("verify")
        .arg(&root)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("not a whole number"));
}

#[test]
fn test_inspect_missing_root_fails() {
    peekaboo()
        .args(["inspect", "/nonexistent/peekaboo-trace"])
        .assert()
        .failure();
}
