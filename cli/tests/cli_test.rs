use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;

fn bctrace() -> Command {
    Command::cargo_bin("bctrace").expect("bctrace binary")
}

fn write_demo(dir: &Path, extra: &[&str]) -> PathBuf {
    let out = dir.join("demo.bctm");
    bctrace()
        .current_dir(dir)
        .arg("demo")
        .arg(&out)
        .args(extra)
        .assert()
        .success()
        .stdout(predicate::str::starts_with("Wrote "));
    out
}

#[test]
fn test_demo_then_dump() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_demo(dir.path(), &[]);
    assert!(fs::read(&file).unwrap().starts_with(b"BCTM"));

    bctrace()
        .arg("dump")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::contains("# module __main__ from demo.py"))
        .stdout(predicate::str::contains("@<module>/factorial\tLOAD_FAST"))
        .stdout(predicate::str::contains("@<module>/<listcomp>#2\t"));
}

#[test]
fn test_dump_json_is_keyed_by_path() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_demo(dir.path(), &[]);

    let output = bctrace().arg("dump").arg(&file).arg("--json").output().unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let tree = value.as_object().expect("object keyed by path");
    let mut keys: Vec<&str> = tree.keys().map(String::as_str).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![
            "<module>",
            "<module>/<listcomp>",
            "<module>/<listcomp>#2",
            "<module>/factorial",
            "<module>/factorials_up_to",
        ]
    );
    for record in tree["<module>/factorial"].as_array().unwrap() {
        assert_eq!(record.as_array().unwrap().len(), 7);
    }
}

#[test]
fn test_dump_unknown_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    let file = write_demo(dir.path(), &[]);

    bctrace()
        .arg("dump")
        .arg(&file)
        .args(["--path", "<module>/missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no function at path '<module>/missing'"));
}

#[test]
fn test_demo_honours_config_and_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("format.toml");
    fs::write(&config, "[format]\nmap_lookup_cache = true\n").unwrap();
    let file = write_demo(
        dir.path(),
        &["--config", config.to_str().unwrap(), "--persistent-code", "false"],
    );

    bctrace()
        .arg("inspect")
        .arg(&file)
        .assert()
        .success()
        .stdout(predicate::str::starts_with(
            "format: persistent_code=false map_lookup_cache=true\n",
        ))
        .stdout(predicate::str::contains("block_name=factorial source_file=demo.py"));
}

#[test]
fn test_bad_config_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("format.toml");
    fs::write(&config, "[format]\nunknown_switch = true\n").unwrap();

    bctrace()
        .current_dir(dir.path())
        .args(["demo", "out.bctm", "--config"])
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid bytecode format config"));
    assert!(!dir.path().join("out.bctm").exists());
}

#[test]
fn test_missing_file_and_garbage_fail() {
    let dir = tempfile::tempdir().unwrap();
    let junk = dir.path().join("junk.bctm");
    fs::write(&junk, b"garbage").unwrap();

    bctrace()
        .arg("inspect")
        .arg(dir.path().join("absent.bctm"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read file"));

    bctrace()
        .arg("dump")
        .arg(&junk)
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not a valid module container"));
}

#[test]
fn test_parent_dir_paths_are_rejected() {
    bctrace()
        .args(["dump", "../outside.bctm"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Parent directory components"));
}
