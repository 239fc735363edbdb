use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// A virt-server whose testbed accepts everything: commands run through
/// `true`, and every copyup leaves an empty file or directory behind.
const FAKE_SERVER: &str = r#"#!/bin/sh
echo ok
while read -r verb a b rest; do
  case "$verb" in
    open) echo "ok /tmp/adt-fake-scratch" ;;
    print-execute-command) echo "ok true" ;;
    capabilities) echo "ok" ;;
    copyup)
      case "$b" in
        */) mkdir -p "$b" ;;
        *) mkdir -p "$(dirname "$b")"; : > "$b" ;;
      esac
      echo ok ;;
    quit) exit 0 ;;
    *) echo ok ;;
  esac
done
"#;

fn adt_run() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("adt-run"));
    cmd.env_remove("ADT_LOG");
    cmd
}

fn write_server(dir: &Path) -> PathBuf {
    let path = dir.join("fake-virt");
    fs::write(&path, FAKE_SERVER).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn write_plan(dir: &Path, tests: &str) -> PathBuf {
    fs::create_dir_all(dir.join("tree")).unwrap();
    let path = dir.join("plan.json");
    fs::write(
        &path,
        format!(r#"[{{"name": "hello", "tree": "tree", "tests": [{tests}]}}]"#),
    )
    .unwrap();
    path
}

#[test]
fn help_describes_options() {
    adt_run()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--output-dir")
                .and(predicate::str::contains("--timeout-test"))
                .and(predicate::str::contains("VIRT-SERVER")),
        );
}

#[test]
fn bad_arguments_exit_20() {
    adt_run()
        .args(["--plan", "plan.json", "--needs-internet", "sometimes", "--", "true"])
        .assert()
        .code(20);
}

#[test]
fn missing_plan_exits_20() {
    let dir = tempfile::tempdir().unwrap();
    adt_run()
        .arg("--plan")
        .arg(dir.path().join("absent.json"))
        .args(["--", "true"])
        .assert()
        .code(20)
        .stderr(predicate::str::contains("read plan"));
}

#[test]
fn passing_test_exits_0_and_writes_summary() {
    let dir = tempfile::tempdir().unwrap();
    let server = write_server(dir.path());
    let plan = write_plan(dir.path(), r#"{"name": "smoke", "command": "true"}"#);
    let out = dir.path().join("out");

    adt_run()
        .arg("--plan")
        .arg(&plan)
        .arg("-o")
        .arg(&out)
        .arg("--")
        .arg(&server)
        .assert()
        .code(0)
        .stdout(predicate::str::contains("smoke").and(predicate::str::contains("PASS")));

    let summary = fs::read_to_string(out.join("summary")).unwrap();
    assert!(summary.starts_with("smoke"), "{summary}");
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(out.join("summary.json")).unwrap()).unwrap();
    assert_eq!(json["records"][0]["outcome"], "pass");
    assert!(json["fatal"].is_null());
}

#[test]
fn unsatisfiable_restriction_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let server = write_server(dir.path());
    let plan = write_plan(
        dir.path(),
        r#"{"name": "smoke", "command": "true"},
           {"name": "reboots", "command": "true", "restrictions": ["needs-reboot"]}"#,
    );

    adt_run()
        .arg("--plan")
        .arg(&plan)
        .arg("--")
        .arg(&server)
        .assert()
        .code(2)
        .stdout(predicate::str::contains("reboots").and(predicate::str::contains("SKIP")));
}

#[test]
fn dead_virt_server_exits_16() {
    let dir = tempfile::tempdir().unwrap();
    let plan = write_plan(dir.path(), r#"{"name": "smoke", "command": "true"}"#);

    adt_run()
        .arg("--plan")
        .arg(&plan)
        .args(["--", "false"])
        .assert()
        .code(16);
}
