use std::fs;
use std::io::Write;
use std::process::{Command, Stdio};

fn sed(fake: &str) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_sed"));
    cmd.env_remove("GPU_UTILS_STRICT")
        .env_remove("GPU_UTILS_CONFIG")
        .env_remove("GPU_UTILS_FAIL_BACKENDS")
        .env("GPU_UTILS_FAKE_BACKENDS", fake);
    cmd
}

fn with_stdin(mut cmd: Command, input: &str) -> std::process::Output {
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    child
        .stdin
        .take()
        .unwrap()
        .write_all(input.as_bytes())
        .unwrap();
    child.wait_with_output().unwrap()
}

#[test]
fn edits_stdin() {
    let mut cmd = sed("metal");
    cmd.arg("s/cat/dog/g");
    let out = with_stdin(cmd, "cat cat\nbird\n");
    assert!(out.status.success());
    assert_eq!(out.stdout, b"dog dog\nbird\n");
}

#[test]
fn script_features() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("in.txt");
    fs::write(&file, "one\ntwo\nthree\n").unwrap();
    let path = file.to_str().unwrap();

    let out = sed("none").args(["-n", "/t/p", path]).output().unwrap();
    assert_eq!(out.stdout, b"two\nthree\n");

    let out = sed("none").args(["-e", "1d", "-e", "s/\\(t\\)/[\\1]/", path]).output().unwrap();
    assert_eq!(out.stdout, b"[t]wo\n[t]hree\n");

    let out = sed("none").args(["-E", "s/(o+)/<\\1>/", path]).output().unwrap();
    assert_eq!(out.stdout, b"<o>ne\ntw<o>\nthree\n");

    let out = sed("none").args(["2q", path]).output().unwrap();
    assert_eq!(out.stdout, b"one\ntwo\n");
}

#[test]
fn exit_codes() {
    let out = sed("none").args(["k", "-"]).output().unwrap();
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown command"));

    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing");
    let out = sed("none")
        .args(["p", missing.to_str().unwrap()])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn literal_script_runs_on_forced_gpu() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("in.txt");
    fs::write(&file, "a-b-c\nabc").unwrap();
    let path = file.to_str().unwrap();

    let cpu = sed("none").args(["--cpu", "s/-/+/g", path]).output().unwrap();
    let gpu = sed("metal").args(["--metal", "s/-/+/g", path]).output().unwrap();
    assert!(gpu.status.success());
    assert_eq!(gpu.stdout, cpu.stdout);
    assert_eq!(gpu.stdout, b"a+b+c\nabc");

    // Addressed commands have no GPU kernel.
    let out = sed("metal").args(["--metal", "1s/-/+/", path]).output().unwrap();
    assert_eq!(out.status.code(), Some(69));
    assert!(String::from_utf8_lossy(&out.stderr).contains("no metal kernel registered for sed/stream-edit"));
}
