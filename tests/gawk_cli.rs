use std::fs;
use std::process::Command;

fn gawk(fake: &str) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_gawk"));
    cmd.env_remove("GPU_UTILS_STRICT")
        .env_remove("GPU_UTILS_CONFIG")
        .env_remove("GPU_UTILS_FAIL_BACKENDS")
        .env("GPU_UTILS_FAKE_BACKENDS", fake);
    cmd
}

fn fixture() -> (tempfile::TempDir, String) {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("people.txt");
    fs::write(&file, "ann 31 oslo\nbob 27 rome\ncid 45 lima\n").unwrap();
    let path = file.to_str().unwrap().to_string();
    (dir, path)
}

#[test]
fn projects_fields() {
    let (_dir, path) = fixture();
    let out = gawk("vulkan").args(["{ print $3, $1 }", &path]).output().unwrap();
    assert!(out.status.success());
    assert_eq!(out.stdout, b"oslo ann\nrome bob\nlima cid\n");
}

#[test]
fn patterns_begin_end_and_vars() {
    let (_dir, path) = fixture();
    let out = gawk("none")
        .args([
            "-v",
            "sep=|",
            "BEGIN { print \"name\" }\n$2 ~ /^[34]/ { print $1 sep $2 }\nEND { print NR }",
            &path,
        ])
        .output()
        .unwrap();
    assert!(out.status.success());
    assert_eq!(out.stdout, b"name\nann|31\ncid|45\n3\n");
}

#[test]
fn custom_separator() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("t.csv");
    fs::write(&file, "a,b,c\nd,,f\n").unwrap();
    let out = gawk("none")
        .args(["-F", ",", "{ print $2, NF }", file.to_str().unwrap()])
        .output()
        .unwrap();
    assert_eq!(out.stdout, b"b 3\n 3\n");
}

#[test]
fn exit_codes() {
    let (_dir, path) = fixture();
    let out = gawk("none").args(["{ print $1", &path]).output().unwrap();
    assert_eq!(out.status.code(), Some(2));

    let out = gawk("none").args(["{ print }", "/nonexistent/input"]).output().unwrap();
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn projection_matches_across_backends() {
    let (_dir, path) = fixture();
    let cpu = gawk("none").args(["--cpu", "NR==2 { print NF, $NF }", &path]).output().unwrap();
    for flag in ["--metal", "--vulkan"] {
        let gpu = gawk("metal,vulkan")
            .args([flag, "NR==2 { print NF, $NF }", &path])
            .output()
            .unwrap();
        assert!(gpu.status.success(), "{flag}");
        assert_eq!(gpu.stdout, cpu.stdout);
    }
    assert_eq!(cpu.stdout, b"3 rome\n");

    let out = gawk("metal").args(["--metal", "/bob/", &path]).output().unwrap();
    assert_eq!(out.status.code(), Some(69));
}
