use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn vvtest(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("vvtest").unwrap();
    cmd.current_dir(dir).env_remove("RUST_LOG");
    cmd
}

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).unwrap();
}

const CONFIG: &str = r#"
[vvtest]
test_dir = "TestResults"
tick_millis = 50

[platform]
type = "local"
num_procs = 2

[report]
output_dir = "out"
results_json = "results.json"
"#;

#[test]
fn test_run_all_pass() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "vvtest.toml", CONFIG);
    write(
        dir.path(),
        "tests.toml",
        r#"
[[test]]
name = "mesh"
file = "mesh.vvt"
command = ["sh", "-c", "touch mesh.exo"]

[[test]]
name = "heat"
file = "heat.vvt"
params = { np = 2 }
command = ["sh", "-c", "test -f ../mesh/mesh.exo"]
depends_on = [{ pattern = "mesh" }]
"#,
    );

    vvtest(dir.path())
        .args(["run", "tests.toml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total number of tests: 2"))
        .stdout(predicate::str::contains("Progress: 2/2 = 100.0%"))
        .stdout(predicate::str::contains("All tests passed!"));

    let json = std::fs::read_to_string(dir.path().join("out/results.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value[0]["name"], "mesh");
    assert_eq!(value[1]["execute_directory"], "heat.np=2");
    assert!(dir.path().join("TestResults/mesh/execute.log").exists());
}

#[test]
fn test_run_diff_exits_two() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "vvtest.toml", CONFIG);
    write(
        dir.path(),
        "tests.toml",
        r#"
[[test]]
name = "close"
file = "close.vvt"
command = ["sh", "-c", "exit 64"]
"#,
    );

    vvtest(dir.path())
        .args(["run", "tests.toml"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Some tests diffed."));
}

#[test]
fn test_run_failed_dependency_writes_junit() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "vvtest.toml", CONFIG);
    write(
        dir.path(),
        "tests.toml",
        r#"
[[test]]
name = "broken"
file = "broken.vvt"
command = ["sh", "-c", "echo going down; exit 3"]

[[test]]
name = "after"
file = "after.vvt"
command = ["true"]
depends_on = [{ pattern = "broken", result = "pass" }]
"#,
    );

    vvtest(dir.path())
        .args(["run", "tests.toml", "--junit", "junit.xml"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("Some tests failed."));

    let xml = std::fs::read_to_string(dir.path().join("junit.xml")).unwrap();
    assert!(xml.contains(r#"<failure message="FAIL"/>"#));
    assert!(xml.contains("going down"));
    assert!(xml.contains(r#"<skipped message="SKIP"/>"#));
}

#[test]
fn test_run_keyword_filter() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "vvtest.toml", CONFIG);
    write(
        dir.path(),
        "tests.toml",
        r#"
[[test]]
name = "quick"
file = "quick.vvt"
keywords = ["fast"]
command = ["true"]

[[test]]
name = "slow"
file = "slow.vvt"
command = ["false"]
"#,
    );

    vvtest(dir.path())
        .args(["run", "tests.toml", "-k", "fast"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total number of tests: 1"));
}

#[test]
fn test_list_json() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "tests.toml",
        r#"
[[test]]
name = "heat"
file = "sub/heat.vvt"
params = { np = 4 }
"#,
    );

    vvtest(dir.path())
        .args(["list", "tests.toml", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""execute_directory": "sub/heat.np=4""#))
        .stdout(predicate::str::contains(r#""result": "notrun""#));
}

#[test]
fn test_validate() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "vvtest.toml", CONFIG);

    vvtest(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Platform: local"));

    write(dir.path(), "vvtest.toml", "[vvtest]\ntick_millis = \"soon\"\n");
    vvtest(dir.path())
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_run_missing_manifest() {
    let dir = TempDir::new().unwrap();
    vvtest(dir.path())
        .args(["run", "nope.toml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load manifest"));
}

#[test]
fn test_run_keyword_groups() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "vvtest.toml", CONFIG);
    write(
        dir.path(),
        "tests.toml",
        r#"
[[test]]
name = "quick"
file = "quick.vvt"
keywords = ["fast"]
command = ["true"]

[[test]]
name = "smoke"
file = "smoke.vvt"
keywords = ["fast", "long"]
command = ["false"]

[[test]]
name = "slow"
file = "slow.vvt"
keywords = ["long"]
command = ["false"]
"#,
    );

    vvtest(dir.path())
        .args(["run", "tests.toml", "-K", "fast/medium", "-K", "!long"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Total number of tests: 1"));
}
