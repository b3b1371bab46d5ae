use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::{json, Value};

mod common;

use common::{environment_tarball, write_settings};

fn parse_envelope(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("json envelope")
}

#[test]
fn hash_is_content_based() {
    let temp = tempfile::tempdir().expect("tempdir");
    let tarball = environment_tarball(temp.path(), "env.tar.gz", "1.3.1");
    let copy = temp.path().join("renamed.tar.gz");
    fs::copy(&tarball, &copy).expect("copy");

    let first = cargo_bin_cmd!("mlpool")
        .args(["hash"])
        .arg(&tarball)
        .assert()
        .success();
    let second = cargo_bin_cmd!("mlpool")
        .args(["hash"])
        .arg(&copy)
        .assert()
        .success();

    let first = String::from_utf8_lossy(&first.get_output().stdout).trim().to_string();
    let second = String::from_utf8_lossy(&second.get_output().stdout).trim().to_string();
    assert_eq!(first.len(), 64);
    assert_eq!(first, second);
}

#[test]
fn predict_runs_a_model_in_its_environment() {
    let temp = tempfile::tempdir().expect("tempdir");
    environment_tarball(temp.path(), "env.tar.gz", "1.3.1");
    let settings = write_settings(
        temp.path(),
        "model-settings.json",
        &json!({
            "name": "env-model",
            "implementation": "environment",
            "parameters": { "version": "v1", "environment_tarball": "env.tar.gz" }
        }),
    );
    let envs = temp.path().join("envs");

    let assert = cargo_bin_cmd!("mlpool")
        .env("MLPOOL_ENVIRONMENTS_DIR", &envs)
        .args(["--json", "--workers", "2", "predict", "--target", "env-model", "--model"])
        .arg(&settings)
        .assert()
        .success();

    let envelope = parse_envelope(&assert.get_output().stdout);
    assert_eq!(envelope["status"], "ok");
    assert_eq!(envelope["details"]["model"], "env-model:v1");
    assert_eq!(envelope["details"]["outputs"]["version"], "1.3.1");
    assert_eq!(envelope["details"]["pools"], 2);
    let leftovers: Vec<_> = fs::read_dir(&envs)
        .map(|entries| entries.filter_map(Result::ok).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "environment removed on close: {leftovers:?}");
}

#[test]
fn predict_routes_to_the_named_model() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adder = write_settings(
        temp.path(),
        "adder.json",
        &json!({ "name": "adder", "implementation": "sum" }),
    );
    let echo = write_settings(
        temp.path(),
        "echo.json",
        &json!({ "name": "echo", "implementation": "echo" }),
    );

    let assert = cargo_bin_cmd!("mlpool")
        .env("MLPOOL_ENVIRONMENTS_DIR", temp.path().join("envs"))
        .args(["--json", "predict", "--target", "adder", "--payload", r#"{"inputs":[2,3]}"#])
        .arg("--model")
        .arg(&adder)
        .arg("--model")
        .arg(&echo)
        .assert()
        .success();

    let envelope = parse_envelope(&assert.get_output().stdout);
    assert_eq!(envelope["details"]["outputs"]["total"], 5.0);
    assert_eq!(envelope["details"]["pool"], "default");
    assert_eq!(envelope["details"]["pools"], 1);
}

#[test]
fn unknown_target_is_a_user_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let adder = write_settings(
        temp.path(),
        "adder.json",
        &json!({ "name": "adder", "implementation": "sum" }),
    );

    let assert = cargo_bin_cmd!("mlpool")
        .env("MLPOOL_ENVIRONMENTS_DIR", temp.path().join("envs"))
        .args(["--json", "predict", "--target", "missing", "--model"])
        .arg(&adder)
        .assert()
        .code(1);

    let envelope = parse_envelope(&assert.get_output().stdout);
    assert_eq!(envelope["status"], "user-error");
    assert_eq!(envelope["details"]["loaded"], json!(["adder"]));
}

#[test]
fn corrupt_environment_fails_with_extraction_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("broken.tar.gz"), [0x1f, 0x8b, 0x08, 0x00]).expect("write");
    let settings = write_settings(
        temp.path(),
        "broken.json",
        &json!({
            "name": "broken",
            "implementation": "environment",
            "parameters": { "environment_tarball": "broken.tar.gz" }
        }),
    );

    let assert = cargo_bin_cmd!("mlpool")
        .env("MLPOOL_ENVIRONMENTS_DIR", temp.path().join("envs"))
        .args(["--json", "predict", "--target", "broken", "--model"])
        .arg(&settings)
        .assert()
        .code(2);

    let envelope = parse_envelope(&assert.get_output().stdout);
    assert_eq!(envelope["status"], "error");
    assert_eq!(envelope["details"]["code"], "MP101");
}

#[test]
fn envs_list_and_prune() {
    let temp = tempfile::tempdir().expect("tempdir");
    let envs = temp.path().join("envs");
    fs::create_dir_all(envs.join("deadbeef")).expect("mkdir");
    fs::write(envs.join("deadbeef").join("VERSION"), "1\n").expect("write");

    let listed = cargo_bin_cmd!("mlpool")
        .args(["--json", "--environments-dir"])
        .arg(&envs)
        .args(["envs", "list"])
        .assert()
        .success();
    let envelope = parse_envelope(&listed.get_output().stdout);
    assert_eq!(envelope["details"]["environments"][0]["hash"], "deadbeef");

    cargo_bin_cmd!("mlpool")
        .args(["-q", "--environments-dir"])
        .arg(&envs)
        .args(["envs", "prune"])
        .assert()
        .success();
    assert!(!envs.join("deadbeef").exists());
}

#[test]
fn worker_speaks_json_lines() {
    let requests = [
        json!({ "id": 1, "command": { "type": "Ping" } }),
        json!({
            "id": 2,
            "command": {
                "type": "LoadModel",
                "settings": { "name": "adder", "implementation": "sum" }
            }
        }),
        json!({
            "id": 3,
            "command": {
                "type": "Predict",
                "name": "adder",
                "version": null,
                "payload": { "inputs": [4, 5] }
            }
        }),
        json!({ "id": 4, "command": { "type": "Shutdown" } }),
    ];
    let stdin: String = requests.iter().map(|request| format!("{request}\n")).collect();

    let assert = cargo_bin_cmd!("mlpool")
        .arg("worker")
        .write_stdin(stdin)
        .assert()
        .success();

    let replies: Vec<Value> = String::from_utf8_lossy(&assert.get_output().stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("reply json"))
        .collect();
    assert_eq!(replies.len(), 4, "ready + three replies: {replies:?}");
    assert_eq!(replies[0]["id"], 0);
    assert_eq!(replies[0]["payload"]["type"], "Ready");
    assert_eq!(replies[1]["payload"]["type"], "Pong");
    assert_eq!(replies[2]["payload"]["type"], "ModelLoaded");
    assert_eq!(replies[3]["id"], 3);
    assert_eq!(replies[3]["payload"]["outputs"]["total"], 9.0);
}
