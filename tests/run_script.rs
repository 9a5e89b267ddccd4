use std::io::Write;
use std::process::Command;

fn blockjit() -> Command {
    Command::new(env!("CARGO_BIN_EXE_blockjit"))
}

fn script_file(json: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().expect("temp file");
    file.write_all(json.as_bytes()).expect("write script");
    file
}

const COUNTDOWN: &str = r#"{
  "variables": {"n": 3},
  "script": [
    {"op": "while", "cond": {"op": "gt", "a": {"op": "var", "name": "n"}, "b": 0}, "body": [
      {"op": "say", "value": {"op": "var", "name": "n"}},
      {"op": "change", "var": "n", "by": -1}
    ]},
    {"op": "say", "value": "liftoff"}
  ]
}"#;

#[test]
fn run_prints_output_and_tick_count() {
    let file = script_file(COUNTDOWN);
    let out = blockjit().arg("run").arg(file.path()).output().expect("failed to run blockjit");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "3\n2\n1\nliftoff\n");
    assert!(String::from_utf8_lossy(&out.stderr).contains("finished after 4 ticks"));
}

#[test]
fn warp_finishes_in_one_tick() {
    let file = script_file(COUNTDOWN);
    let out = blockjit()
        .arg("run")
        .arg(file.path())
        .args(["--warp", "--verify", "--opt-level", "none"])
        .output()
        .expect("failed to run blockjit");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "3\n2\n1\nliftoff\n");
    assert!(String::from_utf8_lossy(&out.stderr).contains("finished after 1 ticks"));
}

#[test]
fn tick_limit_stops_a_running_script() {
    let file = script_file(
        r#"{"script": [{"op": "while", "cond": true, "body": [{"op": "yield"}]}]}"#,
    );
    let out = blockjit()
        .arg("run")
        .arg(file.path())
        .args(["--ticks", "5"])
        .output()
        .expect("failed to run blockjit");
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("still running after 5 ticks"));
}

#[test]
fn procedures_and_lists() {
    let file = script_file(
        r#"{
          "lists": {"squares": []},
          "procedures": [
            {"name": "square %s", "args": ["x"], "body": [
              {"op": "append", "list": "squares", "item": {"op": "mul", "a": {"op": "arg", "name": "x"}, "b": {"op": "arg", "name": "x"}}}
            ]}
          ],
          "script": [
            {"op": "repeat", "times": 4, "body": [
              {"op": "call", "name": "square %s", "args": [{"op": "add", "a": {"op": "loop_index"}, "b": 1}]}
            ]},
            {"op": "say", "value": {"op": "contents", "list": "squares"}},
            {"op": "say", "value": {"op": "index_of", "list": "squares", "item": 9}}
          ]
        }"#,
    );
    let out = blockjit().arg("run").arg(file.path()).arg("--warp").output().expect("failed to run blockjit");
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    assert_eq!(String::from_utf8_lossy(&out.stdout), "1 4 9 16\n2\n");
}

#[test]
fn unknown_variable_is_an_error() {
    let file = script_file(r#"{"script": [{"op": "say", "value": {"op": "var", "name": "ghost"}}]}"#);
    let out = blockjit().arg("run").arg(file.path()).output().expect("failed to run blockjit");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("unknown variable `ghost`"));
}

#[test]
fn malformed_json_is_an_error() {
    let file = script_file("{\"script\": [");
    let out = blockjit().arg("run").arg(file.path()).output().expect("failed to run blockjit");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("invalid script"));
}

#[test]
fn missing_file_is_an_error() {
    let out = blockjit().args(["run", "/nonexistent/script.json"]).output().expect("failed to run blockjit");
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("cannot read"));
}
