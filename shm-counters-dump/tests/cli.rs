#![cfg(target_family = "unix")]
use assert_cmd::Command;
use shm_counters::{Config, CounterStore, Statics};

fn dump() -> Command {
    Command::cargo_bin("shm-counters-dump").expect("the binary is built")
}

#[test]
fn prints_counters() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        directory: dir.path().to_path_buf(),
        ..Config::default()
    };

    let mut statics = Statics::new();
    statics.insert("service".into(), "cli".into());
    let store = CounterStore::create_named("cli", &statics, 2, &config).unwrap();
    let counter = store.add_counter("hits", 9).unwrap();

    let path = config.path_for("cli").canonicalize().unwrap();
    let expected_start = format!("file: {}\nversion: 1\npid: {}\n", path.display(), std::process::id());
    let expected_counter = format!("counter: hits[{}]=9\n", counter.id());

    let output = dump().arg(&path).assert().success().get_output().stdout.clone();
    let output = String::from_utf8(output).unwrap();
    assert!(output.starts_with(&expected_start), "{output}");
    assert!(output.contains("\nstatic: service=cli\n"), "{output}");
    assert!(output.ends_with(&expected_counter), "{output}");

    let named = dump()
        .env(Config::DIRECTORY_ENV, dir.path())
        .args(["--named", "cli"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(String::from_utf8(named).unwrap(), output);
}

#[test]
fn rejects_malformed_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("garbage");
    std::fs::write(&path, vec![0u8; 4096]).unwrap();

    let assert = dump().arg(&path).assert().failure().code(1);
    let stderr = String::from_utf8_lossy(&assert.get_output().stderr).into_owned();
    assert!(stderr.contains("not yet initialized"), "{stderr}");
}

#[test]
fn rejects_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    dump().arg(dir.path().join("missing")).assert().failure().code(1);
}

#[test]
fn requires_a_file() {
    dump().assert().failure();
}
