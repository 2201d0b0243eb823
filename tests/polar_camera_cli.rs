use std::io::Write;
use std::process::{Command, ExitStatus};

use tempfile::NamedTempFile;

fn config_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(json.as_bytes()).expect("write config");
    file
}

fn run_daemon(config: &NamedTempFile, extra: &[&str]) -> ExitStatus {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_polar_camera"));
    for key in [
        "POLAR_CAMERA_CONFIG",
        "POLAR_CAMERA_SYSTEM",
        "POLAR_CAMERA_TOPIC",
        "POLAR_CAMERA_RATE_HZ",
        "POLAR_CAMERA_GRAB_TIMEOUT_MS",
        "POLAR_CAMERA_MAX_FAILURES",
    ] {
        cmd.env_remove(key);
    }
    cmd.env("RUST_LOG", "warn")
        .arg("--config")
        .arg(config.path())
        .args(extra)
        .status()
        .expect("run polar_camera")
}

#[test]
fn exits_nonzero_without_a_camera() {
    let config = config_file(r#"{"stub": {"devices": 0}}"#);
    let status = run_daemon(&config, &[]);

    assert!(!status.success());
    #[cfg(unix)]
    assert_eq!(status.code(), Some(255));
}

#[test]
fn exits_zero_after_frame_limit() {
    let config = config_file(r#"{"stub": {"devices": 1, "width": 32, "height": 24}}"#);
    let status = run_daemon(&config, &["--max-frames", "2", "--rate-hz", "100"]);

    assert!(status.success());
    assert_eq!(status.code(), Some(0));
}

#[test]
fn exits_one_on_invalid_config() {
    let config = config_file(r#"{"publish_rate_hz": 0}"#);
    let status = run_daemon(&config, &[]);

    assert_eq!(status.code(), Some(1));
}
