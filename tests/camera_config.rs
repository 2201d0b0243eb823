use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use polar_camera::config::{CameraConfig, SystemKind};
use polar_camera::{ColorProcessing, PixelFormat};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "POLAR_CAMERA_CONFIG",
        "POLAR_CAMERA_SYSTEM",
        "POLAR_CAMERA_TOPIC",
        "POLAR_CAMERA_RATE_HZ",
        "POLAR_CAMERA_GRAB_TIMEOUT_MS",
        "POLAR_CAMERA_MAX_FAILURES",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "system": "stub",
        "topic": "lab/polar",
        "publish_rate_hz": 15,
        "grab_timeout_ms": 250,
        "max_consecutive_failures": 4,
        "color_processing": "nearest_neighbor",
        "stub": {
            "devices": 2,
            "width": 320,
            "height": 240,
            "pixel_format": "polarized8"
        }
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("POLAR_CAMERA_CONFIG", file.path());
    std::env::set_var("POLAR_CAMERA_RATE_HZ", "60");
    std::env::set_var("POLAR_CAMERA_GRAB_TIMEOUT_MS", "0");

    let cfg = CameraConfig::load().expect("load config");

    assert_eq!(cfg.system, SystemKind::Stub);
    assert_eq!(cfg.topic, "lab/polar");
    assert_eq!(cfg.publish_rate_hz, 60);
    assert_eq!(cfg.grab_timeout, None);
    assert_eq!(cfg.max_consecutive_failures, 4);
    assert_eq!(cfg.color_processing, ColorProcessing::NearestNeighbor);
    assert_eq!(cfg.stub.devices, 2);
    assert_eq!((cfg.stub.width, cfg.stub.height), (320, 240));
    assert_eq!(cfg.stub.pixel_format, PixelFormat::Polarized8);
    assert_eq!(cfg.acquirer().grab_timeout, None);
    assert_eq!(cfg.worker().max_consecutive_failures, 4);

    clear_env();
}

#[test]
fn loads_toml_config_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
topic = "lab/toml"
grab_timeout_ms = 500

[v4l2]
width = 1280
height = 720
"#;
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = CameraConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.topic, "lab/toml");
    assert_eq!(cfg.grab_timeout, Some(Duration::from_millis(500)));
    assert_eq!((cfg.v4l2.width, cfg.v4l2.height), (1280, 720));
    assert_eq!(cfg.publish_rate_hz, 30);

    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CameraConfig::load().expect("load defaults");
    assert_eq!(cfg.system, SystemKind::Stub);
    assert_eq!(cfg.topic, "polarcamera/image");
    assert_eq!(cfg.publish_rate_hz, 30);
    assert_eq!(cfg.grab_timeout, Some(Duration::from_millis(1000)));
    assert_eq!(cfg.max_consecutive_failures, 10);
    assert_eq!(cfg.stub.pixel_format, PixelFormat::BayerRG8);
}

#[test]
fn rejects_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("POLAR_CAMERA_SYSTEM", "gige");
    assert!(CameraConfig::load().is_err());
    clear_env();

    std::env::set_var("POLAR_CAMERA_RATE_HZ", "fast");
    assert!(CameraConfig::load().is_err());
    clear_env();

    std::env::set_var("POLAR_CAMERA_MAX_FAILURES", "0");
    assert!(CameraConfig::load().is_err());
    clear_env();
}

#[test]
fn rejects_malformed_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(b"{ \"publish_rate_hz\": \"thirty\" }")
        .expect("write config");
    assert!(CameraConfig::load_from(Some(file.path())).is_err());
    assert!(CameraConfig::load_from(Some(std::path::Path::new("/nonexistent/polar.json"))).is_err());
}
