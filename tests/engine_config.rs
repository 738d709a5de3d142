use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::{Builder, NamedTempFile};

use visionstream::config::EngineConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VISIONSTREAM_CONFIG",
        "VISIONSTREAM_STALL_THRESHOLD_MS",
        "VISIONSTREAM_CONNECT_TIMEOUT_MS",
        "VISIONSTREAM_RETRY_DELAYS_MS",
        "VISIONSTREAM_WATCHDOG_INTERVAL_MS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_json_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "stall_threshold_ms": 4000,
        "connect_timeout_ms": 15000,
        "retry_delays_ms": [0, 1000, 3000],
        "supported_codecs": ["h264"]
    }"#;
    file.write_all(json.as_bytes()).expect("write config");

    std::env::set_var("VISIONSTREAM_CONFIG", file.path());
    std::env::set_var("VISIONSTREAM_CONNECT_TIMEOUT_MS", "5000");

    let cfg = EngineConfig::load().expect("load config");

    assert_eq!(cfg.stall_threshold, Duration::from_millis(4000));
    assert_eq!(cfg.connect_timeout, Duration::from_millis(5000));
    assert_eq!(
        cfg.retry_delays,
        vec![
            Duration::ZERO,
            Duration::from_secs(1),
            Duration::from_secs(3)
        ]
    );
    assert_eq!(cfg.supported_codecs, vec!["h264"]);
    assert_eq!(cfg.watchdog_interval, Duration::from_millis(100));
    assert_eq!(cfg.retry_plan().max_attempts(), 3);

    clear_env();
}

#[test]
fn loads_toml_file_by_extension() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    let toml = "stall_threshold_ms = 2000\nwatchdog_interval_ms = 50\njoin_timeout_ms = 500\n";
    file.write_all(toml.as_bytes()).expect("write config");

    let cfg = EngineConfig::load_from(file.path()).expect("load config");
    assert_eq!(cfg.stall_threshold, Duration::from_secs(2));
    assert_eq!(cfg.watchdog_interval, Duration::from_millis(50));
    assert_eq!(cfg.join_timeout, Duration::from_millis(500));
    assert_eq!(cfg.retry_delays.len(), 5);

    clear_env();
}

#[test]
fn defaults_apply_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = EngineConfig::load().expect("load config");
    assert_eq!(cfg, EngineConfig::default());
}

#[test]
fn retry_delays_env_replaces_schedule() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VISIONSTREAM_RETRY_DELAYS_MS", "0, 250, 750");
    let cfg = EngineConfig::load().expect("load config");
    assert_eq!(
        cfg.retry_delays,
        [0, 250, 750].map(Duration::from_millis).to_vec()
    );

    std::env::set_var("VISIONSTREAM_RETRY_DELAYS_MS", "0,soon");
    assert!(EngineConfig::load().is_err());

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VISIONSTREAM_STALL_THRESHOLD_MS", "0");
    assert!(EngineConfig::load().is_err());
    clear_env();

    std::env::set_var("VISIONSTREAM_WATCHDOG_INTERVAL_MS", "fast");
    assert!(EngineConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "retry_delays_ms": [] }"#)
        .expect("write config");
    assert!(EngineConfig::load_from(file.path()).is_err());

    let mut file = NamedTempFile::new().expect("temp config");
    file.write_all(br#"{ "stall_threshold": 10 }"#)
        .expect("write config");
    let err = EngineConfig::load_from(file.path()).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    clear_env();
}
