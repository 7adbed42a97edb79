use std::io::Write;
use std::time::Duration;

use serial_test::serial;
use sessionpulse::config::Config;

const VARS: &[&str] = &[
    "SESSIONPULSE_FLUSH_DELAY",
    "SESSIONPULSE_FLUSH_THRESHOLD",
    "SESSIONPULSE_REAPER_INTERVAL",
    "SESSIONPULSE_DATABASE_ENDPOINT",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

fn write_config(yaml: &str) -> std::path::PathBuf {
    let path = std::env::temp_dir().join(format!(
        "sessionpulse-config-{}-{}.yaml",
        std::process::id(),
        yaml.len()
    ));
    let mut file = std::fs::File::create(&path).expect("create config");
    file.write_all(yaml.as_bytes()).expect("write config");
    path
}

#[test]
#[serial]
fn test_load_applies_env_over_file() {
    clear_env();
    let path = write_config(
        "database:\n  endpoint: \"file-host:5432\"\ncoalescer:\n  flush_delay: 5s\n",
    );

    std::env::set_var("SESSIONPULSE_FLUSH_DELAY", "750ms");
    std::env::set_var("SESSIONPULSE_REAPER_INTERVAL", "15s");

    let cfg = Config::load(&path).expect("load");
    assert_eq!(cfg.coalescer.flush_delay, Duration::from_millis(750));
    assert_eq!(cfg.reaper.interval, Duration::from_secs(15));
    assert_eq!(cfg.database.endpoint, "file-host:5432");

    clear_env();
    let _ = std::fs::remove_file(path);
}

#[test]
#[serial]
fn test_env_supplies_required_endpoint() {
    clear_env();
    let path = write_config("log_level: warn\n");

    assert!(Config::load(&path).is_err(), "endpoint is required");

    std::env::set_var("SESSIONPULSE_DATABASE_ENDPOINT", "env-host:5432");
    let cfg = Config::load(&path).expect("load");
    assert_eq!(cfg.database.endpoint, "env-host:5432");
    assert_eq!(cfg.log_level, "warn");

    clear_env();
    let _ = std::fs::remove_file(path);
}

#[test]
#[serial]
fn test_env_override_still_validated() {
    clear_env();
    let path = write_config(
        "database:\n  endpoint: \"db:5432\"\ncoalescer:\n  capacity: 10\n  flush_threshold: 5\n",
    );

    std::env::set_var("SESSIONPULSE_FLUSH_THRESHOLD", "50");
    let err = Config::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("flush_threshold"));

    clear_env();
    let _ = std::fs::remove_file(path);
}
