use std::fs;

use smartnode::loader::LoadStatus;
use smartnode_manager::commands::check::check_components;
use smartnode_manager::commands::load_descriptors;
use tempfile::TempDir;

fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_check_reports_each_component() {
    let dir = TempDir::new().unwrap();
    let components = write(
        &dir,
        "components.json",
        r#"{
            "_order": ["i2c", "htu", "htu2"],
            "i2c": {"package": "machine", "component": "I2C"},
            "htu": {"package": "sensors.htu21d", "component": "HTU21D", "constructor_args": ["i2c"]},
            "htu2": {"package": "sensors.htu21d", "component": "HTU21D", "constructor_args": ["i2c2"]}
        }"#,
    );

    let report = check_components(&components, None, smartnode::default_factories()).unwrap();
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.status("i2c"), Some(LoadStatus::Loaded));
    assert_eq!(report.status("htu"), Some(LoadStatus::Loaded));
    assert_eq!(report.status("htu2"), Some(LoadStatus::Failed));
    assert!(report.summary().contains("1 failed"));
}

#[test]
fn test_check_with_settings_file() {
    let dir = TempDir::new().unwrap();
    let settings = write(
        &dir,
        "node.toml",
        r#"
            device_id = "garden"
            topic_prefix = "yard"

            [supervisor]
            enabled = true
            timeout_secs = 30
        "#,
    );
    let components = write(
        &dir,
        "components.json",
        r#"{"_order": ["i2c"], "i2c": {"package": "machine", "component": "I2C"}}"#,
    );

    let report =
        check_components(&components, Some(settings.as_path()), smartnode::default_factories()).unwrap();
    assert!(report.is_clean(), "{:?}", report);
}

#[test]
fn test_unknown_factory_fails_only_that_component() {
    let dir = TempDir::new().unwrap();
    let components = write(
        &dir,
        "components.json",
        r#"{
            "_order": ["i2c", "relay"],
            "i2c": {"package": "machine", "component": "I2C"},
            "relay": {"package": "actuators.relay", "component": "Relay"}
        }"#,
    );

    let report = check_components(&components, None, smartnode::default_factories()).unwrap();
    assert_eq!(report.status("i2c"), Some(LoadStatus::Loaded));
    assert_eq!(report.status("relay"), Some(LoadStatus::Failed));
}

#[test]
fn test_missing_files_are_errors() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("nope.json");
    let err = load_descriptors(&missing).unwrap_err();
    assert!(format!("{:#}", err).contains("nope.json"));

    let components = write(&dir, "components.json", r#"{"_order": []}"#);
    let settings = dir.path().join("node.toml");
    assert!(check_components(&components, Some(settings.as_path()), smartnode::default_factories()).is_err());
}
