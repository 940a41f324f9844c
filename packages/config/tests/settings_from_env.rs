// ABOUTME: Integration tests for loading engine settings from the process environment
// ABOUTME: Verifies overrides, invalid values falling back, and range validation

use envforge_config::constants::*;
use envforge_config::{ConfigError, EngineSettings};
use serial_test::serial;

fn clear_all() {
    for var in [
        ENVFORGE_TEMPLATE_DIR,
        ENVFORGE_EXTERNAL_ADDRESS,
        ENVFORGE_PORT_RANGE_MIN,
        ENVFORGE_PORT_RANGE_MAX,
        ENVFORGE_BUILD_TIMEOUT_SECS,
        ENVFORGE_DEFAULT_KEEP_ALIVE_SECS,
        ENVFORGE_MAX_IMPORT_DEPTH,
        ENVFORGE_SCRIPT_MAX_OPERATIONS,
        ENVFORGE_PULL_TIMEOUT_SECS,
        ENVFORGE_PROBE_TIMEOUT_SECS,
    ] {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_from_env_defaults() {
    clear_all();
    let settings = EngineSettings::from_env().unwrap();
    assert_eq!(settings, EngineSettings::default());
}

#[test]
#[serial]
fn test_from_env_overrides() {
    clear_all();
    std::env::set_var(ENVFORGE_EXTERNAL_ADDRESS, "10.1.2.3");
    std::env::set_var(ENVFORGE_PORT_RANGE_MIN, "40000");
    std::env::set_var(ENVFORGE_PORT_RANGE_MAX, "40100");
    std::env::set_var(ENVFORGE_TEMPLATE_DIR, "/srv/templates");

    let settings = EngineSettings::from_env().unwrap();
    assert_eq!(settings.external_address, "10.1.2.3");
    assert_eq!(settings.port_range_min, 40000);
    assert_eq!(settings.port_range_max, 40100);
    assert_eq!(settings.template_dir.to_str(), Some("/srv/templates"));

    clear_all();
}

#[test]
#[serial]
fn test_from_env_unparseable_timeout_falls_back() {
    clear_all();
    std::env::set_var(ENVFORGE_BUILD_TIMEOUT_SECS, "soon");

    let settings = EngineSettings::from_env().unwrap();
    assert_eq!(settings.build_timeout_secs, 600);

    clear_all();
}

#[test]
#[serial]
fn test_from_env_inverted_range_is_error() {
    clear_all();
    std::env::set_var(ENVFORGE_PORT_RANGE_MIN, "50000");
    std::env::set_var(ENVFORGE_PORT_RANGE_MAX, "40000");

    let err = EngineSettings::from_env().unwrap_err();
    assert_eq!(
        err,
        ConfigError::InvalidPortRange {
            min: 50000,
            max: 40000
        }
    );

    clear_all();
}
