//! Integration tests for configuration loading
//!
//! Tests that verify config loading from files and environment variables.

use mpr_compositor::{CompositingMode, EngineConfig};
use serial_test::serial;

#[test]
#[serial]
fn test_default_file_matches_builtin_defaults() {
    let config = EngineConfig::load().unwrap();
    assert_eq!(config, EngineConfig::default());
}

#[test]
#[serial]
fn test_env_override() {
    unsafe {
        std::env::set_var("MPR_GEOMETRY__ROTATED_TOLERANCE_DEGREES", "0.5");
        std::env::set_var("MPR_COMPOSITING__MODE", "checkerboard");
    }
    let config = EngineConfig::load().unwrap();
    unsafe {
        std::env::remove_var("MPR_GEOMETRY__ROTATED_TOLERANCE_DEGREES");
        std::env::remove_var("MPR_COMPOSITING__MODE");
    }
    assert_eq!(config.geometry.rotated_tolerance_degrees, 0.5);
    assert_eq!(config.compositing.mode, CompositingMode::Checkerboard);
    assert_eq!(config.pipeline.max_follow_up_passes, 4);
}

#[test]
#[serial]
fn test_invalid_env_value_is_reported() {
    unsafe {
        std::env::set_var("MPR_PIPELINE__MAX_FOLLOW_UP_PASSES", "many");
    }
    let result = EngineConfig::load();
    unsafe {
        std::env::remove_var("MPR_PIPELINE__MAX_FOLLOW_UP_PASSES");
    }
    assert!(result.is_err());
}
