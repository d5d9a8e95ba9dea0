//! Integration tests for collection state persistence.
//!
//! These tests verify that committed progress survives a restart through the
//! state file, and that failed runs and unreadable files never corrupt it.

use chrono::{DateTime, TimeZone, Utc};
use collector_core::state::{CollectionState, LayoutConfig, StateError};
use tempfile::TempDir;

const DAILY: &str = "{year}/{month}/{day}/{name}.log";

fn day(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap()
}

/// Helper to open a daily state file inside a fresh temp dir.
fn setup_state() -> (CollectionState<LayoutConfig>, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let state = CollectionState::init(LayoutConfig::new(DAILY), state_path(&temp_dir))
        .expect("Failed to init state");
    (state, temp_dir)
}

fn state_path(temp_dir: &TempDir) -> std::path::PathBuf {
    temp_dir.path().join("state").join("app.json")
}

fn reopen(temp_dir: &TempDir) -> CollectionState<LayoutConfig> {
    CollectionState::init(LayoutConfig::new(DAILY), state_path(temp_dir))
        .expect("Failed to reopen state")
}

fn collect_days(state: &CollectionState<LayoutConfig>, days: &[(u32, &str)]) {
    state.start_collection();
    for (d, id) in days {
        state.on_collected(day(*d), id);
    }
}

// ==================== Persistence ====================

#[test]
fn test_committed_progress_survives_restart() {
    let checks = [
        (day(1), "a"),
        (day(1), "other"),
        (day(2), "b"),
        (day(3), "c"),
        (day(3) + chrono::TimeDelta::hours(12), "late"),
        (day(4), "d"),
        (day(5), "e"),
    ];
    let decisions = |state: &CollectionState<LayoutConfig>| -> Vec<bool> {
        checks
            .iter()
            .map(|(ts, id)| state.should_collect(*ts, id))
            .collect()
    };

    let (state, temp_dir) = setup_state();
    collect_days(&state, &[(1, "a"), (2, "b"), (3, "c"), (4, "d")]);
    assert!(state.end_collection());
    let before = decisions(&state);
    assert!(state.save().expect("Failed to save"));
    drop(state);

    let state = reopen(&temp_dir);
    assert_eq!(decisions(&state), before);
    assert!(!state.is_empty());
    assert!(state.last_modified_time().is_some());
    // Earliest boundary and interior are done.
    assert!(!state.should_collect(day(1), "a"));
    assert!(!state.should_collect(day(2), "b"));
    // A new identifier on the boundary and anything later still need collecting.
    assert!(state.should_collect(day(1), "other"));
    assert!(state.should_collect(day(5), "e"));
    // The latest day may still be filling up, so it is collected again.
    assert!(state.should_collect(day(4), "d"));
}

#[test]
fn test_abandoned_run_is_not_persisted() {
    let (state, temp_dir) = setup_state();
    collect_days(&state, &[(1, "a"), (2, "b")]);
    state.abandon_collection();
    state.save().expect("Failed to save");
    drop(state);

    let state = reopen(&temp_dir);
    assert!(state.is_empty());
    assert!(state.should_collect(day(1), "a"));
}

#[test]
fn test_uncommitted_run_is_dropped_on_restart() {
    let (state, temp_dir) = setup_state();
    collect_days(&state, &[(1, "a"), (2, "b")]);
    state.save().expect("Failed to save");
    drop(state);

    let state = reopen(&temp_dir);
    assert!(state.is_empty());
}

#[test]
fn test_save_skips_unchanged_state() {
    let (state, _temp_dir) = setup_state();
    assert!(state.save().expect("Failed to save"));
    assert!(!state.save().expect("Failed to save"));

    collect_days(&state, &[(1, "a"), (3, "c")]);
    state.end_collection();
    assert!(state.save().expect("Failed to save"));
    assert!(state.last_saved_time().is_some());
    assert!(!state.save().expect("Failed to save"));
}

#[test]
fn test_state_file_format() {
    let (state, temp_dir) = setup_state();
    collect_days(&state, &[(1, "a"), (2, "b")]);
    state.end_collection();
    state.save().expect("Failed to save");

    let json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(state_path(&temp_dir)).unwrap()).unwrap();
    assert_eq!(json["version"], 1);
    assert_eq!(json["granularity"], 86_400);
    assert_eq!(json["order"], "chronological");
    assert_eq!(json["ranges"].as_array().map(Vec::len), Some(1));
    assert!(json["last_modified_time"].is_string());
}

#[test]
fn test_in_memory_state_never_saves() {
    let state = CollectionState::new(LayoutConfig::new(DAILY)).unwrap();
    collect_days(&state, &[(1, "a")]);
    state.end_collection();
    assert!(state.path().is_none());
    assert!(!state.save().unwrap());
}

#[test]
fn test_reset_forgets_progress() {
    let (state, temp_dir) = setup_state();
    collect_days(&state, &[(1, "a"), (2, "b"), (3, "c")]);
    state.end_collection();
    state.save().expect("Failed to save");
    drop(state);

    let state = reopen(&temp_dir);
    state.reset(None);
    assert!(state.is_empty());
    state.save().expect("Failed to save");
    drop(state);

    assert!(reopen(&temp_dir).should_collect(day(2), "b"));
}

// ==================== Untimed layouts ====================

#[test]
fn test_untimed_state_deduplicates_by_identifier() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("untimed.json");
    let state = CollectionState::init(LayoutConfig::untimed(), &path).unwrap();
    assert!(state.granularity().is_zero());

    state.start_collection();
    state.on_collected(day(9), "export-1.json");
    state.end_collection();
    state.save().unwrap();
    drop(state);

    let state = CollectionState::init(LayoutConfig::untimed(), &path).unwrap();
    // Any timestamp: only the identifier matters.
    assert!(!state.should_collect(day(1), "export-1.json"));
    assert!(state.should_collect(day(9), "export-2.json"));
}

// ==================== Error Handling ====================

#[test]
fn test_malformed_file_is_rejected_and_kept() {
    let temp_dir = TempDir::new().unwrap();
    let path = state_path(&temp_dir);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{ not json").unwrap();

    let err = CollectionState::init(LayoutConfig::new(DAILY), &path).unwrap_err();
    assert!(matches!(err, StateError::Malformed { .. }), "got {err:?}");
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
}

#[test]
fn test_unsupported_version_is_rejected() {
    let (state, temp_dir) = setup_state();
    state.save().expect("Failed to save");
    drop(state);

    let path = state_path(&temp_dir);
    let mut json: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    json["version"] = serde_json::json!(99);
    std::fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

    let err = CollectionState::init(LayoutConfig::new(DAILY), &path).unwrap_err();
    assert!(
        matches!(err, StateError::UnsupportedVersion { version: 99, .. }),
        "got {err:?}"
    );
}

#[test]
fn test_second_open_is_locked_out() {
    let (state, temp_dir) = setup_state();

    let err = CollectionState::init(LayoutConfig::new(DAILY), state_path(&temp_dir)).unwrap_err();
    assert!(matches!(err, StateError::Locked { .. }), "got {err:?}");

    drop(state);
    reopen(&temp_dir);
}

#[test]
fn test_invalid_layout_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let err = CollectionState::init(
        LayoutConfig::new("{name}/{name}.log"),
        temp_dir.path().join("state.json"),
    )
    .unwrap_err();
    assert!(matches!(err, StateError::InvalidLayout { .. }), "got {err:?}");
}
